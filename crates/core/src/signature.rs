//! Twilio request signing: HMAC-SHA1 over the request URL followed by every form
//! field (sorted by key, values in encounter order), base64 encoded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::form::FormParams;

pub const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("failed to initialize signature verifier")]
    InvalidKey,
}

/// The exact string that gets signed for `url` and `params`.
pub fn canonical_payload(url: &str, params: &FormParams) -> String {
    let mut payload = String::from(url);
    for (key, values) in params.iter() {
        payload.push_str(key);
        for value in values {
            payload.push_str(value);
        }
    }
    payload
}

pub fn compute_signature(
    secret: &[u8],
    url: &str,
    params: &FormParams,
) -> Result<String, SignatureError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(canonical_payload(url, params).as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Checks `provided` against the signature of already-decoded form fields.
///
/// The comparison runs in constant time for equal-length inputs.
pub fn verify(secret: &[u8], url: &str, params: &FormParams, provided: &str) -> bool {
    let Ok(expected) = compute_signature(secret, url, params) else {
        return false;
    };
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Validates a raw request. Missing headers, undecodable bodies and mismatches are
/// all reported as `false`. The body is only borrowed.
pub fn validate(url: &str, raw_body: &[u8], signature: Option<&str>, secret: &[u8]) -> bool {
    let Some(signature) = signature.filter(|value| !value.is_empty()) else {
        return false;
    };
    let Ok(params) = FormParams::parse(raw_body) else {
        return false;
    };
    verify(secret, url, &params, signature)
}
