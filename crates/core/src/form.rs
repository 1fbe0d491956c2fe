use std::collections::BTreeMap;

use thiserror::Error;
use url::form_urlencoded;

/// Decoded `application/x-www-form-urlencoded` body.
///
/// Keys iterate in ascending byte order; repeated keys keep every value in the
/// order it appeared in the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormParams {
    fields: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("form body is not valid UTF-8")]
    NotUtf8,
    #[error("malformed percent-escape at byte {0}")]
    InvalidEscape(usize),
}

impl FormParams {
    /// Decodes a raw form body without taking ownership of it.
    pub fn parse(body: &[u8]) -> Result<Self, FormError> {
        std::str::from_utf8(body).map_err(|_| FormError::NotUtf8)?;
        check_escapes(body)?;

        let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in form_urlencoded::parse(body) {
            fields
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        Ok(Self { fields })
    }

    /// First value of `key`, or the empty string when absent.
    pub fn get(&self, key: &str) -> &str {
        self.fields
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for FormParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in iter {
            fields.entry(key.into()).or_default().push(value.into());
        }
        Self { fields }
    }
}

fn check_escapes(body: &[u8]) -> Result<(), FormError> {
    let mut index = 0;
    while index < body.len() {
        if body[index] == b'%' {
            let valid = body
                .get(index + 1..index + 3)
                .is_some_and(|pair| pair.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(FormError::InvalidEscape(index));
            }
            index += 3;
        } else {
            index += 1;
        }
    }
    Ok(())
}
