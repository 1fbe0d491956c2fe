use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
};
use metrics::counter;
use tracing::{debug, info, warn};

use twilio_exporter_core::form::FormParams;
use twilio_exporter_core::signature::{self, SIGNATURE_HEADER};
use twilio_exporter_core::webhook::{
    CallEvent, CallStatusCallback, MessageEvent, MessageStatusCallback,
};

use crate::problem::ProblemResponse;
use crate::redelivery::CallbackKind;
use crate::router::AppState;

/// `POST /webhooks/message`
pub async fn message_status(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ProblemResponse> {
    let kind = CallbackKind::Message;
    let params = authenticate(&state, kind, &uri, &headers, &body)?;
    let callback = MessageStatusCallback::from_form(&params);

    let event = callback.classify();
    if event == MessageEvent::Unrecorded {
        debug!(stage = "webhook", kind = kind.as_str(), status = %callback.message_status, "status acknowledged without counting");
        count_request(&state, kind, Outcome::Ignored);
        return Ok(StatusCode::OK);
    }
    if !first_delivery(&state, kind, &callback.message_sid, &callback.message_status) {
        count_request(&state, kind, Outcome::Duplicate);
        return Ok(StatusCode::OK);
    }

    state.metrics().record(|| match &event {
        MessageEvent::Delivered => counter!("twilio_messages_delivered_total").increment(1),
        MessageEvent::Failed { error_code } => {
            counter!("twilio_messages_failed_total", "error_code" => error_code.clone())
                .increment(1)
        }
        MessageEvent::Unrecorded => {}
    });
    info!(stage = "webhook", kind = kind.as_str(), status = %callback.message_status, error_code = %callback.error_code, "message status recorded");
    count_request(&state, kind, Outcome::Recorded);
    Ok(StatusCode::OK)
}

/// `POST /webhooks/call`
pub async fn call_status(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ProblemResponse> {
    let kind = CallbackKind::Call;
    let params = authenticate(&state, kind, &uri, &headers, &body)?;
    let callback = CallStatusCallback::from_form(&params);

    let event = callback.classify();
    if event == CallEvent::Unrecorded {
        debug!(stage = "webhook", kind = kind.as_str(), status = %callback.call_status, "status acknowledged without counting");
        count_request(&state, kind, Outcome::Ignored);
        return Ok(StatusCode::OK);
    }
    if !first_delivery(&state, kind, &callback.call_sid, &callback.call_status) {
        count_request(&state, kind, Outcome::Duplicate);
        return Ok(StatusCode::OK);
    }

    state.metrics().record(|| match &event {
        CallEvent::Completed { call_status } => {
            counter!("twilio_calls_completed_total", "call_status" => call_status.clone())
                .increment(1)
        }
        CallEvent::Failed { disconnect_reason } => counter!(
            "twilio_calls_failed_total",
            "disconnect_reason" => disconnect_reason.clone()
        )
        .increment(1),
        CallEvent::Unrecorded => {}
    });
    info!(stage = "webhook", kind = kind.as_str(), status = %callback.call_status, "call status recorded");
    count_request(&state, kind, Outcome::Recorded);
    Ok(StatusCode::OK)
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Recorded,
    Ignored,
    Duplicate,
    BadRequest,
    Unauthorized,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::Ignored => "ignored",
            Self::Duplicate => "duplicate",
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
        }
    }
}

fn count_request(state: &AppState, kind: CallbackKind, outcome: Outcome) {
    state.metrics().record(|| {
        counter!(
            "twilio_webhook_requests_total",
            "kind" => kind.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1)
    });
}

/// Checks the signature header and decodes the form. Nothing is counted
/// against the event counters when this fails.
fn authenticate(
    state: &AppState,
    kind: CallbackKind,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<FormParams, ProblemResponse> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());
    let Some(provided) = provided else {
        return Err(reject_signature(state, kind, "missing signature header"));
    };

    let params = FormParams::parse(body).map_err(|err| {
        warn!(stage = "webhook", kind = kind.as_str(), error = %err, "rejecting malformed form body");
        count_request(state, kind, Outcome::BadRequest);
        ProblemResponse::bad_request(format!("failed to parse form body: {err}"))
    })?;

    let url = signed_url(state.webhook().public_url.as_deref(), uri, headers);
    if !signature::verify(&state.webhook().secret, &url, &params, provided) {
        return Err(reject_signature(state, kind, "signature mismatch"));
    }

    Ok(params)
}

fn reject_signature(state: &AppState, kind: CallbackKind, reason: &'static str) -> ProblemResponse {
    warn!(stage = "webhook", kind = kind.as_str(), reason, "rejecting unauthenticated status callback");
    state.metrics().record(|| {
        counter!("twilio_webhook_invalid_signature_total", "kind" => kind.as_str()).increment(1)
    });
    count_request(state, kind, Outcome::Unauthorized);
    ProblemResponse::unauthorized(reason)
}

fn first_delivery(state: &AppState, kind: CallbackKind, sid: &str, status: &str) -> bool {
    let Some(guard) = state.redelivery() else {
        return true;
    };
    let first = guard.first_delivery(kind, sid, status);
    if !first {
        info!(stage = "webhook", kind = kind.as_str(), %sid, %status, "redelivered status callback ignored");
    }
    first
}

/// The URL the provider signed: the configured public origin when set,
/// otherwise `https://` plus the `Host` header, followed by path and query.
fn signed_url(public_url: Option<&str>, uri: &Uri, headers: &HeaderMap) -> String {
    let path = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or_else(|| uri.path());

    match public_url {
        Some(base) => format!("{}{path}", base.trim_end_matches('/')),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            format!("https://{host}{path}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    use axum::{body::Body, http::Request, response::Response};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use twilio_exporter_core::signature::compute_signature;

    use crate::collector::{
        tests::{settings, FakeSource, Upstream},
        Collector,
    };
    use crate::redelivery::RedeliveryGuard;
    use crate::router::{app_router, WebhookSettings};
    use crate::telemetry::{sample, Metrics};

    const SECRET: &str = "test-token";
    const HOST: &str = "exporter.example.com";

    fn state(public_url: Option<&str>, guard: Option<RedeliveryGuard>) -> AppState {
        state_with_source(FakeSource::new(Upstream::healthy()), public_url, guard)
    }

    fn state_with_source(
        source: FakeSource,
        public_url: Option<&str>,
        guard: Option<RedeliveryGuard>,
    ) -> AppState {
        let metrics = Metrics::new().expect("metrics");
        let collector = Collector::new(Arc::new(source), settings(), metrics.clone());
        let webhook = WebhookSettings {
            secret: Arc::from(SECRET.as_bytes()),
            public_url: public_url.map(Arc::from),
        };
        AppState::new(metrics, collector, webhook, guard)
    }

    fn message_form(sid: &str, status: &str, error_code: &str) -> Vec<(&'static str, String)> {
        vec![
            ("MessageSid", sid.to_string()),
            ("AccountSid", "AC123".to_string()),
            ("MessageStatus", status.to_string()),
            ("ErrorCode", error_code.to_string()),
            ("From", "+15550001111".to_string()),
            ("To", "+15550002222".to_string()),
        ]
    }

    fn call_form(status: &str, source: &str) -> Vec<(&'static str, String)> {
        vec![
            ("CallSid", "CA123".to_string()),
            ("AccountSid", "AC123".to_string()),
            ("From", "+15550001111".to_string()),
            ("To", "+15550002222".to_string()),
            ("CallStatus", status.to_string()),
            ("CallDuration", "12".to_string()),
            ("CallbackSource", source.to_string()),
        ]
    }

    fn sign(url: &str, form: &[(&'static str, String)]) -> String {
        let params: FormParams = form.iter().map(|(key, value)| (*key, value.clone())).collect();
        compute_signature(SECRET.as_bytes(), url, &params).expect("signature")
    }

    async fn post(
        state: &AppState,
        path: &str,
        body: String,
        signature: Option<String>,
    ) -> Response {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::HOST, HOST)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let request = request.body(Body::from(body)).expect("request");
        app_router(state.clone())
            .oneshot(request)
            .await
            .expect("response")
    }

    async fn post_signed(state: &AppState, path: &str, form: &[(&'static str, String)]) -> Response {
        let url = format!("https://{HOST}{path}");
        let body = serde_urlencoded::to_string(form).expect("encode form");
        post(state, path, body, Some(sign(&url, form))).await
    }

    fn rendered(state: &AppState, series: &str) -> Option<f64> {
        sample(&state.metrics().render(), series)
    }

    #[test]
    fn signed_url_reconstruction() {
        let uri: Uri = "/webhooks/message?x=1".parse().expect("uri");
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HOST.parse().expect("host"));

        assert_eq!(
            signed_url(None, &uri, &headers),
            "https://exporter.example.com/webhooks/message?x=1"
        );
        assert_eq!(
            signed_url(Some("https://public.example.net/"), &uri, &headers),
            "https://public.example.net/webhooks/message?x=1"
        );
    }

    #[test]
    fn signature_matches_reference_vector() {
        let form = message_form("SM123", "delivered", "");
        assert_eq!(
            sign("https://exporter.example.com/webhooks/message", &form),
            "n5jQn/zWRjLBa/uX63nevYsfB8s="
        );
    }

    #[tokio::test]
    async fn delivered_message_increments_counter() {
        let state = state(None, None);
        let response = post_signed(
            &state,
            "/webhooks/message",
            &message_form("SM123", "delivered", ""),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rendered(&state, "twilio_messages_delivered_total"), Some(1.0));
        assert_eq!(
            rendered(
                &state,
                "twilio_webhook_requests_total{kind=\"message\",outcome=\"recorded\"}"
            ),
            Some(1.0)
        );

        let body = state.metrics().render();
        assert!(!body.contains("twilio_messages_failed_total{"));
        assert!(!body.contains("twilio_calls_completed_total{"));
        assert!(!body.contains("twilio_calls_failed_total{"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_are_all_counted() {
        const DELIVERIES: usize = 64;
        let state = state(None, None);

        let posts: Vec<_> = (0..DELIVERIES)
            .map(|n| {
                let state = state.clone();
                tokio::spawn(async move {
                    let form = message_form(&format!("SM{n}"), "delivered", "");
                    post_signed(&state, "/webhooks/message", &form).await.status()
                })
            })
            .collect();
        for post in posts {
            assert_eq!(post.await.expect("post task"), StatusCode::OK);
        }

        assert_eq!(
            rendered(&state, "twilio_messages_delivered_total"),
            Some(DELIVERIES as f64)
        );
        assert_eq!(
            rendered(
                &state,
                "twilio_webhook_requests_total{kind=\"message\",outcome=\"recorded\"}"
            ),
            Some(DELIVERIES as f64)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn webhook_is_served_while_reconcile_runs() {
        let state = state_with_source(
            FakeSource::with_delay(Upstream::healthy(), Duration::from_millis(200)),
            None,
            None,
        );

        let collector = state.collector().clone();
        let reconcile = tokio::spawn(async move { collector.reconcile().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = post_signed(
            &state,
            "/webhooks/message",
            &message_form("SM123", "delivered", ""),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!reconcile.is_finished(), "webhook waited for the reconcile pass");
        assert_eq!(rendered(&state, "twilio_messages_delivered_total"), Some(1.0));

        reconcile.await.expect("reconcile task");
        assert_eq!(
            rendered(&state, "twilio_account_balance{currency=\"USD\"}"),
            Some(42.5)
        );
    }

    #[tokio::test]
    async fn failed_message_is_keyed_by_error_code() {
        let state = state(None, None);
        let response = post_signed(
            &state,
            "/webhooks/message",
            &message_form("SM1", "failed", "30007"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = post_signed(
            &state,
            "/webhooks/message",
            &message_form("SM2", "undelivered", ""),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(
            rendered(&state, "twilio_messages_failed_total{error_code=\"30007\"}"),
            Some(1.0)
        );
        assert_eq!(
            rendered(&state, "twilio_messages_failed_total{error_code=\"unknown\"}"),
            Some(1.0)
        );
        assert_eq!(rendered(&state, "twilio_messages_delivered_total"), Some(0.0));
    }

    #[tokio::test]
    async fn intermediate_status_is_acknowledged_without_counting() {
        let state = state(None, None);
        let response = post_signed(
            &state,
            "/webhooks/message",
            &message_form("SM1", "queued", ""),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = state.metrics().render();
        assert_eq!(sample(&body, "twilio_messages_delivered_total"), Some(0.0));
        assert!(!body.contains("twilio_messages_failed_total{"));
        assert_eq!(
            sample(
                &body,
                "twilio_webhook_requests_total{kind=\"message\",outcome=\"ignored\"}"
            ),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected() {
        let state = state(None, None);
        let form = message_form("SM1", "delivered", "");
        let body = serde_urlencoded::to_string(&form).expect("encode form");
        let response = post(
            &state,
            "/webhooks/message",
            body,
            Some("AAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let problem: serde_json::Value = serde_json::from_slice(&bytes).expect("problem json");
        assert_eq!(problem["type"], "invalid_signature");

        assert_eq!(rendered(&state, "twilio_messages_delivered_total"), Some(0.0));
        assert_eq!(
            rendered(
                &state,
                "twilio_webhook_invalid_signature_total{kind=\"message\"}"
            ),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected() {
        let state = state(None, None);
        let body = serde_urlencoded::to_string(call_form("completed", "")).expect("encode form");
        let response = post(&state, "/webhooks/call", body, None).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            rendered(&state, "twilio_webhook_invalid_signature_total{kind=\"call\"}"),
            Some(1.0)
        );
        assert!(!state
            .metrics()
            .render()
            .contains("twilio_calls_completed_total{"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let state = state(None, None);
        let response = post(
            &state,
            "/webhooks/message",
            "MessageStatus=%zz".to_string(),
            Some("c2lnbmF0dXJl".to_string()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            rendered(
                &state,
                "twilio_webhook_requests_total{kind=\"message\",outcome=\"bad_request\"}"
            ),
            Some(1.0)
        );
        assert_eq!(rendered(&state, "twilio_messages_delivered_total"), Some(0.0));
    }

    #[tokio::test]
    async fn call_outcomes_are_counted() {
        let state = state(None, None);
        let response = post_signed(&state, "/webhooks/call", &call_form("completed", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response =
            post_signed(&state, "/webhooks/call", &call_form("busy", "call-progress-events"))
                .await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = post_signed(&state, "/webhooks/call", &call_form("no-answer", "")).await;
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(
            rendered(&state, "twilio_calls_completed_total{call_status=\"completed\"}"),
            Some(1.0)
        );
        assert_eq!(
            rendered(
                &state,
                "twilio_calls_failed_total{disconnect_reason=\"call-progress-events\"}"
            ),
            Some(1.0)
        );
        assert_eq!(
            rendered(&state, "twilio_calls_failed_total{disconnect_reason=\"\"}"),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn redelivery_is_counted_twice_by_default() {
        let state = state(None, None);
        let form = message_form("SM123", "delivered", "");
        post_signed(&state, "/webhooks/message", &form).await;
        post_signed(&state, "/webhooks/message", &form).await;

        assert_eq!(rendered(&state, "twilio_messages_delivered_total"), Some(2.0));
    }

    #[tokio::test]
    async fn redelivery_guard_counts_once() {
        let state = state(None, RedeliveryGuard::with_capacity(16));
        let form = message_form("SM123", "delivered", "");
        let first = post_signed(&state, "/webhooks/message", &form).await;
        let second = post_signed(&state, "/webhooks/message", &form).await;

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(rendered(&state, "twilio_messages_delivered_total"), Some(1.0));
        assert_eq!(
            rendered(
                &state,
                "twilio_webhook_requests_total{kind=\"message\",outcome=\"duplicate\"}"
            ),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn public_url_overrides_host() {
        let state = state(Some("https://public.example.net/"), None);
        let form = message_form("SM9", "delivered", "");
        let body = serde_urlencoded::to_string(&form).expect("encode form");
        let signature = sign("https://public.example.net/webhooks/message", &form);

        let response = post(&state, "/webhooks/message", body, Some(signature)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rendered(&state, "twilio_messages_delivered_total"), Some(1.0));
    }
}
