use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use crate::collector::Collector;
use crate::redelivery::RedeliveryGuard;
use crate::telemetry::Metrics;
use crate::webhook;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Secret and URL settings used to authenticate status callbacks.
#[derive(Clone)]
pub struct WebhookSettings {
    pub secret: Arc<[u8]>,
    pub public_url: Option<Arc<str>>,
}

#[derive(Clone)]
pub struct AppState {
    metrics: Metrics,
    collector: Collector,
    webhook: WebhookSettings,
    redelivery: Option<RedeliveryGuard>,
}

impl AppState {
    pub fn new(
        metrics: Metrics,
        collector: Collector,
        webhook: WebhookSettings,
        redelivery: Option<RedeliveryGuard>,
    ) -> Self {
        Self {
            metrics,
            collector,
            webhook,
            redelivery,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn webhook(&self) -> &WebhookSettings {
        &self.webhook
    }

    pub fn redelivery(&self) -> Option<&RedeliveryGuard> {
        self.redelivery.as_ref()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/webhooks/message", post(webhook::message_status))
        .route("/webhooks/call", post(webhook::call_status))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK\n"
}

/// Reconciles provider state, then renders every metric family. Upstream
/// failures only show up in `twilio_api_errors_total`; the scrape itself
/// always succeeds.
async fn metrics(State(state): State<AppState>) -> Response {
    let metrics = state.metrics().clone();
    let body = state
        .collector()
        .reconcile_then(move |_| metrics.render())
        .await;

    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
    );
    response
}
