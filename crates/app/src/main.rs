mod collector;
mod problem;
mod redelivery;
mod router;
mod telemetry;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use tracing::info;
use twilio_exporter_twilio::TwilioClient;
use twilio_exporter_util::AppConfig;
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::Metrics::new()?;

    let http = reqwest::Client::builder()
        .timeout(config.scrape.fetch_timeout)
        .build()?;
    let client = TwilioClient::new(
        config.twilio.account_sid.clone(),
        config.twilio.auth_token.clone(),
        Url::parse(&config.twilio.api_base_url)?,
        http,
    );
    info!(stage = "app", account_sid = %client.account_sid(), api_base_url = %config.twilio.api_base_url, "twilio client configured");

    let collector =
        collector::Collector::new(Arc::new(client), config.scrape.clone(), metrics.clone());
    let webhook = router::WebhookSettings {
        secret: Arc::from(config.webhook.secret.as_bytes()),
        public_url: config.webhook.public_url.as_deref().map(Arc::from),
    };
    let redelivery = redelivery::RedeliveryGuard::with_capacity(config.webhook.dedupe_capacity);
    let state = router::AppState::new(metrics, collector, webhook, redelivery);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
