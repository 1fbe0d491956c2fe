use metrics::{counter, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::{
    fmt as stdfmt,
    sync::{Arc, OnceLock},
    time::Instant,
};
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use twilio_exporter_core::aggregate::{ACCOUNT_BALANCE, CALLS, MESSAGES, MESSAGE_ERRORS, USAGE};
use twilio_exporter_core::gauge::{GaugeFamily, GaugeRegistry, RegistryError};
use twilio_exporter_util::{AppConfig, Environment};

#[derive(Debug)]
pub enum TelemetryError {
    Tracing(tracing_subscriber::util::TryInitError),
    Registry(RegistryError),
}

impl stdfmt::Display for TelemetryError {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        match self {
            Self::Tracing(err) => write!(f, "failed to initialize tracing: {err}"),
            Self::Registry(err) => write!(f, "failed to register metrics: {err}"),
        }
    }
}

impl std::error::Error for TelemetryError {}

impl From<tracing_subscriber::util::TryInitError> for TelemetryError {
    fn from(value: tracing_subscriber::util::TryInitError) -> Self {
        Self::Tracing(value)
    }
}

impl From<RegistryError> for TelemetryError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Maps logrus-style level names onto `EnvFilter` directives.
fn normalize_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "fatal" | "panic" => "error".to_string(),
        other => other.to_string(),
    }
}

fn resolve_filter(log_level: &str) -> (EnvFilter, Option<String>) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return (filter, None);
    }
    let directive = normalize_level(log_level);
    match directive.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => (EnvFilter::new(directive), None),
        _ => (EnvFilter::new("info"), Some(log_level.to_string())),
    }
}

pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let (env_filter, rejected_level) = resolve_filter(&config.log_level);

    match config.environment {
        Environment::Development | Environment::Test => {
            let fmt_layer = tracing_fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_timer(UtcTime::rfc_3339())
                .event_format(tracing_fmt::format().pretty());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
        Environment::Production => {
            let fmt_layer = tracing_fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_timer(UtcTime::rfc_3339())
                .json();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    TRACING_INIT.set(()).ok();
    if let Some(level) = rejected_level {
        tracing::warn!(stage = "telemetry", %level, "invalid LOG_LEVEL value, using default level 'info'");
    }
    tracing::info!(stage = "telemetry", env = %config.environment.as_str(), version = BUILD_VERSION, git_sha = build_git_sha(), "tracing initialized");
    Ok(())
}

/// Gauge families rewritten by each reconciliation pass.
#[derive(Debug, Clone)]
pub struct ScrapeGauges {
    pub balance: Arc<GaugeFamily>,
    pub usage: Arc<GaugeFamily>,
    pub calls: Arc<GaugeFamily>,
    pub messages: Arc<GaugeFamily>,
    pub message_errors: Arc<GaugeFamily>,
}

/// Metric state owned by the process: a Prometheus recorder for counters and
/// histograms, and the registry of replace-on-scrape gauges.
#[derive(Clone)]
pub struct Metrics {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
    registry: Arc<GaugeRegistry>,
    gauges: ScrapeGauges,
    started_at: Instant,
}

impl Metrics {
    /// Builds the recorder and registers every gauge family.
    ///
    /// Registration failures are returned so startup can abort.
    pub fn new() -> Result<Self, TelemetryError> {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let registry = GaugeRegistry::new();
        let gauges = ScrapeGauges {
            balance: registry.register(ACCOUNT_BALANCE)?,
            usage: registry.register(USAGE)?,
            calls: registry.register(CALLS)?,
            messages: registry.register(MESSAGES)?,
            message_errors: registry.register(MESSAGE_ERRORS)?,
        };

        let metrics = Self {
            recorder: Arc::new(recorder),
            handle,
            registry: Arc::new(registry),
            gauges,
            started_at: Instant::now(),
        };
        metrics.record(describe_metrics);
        Ok(metrics)
    }

    /// Runs `f` with this instance installed as the recorder for the `metrics` macros.
    pub fn record<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(self.recorder.as_ref(), f)
    }

    pub fn gauges(&self) -> &ScrapeGauges {
        &self.gauges
    }

    /// Renders counters, histograms and gauges in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut body = self.handle.render();
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        match self.registry.render() {
            Ok(gauges) => body.push_str(&gauges),
            Err(err) => {
                tracing::error!(stage = "telemetry", error = %err, "failed to encode scrape gauges")
            }
        }

        body.push_str("# TYPE app_build_info gauge\n");
        body.push_str(&format!(
            "app_build_info{{version=\"{}\",git=\"{}\"}} 1\n",
            BUILD_VERSION,
            build_git_sha()
        ));
        body.push_str("# TYPE app_uptime_seconds gauge\n");
        body.push_str(&format!(
            "app_uptime_seconds {}\n",
            self.started_at.elapsed().as_secs_f64()
        ));

        body
    }
}

fn describe_metrics() {
    describe_counter!(
        "twilio_messages_delivered_total",
        "Messages reported as delivered by status callbacks"
    );
    describe_counter!(
        "twilio_messages_failed_total",
        "Messages reported as failed or undelivered by status callbacks, labelled by error code"
    );
    describe_counter!(
        "twilio_calls_completed_total",
        "Calls reported as completed by status callbacks, labelled by call status"
    );
    describe_counter!(
        "twilio_calls_failed_total",
        "Calls reported as failed, busy or unanswered by status callbacks, labelled by disconnect reason"
    );
    describe_counter!(
        "twilio_api_errors_total",
        "Failed upstream fetches during reconciliation, labelled by operation"
    );
    describe_counter!(
        "twilio_webhook_invalid_signature_total",
        "Status callbacks rejected because of a missing or invalid signature, labelled by kind"
    );
    describe_counter!(
        "twilio_webhook_requests_total",
        "Status callbacks handled, labelled by kind and outcome"
    );
    describe_histogram!(
        "twilio_scrape_duration_seconds",
        "Duration of a full reconciliation pass in seconds"
    );
    counter!("twilio_messages_delivered_total").increment(0);
}

/// Reads a single sample from a rendered exposition body.
#[cfg(test)]
pub(crate) fn sample(body: &str, series: &str) -> Option<f64> {
    body.lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            line.strip_prefix(series)
                .and_then(|rest| rest.strip_prefix(' '))
                .and_then(|value| value.trim().parse().ok())
        })
}
