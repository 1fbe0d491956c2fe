use std::{future::Future, sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use twilio_exporter_core::aggregate::{self, CALL_STATUS};
use twilio_exporter_core::gauge::RegistryError;
use twilio_exporter_core::types::{BalanceSnapshot, CallRecord, MessageRecord, UsageRecord};
use twilio_exporter_core::window::{ReportWindow, WindowError};
use twilio_exporter_twilio::{TwilioClient, TwilioError};
use twilio_exporter_util::ScrapeConfig;

use crate::telemetry::Metrics;

/// Provider reads needed by a reconciliation pass.
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn fetch_balance(&self) -> Result<Vec<BalanceSnapshot>, TwilioError>;
    async fn fetch_usage_today(&self, limit: u32) -> Result<Vec<UsageRecord>, TwilioError>;
    async fn fetch_calls(
        &self,
        window: &ReportWindow,
        limit: u32,
    ) -> Result<Vec<CallRecord>, TwilioError>;
    async fn fetch_messages(
        &self,
        window: &ReportWindow,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, TwilioError>;
}

#[async_trait]
impl AccountSource for TwilioClient {
    async fn fetch_balance(&self) -> Result<Vec<BalanceSnapshot>, TwilioError> {
        TwilioClient::fetch_balance(self).await
    }

    async fn fetch_usage_today(&self, limit: u32) -> Result<Vec<UsageRecord>, TwilioError> {
        self.list_usage_today(limit).await
    }

    async fn fetch_calls(
        &self,
        window: &ReportWindow,
        limit: u32,
    ) -> Result<Vec<CallRecord>, TwilioError> {
        self.list_calls(window, limit).await
    }

    async fn fetch_messages(
        &self,
        window: &ReportWindow,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, TwilioError> {
        self.list_messages(window, limit).await
    }
}

/// One of the four independent steps of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Balance,
    Usage,
    Calls,
    Messages,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Usage => "usage",
            Self::Calls => "calls",
            Self::Messages => "messages",
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] TwilioError),
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid report window: {0}")]
    Window(#[from] WindowError),
    #[error("failed to publish gauge values: {0}")]
    Gauge(#[from] RegistryError),
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub failed: Vec<Operation>,
    pub series: usize,
}

/// Reconciles provider state into the scrape gauges.
///
/// Passes are serialized: a second caller waits until the in-flight pass has
/// replaced all of its gauges.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    source: Arc<dyn AccountSource>,
    settings: ScrapeConfig,
    metrics: Metrics,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    pass: Mutex<()>,
}

impl Collector {
    pub fn new(source: Arc<dyn AccountSource>, settings: ScrapeConfig, metrics: Metrics) -> Self {
        Self::with_clock(source, settings, metrics, Arc::new(Utc::now))
    }

    pub fn with_clock(
        source: Arc<dyn AccountSource>,
        settings: ScrapeConfig,
        metrics: Metrics,
        clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                source,
                settings,
                metrics,
                clock,
                pass: Mutex::new(()),
            }),
        }
    }

    /// Runs the four fetch-and-replace steps. A failed step keeps its previous
    /// gauge values and increments `twilio_api_errors_total{operation}`.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconcile_then(|report| report).await
    }

    /// Runs a pass and then `read` before releasing the pass lock, so `read`
    /// never observes gauges from a later pass that is still in flight.
    pub async fn reconcile_then<T>(&self, read: impl FnOnce(ReconcileReport) -> T) -> T {
        let _pass = self.inner.pass.lock().await;
        let report = self.run_pass().await;
        read(report)
    }

    async fn run_pass(&self) -> ReconcileReport {
        let start = Instant::now();
        let now = (self.inner.clock)();

        let outcomes = [
            (Operation::Balance, self.reconcile_balance().await),
            (Operation::Usage, self.reconcile_usage().await),
            (Operation::Calls, self.reconcile_calls(now).await),
            (Operation::Messages, self.reconcile_messages(now).await),
        ];

        let mut report = ReconcileReport::default();
        for (operation, outcome) in outcomes {
            match outcome {
                Ok(series) => {
                    debug!(stage = "collector", operation = operation.as_str(), series, "gauges replaced");
                    report.series += series;
                }
                Err(err) => {
                    error!(stage = "collector", operation = operation.as_str(), error = %err, "fetch failed, keeping previous values");
                    self.inner.metrics.record(|| {
                        counter!("twilio_api_errors_total", "operation" => operation.as_str())
                            .increment(1)
                    });
                    report.failed.push(operation);
                }
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        self.inner
            .metrics
            .record(|| histogram!("twilio_scrape_duration_seconds").record(elapsed));
        info!(
            stage = "collector",
            series = report.series,
            failed = report.failed.len(),
            elapsed_secs = elapsed,
            "reconciliation finished"
        );
        report
    }

    async fn reconcile_balance(&self) -> Result<usize, CollectError> {
        let records = self.bounded(self.inner.source.fetch_balance()).await?;
        let values = aggregate::balance_values(&records, self.inner.settings.skip_missing);
        let series = values.len();
        self.inner.metrics.gauges().balance.replace(values)?;
        Ok(series)
    }

    async fn reconcile_usage(&self) -> Result<usize, CollectError> {
        let records = self
            .bounded(
                self.inner
                    .source
                    .fetch_usage_today(self.inner.settings.record_limit),
            )
            .await?;
        let values = aggregate::usage_values(&records, self.inner.settings.skip_missing);
        let series = values.len();
        self.inner.metrics.gauges().usage.replace(values)?;
        Ok(series)
    }

    async fn reconcile_calls(&self, now: DateTime<Utc>) -> Result<usize, CollectError> {
        let window = self.window(now)?;
        let records = self
            .bounded(
                self.inner
                    .source
                    .fetch_calls(&window, self.inner.settings.record_limit),
            )
            .await?;
        let values = aggregate::count_by(&records, &CALL_STATUS);
        let series = values.len();
        self.inner.metrics.gauges().calls.replace(values)?;
        Ok(series)
    }

    async fn reconcile_messages(&self, now: DateTime<Utc>) -> Result<usize, CollectError> {
        let window = self.window(now)?;
        let records = self
            .bounded(
                self.inner
                    .source
                    .fetch_messages(&window, self.inner.settings.record_limit),
            )
            .await?;
        let breakdown = aggregate::message_breakdown(&records);
        let series = breakdown.by_status.len() + breakdown.by_error_code.len();
        let gauges = self.inner.metrics.gauges();
        gauges.messages.replace(breakdown.by_status)?;
        gauges.message_errors.replace(breakdown.by_error_code)?;
        Ok(series)
    }

    fn window(&self, now: DateTime<Utc>) -> Result<ReportWindow, WindowError> {
        ReportWindow::resolve(
            now,
            &self.inner.settings.start_offset,
            &self.inner.settings.duration,
        )
    }

    async fn bounded<T>(
        &self,
        fetch: impl Future<Output = Result<T, TwilioError>>,
    ) -> Result<T, CollectError> {
        let limit = self.inner.settings.fetch_timeout;
        match tokio::time::timeout(limit, fetch).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CollectError::Timeout(limit)),
        }
    }
}
