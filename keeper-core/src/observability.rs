/*!
Observability infrastructure for Keeper.

This module provides:
- Structured logging setup (human-readable or JSON)
- Prometheus metrics for backup cycles, behind the `metrics` feature

The `record_*` helpers are always available and do nothing when the feature
is disabled, so pipeline code can call them unconditionally.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::{KeeperError, Result};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<KeeperMetrics>> = OnceLock::new();

/// Metrics collected across backup cycles
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct KeeperMetrics {
    pub blobs_copied_total: Counter,
    pub blobs_skipped_total: Counter,
    pub upload_retries_total: Counter,
    pub snapshots_uploaded_total: Counter,
    pub snapshots_unchanged_total: Counter,
    pub snapshots_pruned_total: Counter,
    pub prune_failures_total: Counter,
    pub cycles_aborted_total: Counter,
    pub cycle_duration_seconds: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| KeeperError::config(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| KeeperError::config(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
impl KeeperMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycle_duration_seconds = Histogram::with_opts(prometheus::HistogramOpts::new(
            "keeper_cycle_duration_seconds",
            "Duration of backup cycles in seconds",
        ))
        .map_err(|e| {
            KeeperError::config(format!("Failed to create cycle_duration_seconds metric: {e}"))
        })?;
        registry
            .register(Box::new(cycle_duration_seconds.clone()))
            .map_err(|e| {
                KeeperError::config(format!("Failed to register cycle_duration_seconds: {e}"))
            })?;

        Ok(Self {
            blobs_copied_total: counter(
                &registry,
                "keeper_blobs_copied_total",
                "Blob files uploaded by the mirror",
            )?,
            blobs_skipped_total: counter(
                &registry,
                "keeper_blobs_skipped_total",
                "Blob files already present remotely",
            )?,
            upload_retries_total: counter(
                &registry,
                "keeper_upload_retries_total",
                "Blob uploads retried after a transient failure",
            )?,
            snapshots_uploaded_total: counter(
                &registry,
                "keeper_snapshots_uploaded_total",
                "Snapshot archives uploaded",
            )?,
            snapshots_unchanged_total: counter(
                &registry,
                "keeper_snapshots_unchanged_total",
                "Snapshot uploads skipped because the digest was already stored",
            )?,
            snapshots_pruned_total: counter(
                &registry,
                "keeper_snapshots_pruned_total",
                "Old snapshots deleted by retention",
            )?,
            prune_failures_total: counter(
                &registry,
                "keeper_prune_failures_total",
                "Snapshot deletions that failed",
            )?,
            cycles_aborted_total: counter(
                &registry,
                "keeper_cycles_aborted_total",
                "Backup cycles aborted by an error",
            )?,
            cycle_duration_seconds,
            registry,
        })
    }

    /// Global metrics instance, or `None` if the registry could not be built
    pub fn global() -> Option<&'static KeeperMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to initialize metrics");
                    None
                }
            })
            .as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| KeeperError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| KeeperError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Record the outcome of one blob directory sync
pub fn record_blob_sync(copied: usize, skipped: usize) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeeperMetrics::global() {
        metrics.blobs_copied_total.inc_by(copied as f64);
        metrics.blobs_skipped_total.inc_by(skipped as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (copied, skipped);
}

/// Record a retried upload attempt
pub fn record_upload_retry() {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeeperMetrics::global() {
        metrics.upload_retries_total.inc();
    }
}

/// Record a snapshot check; `uploaded` is false when the digest was already stored
pub fn record_snapshot(uploaded: bool) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeeperMetrics::global() {
        if uploaded {
            metrics.snapshots_uploaded_total.inc();
        } else {
            metrics.snapshots_unchanged_total.inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = uploaded;
}

/// Record a retention pass
pub fn record_prune(deleted: usize, failed: usize) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeeperMetrics::global() {
        metrics.snapshots_pruned_total.inc_by(deleted as f64);
        metrics.prune_failures_total.inc_by(failed as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (deleted, failed);
}

/// Record a finished cycle
pub fn record_cycle(duration: Duration, aborted: bool) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeeperMetrics::global() {
        metrics.cycle_duration_seconds.observe(duration.as_secs_f64());
        if aborted {
            metrics.cycles_aborted_total.inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (duration, aborted);
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set. Otherwise Keeper logs at `info`, or `debug`
/// with `verbose`, and the AWS SDK stays at `warn`.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{level},aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn,hyper=warn"
        ))
    });

    let result = if json {
        let layer = fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(true);
        set_global_default(TracingRegistry::default().with(filter).with(layer))
    } else {
        let layer = fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(layer))
    };
    result.map_err(|e| KeeperError::config(format!("Failed to set global tracing subscriber: {e}")))?;

    #[cfg(feature = "metrics")]
    KeeperMetrics::global();

    tracing::debug!(json, verbose, "Logging initialized");
    Ok(())
}
