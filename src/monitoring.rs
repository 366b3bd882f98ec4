use crate::{error::SyncError, session::SessionStats};
use anyhow::Result;
use metrics::{Counter, Gauge, counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::LazyLock};
use tracing::{error, info};

// Global metrics
pub static BATCHES_APPLIED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("gridsync_batches_applied_total"));
pub static STALE_BATCHES_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("gridsync_stale_batches_total"));
pub static PROTOCOL_WARNINGS_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("gridsync_protocol_warnings_total"));
pub static VIEWPORT_REQUESTS_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("gridsync_viewport_requests_total"));
pub static FATAL_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("gridsync_fatal_errors_total"));
pub static POOL_PARENTS_GAUGE: LazyLock<Gauge> =
    LazyLock::new(|| gauge!("gridsync_pool_parents"));

pub async fn setup_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "analytics-gridsync")
        .add_global_label("version", env!("CARGO_PKG_VERSION"));

    match builder.install() {
        Ok(_handle) => {
            info!(
                "Prometheus metrics server started on http://{}/metrics",
                addr
            );

            BATCHES_APPLIED_COUNTER.absolute(0);
            STALE_BATCHES_COUNTER.absolute(0);
            PROTOCOL_WARNINGS_COUNTER.absolute(0);
            VIEWPORT_REQUESTS_COUNTER.absolute(0);
            FATAL_COUNTER.absolute(0);
            POOL_PARENTS_GAUGE.set(0.0);

            Ok(())
        }
        Err(e) => {
            error!("Failed to start metrics server: {}", e);
            Err(SyncError::MetricsError(e.to_string()).into())
        }
    }
}

/// Publishes whatever the counters of one session moved by since `before`.
pub fn record_session(before: &SessionStats, after: &SessionStats) {
    let delta = |a: u64, b: u64| b.saturating_sub(a);
    BATCHES_APPLIED_COUNTER.increment(delta(before.batches_applied, after.batches_applied));
    STALE_BATCHES_COUNTER.increment(delta(before.stale_batches, after.stale_batches));
    PROTOCOL_WARNINGS_COUNTER.increment(delta(before.protocol_warnings, after.protocol_warnings));
    VIEWPORT_REQUESTS_COUNTER.increment(delta(before.viewport_requests, after.viewport_requests));
}
