//! Engine metrics over the `metrics` facade.
//!
//! Recording works with or without an installed exporter; the Prometheus
//! HTTP listener is enabled by the `prometheus` cargo feature and
//! `metrics_addr` in the config.
//!
//! Naming: `freshet_<component>_<name>[_<unit>]`.

use freshet_types::{RefreshOutcome, StrategyKind};

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
static EXPORTER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Start the Prometheus exporter serving `/metrics`. Safe to call more
/// than once; only the first call installs.
///
/// # Errors
///
/// Returns an error when `addr` does not parse as a socket address.
#[cfg(feature = "prometheus")]
pub fn init_exporter(addr: &str) -> anyhow::Result<()> {
    use anyhow::Context;

    let addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics address '{addr}'"))?;
    EXPORTER_INSTALLED.get_or_init(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => {
                tracing::info!(%addr, "Prometheus metrics listener started");
            }
            Err(e) => {
                tracing::error!(%addr, "Failed to start Prometheus exporter: {e}");
            }
        }
    });
    Ok(())
}

/// Record one finished refresh attempt.
pub fn record_refresh(strategy: StrategyKind, outcome: RefreshOutcome, duration_ms: i64) {
    metrics::counter!(
        "freshet_refresh_total",
        "strategy" => strategy.as_str(),
        "outcome" => outcome.as_str(),
    )
    .increment(1);
    #[allow(clippy::cast_precision_loss)]
    metrics::histogram!(
        "freshet_refresh_duration_seconds",
        "strategy" => strategy.as_str(),
    )
    .record(duration_ms as f64 / 1_000.0);
}

/// Record one finished subtask.
pub fn record_subtask(succeeded: bool) {
    let outcome = if succeeded { "completed" } else { "failed" };
    metrics::counter!("freshet_subtasks_total", "outcome" => outcome).increment(1);
}

/// Gauge: tables found due in the latest scheduler tick.
pub fn record_due_tables(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!("freshet_scheduler_due_tables").set(count as f64);
}

/// Counter: claims expired by the sweeper.
pub fn record_expired_claims(count: usize) {
    metrics::counter!("freshet_claims_expired_total").increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_an_exporter_is_a_no_op() {
        // The facade must accept records with no recorder installed.
        record_refresh(StrategyKind::Full, RefreshOutcome::Success, 1_234);
        record_subtask(true);
        record_subtask(false);
        record_due_tables(3);
        record_expired_claims(1);
    }
}
