//! Engine configuration.
//!
//! Every knob has a sensible default and can be overridden through a
//! `FRESHET_*` environment variable. Durations are plain seconds.

use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration for workers, the scheduler, and the CLI.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Metadata store URL. `sqlite:<path>` or a libpq-style string.
    pub metadata_url: String,
    /// DuckLake attach URI (e.g. `ducklake:postgres:dbname=lakemeta`).
    pub lake_url: String,
    /// Optional DATA_PATH for the lake attach.
    pub lake_data_path: Option<String>,
    /// Main-loop poll interval.
    pub poll_interval: Duration,
    /// Claim expiry: a claim whose heartbeat is older than this is dead.
    pub claim_timeout: Duration,
    /// Cadence of claim and subtask heartbeats.
    pub heartbeat_interval: Duration,
    /// Hard ceiling on one refresh attempt.
    pub refresh_timeout: Duration,
    /// Hard ceiling on the coordinator's wait for subtasks.
    pub coordinator_wait_timeout: Duration,
    /// Cadence of the coordinator's subtask status polls.
    pub coordinator_poll_interval: Duration,
    /// Scheduler tick interval.
    pub scheduler_interval: Duration,
    /// Transient-lake retries within one refresh attempt.
    pub max_retries: u32,
    /// Subtask re-queue budget.
    pub subtask_retry_max: u32,
    /// Prometheus listener address (with the `prometheus` feature).
    pub metrics_addr: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metadata_url: "sqlite:freshet-meta.db".to_string(),
            lake_url: "ducklake:freshet-lake.ducklake".to_string(),
            lake_data_path: None,
            poll_interval: Duration::from_secs(60),
            claim_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(3_600),
            coordinator_wait_timeout: Duration::from_secs(3_600),
            coordinator_poll_interval: Duration::from_secs(5),
            scheduler_interval: Duration::from_secs(60),
            max_retries: 3,
            subtask_retry_max: 3,
            metrics_addr: None,
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{name} must be a number of seconds, got '{raw}'"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be an integer, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Load configuration from `FRESHET_*` environment variables, falling
    /// back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when a set variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            metadata_url: std::env::var("FRESHET_METADATA_URL").unwrap_or(d.metadata_url),
            lake_url: std::env::var("FRESHET_LAKE_URL").unwrap_or(d.lake_url),
            lake_data_path: std::env::var("FRESHET_LAKE_DATA_PATH").ok(),
            poll_interval: env_secs("FRESHET_POLL_INTERVAL", d.poll_interval)?,
            claim_timeout: env_secs("FRESHET_CLAIM_TIMEOUT", d.claim_timeout)?,
            heartbeat_interval: env_secs("FRESHET_HEARTBEAT_INTERVAL", d.heartbeat_interval)?,
            refresh_timeout: env_secs("FRESHET_REFRESH_TIMEOUT", d.refresh_timeout)?,
            coordinator_wait_timeout: env_secs(
                "FRESHET_COORDINATOR_WAIT_TIMEOUT",
                d.coordinator_wait_timeout,
            )?,
            coordinator_poll_interval: env_secs(
                "FRESHET_COORDINATOR_POLL_INTERVAL",
                d.coordinator_poll_interval,
            )?,
            scheduler_interval: env_secs("FRESHET_SCHEDULER_INTERVAL", d.scheduler_interval)?,
            max_retries: env_u32("FRESHET_MAX_RETRIES", d.max_retries)?,
            subtask_retry_max: env_u32("FRESHET_SUBTASK_RETRY_MAX", d.subtask_retry_max)?,
            metrics_addr: std::env::var("FRESHET_METRICS_ADDR").ok(),
        })
    }

    /// Shutdown hard deadline after a graceful stop request.
    #[must_use]
    pub fn shutdown_deadline(&self) -> Duration {
        self.claim_timeout * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.poll_interval, Duration::from_secs(60));
        assert_eq!(c.claim_timeout, Duration::from_secs(300));
        assert_eq!(c.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(c.refresh_timeout, Duration::from_secs(3_600));
        assert_eq!(c.coordinator_wait_timeout, Duration::from_secs(3_600));
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.subtask_retry_max, 3);
        assert_eq!(c.shutdown_deadline(), Duration::from_secs(600));
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("FRESHET_POLL_INTERVAL", "5");
        std::env::set_var("FRESHET_MAX_RETRIES", "7");
        let c = EngineConfig::from_env().unwrap();
        assert_eq!(c.poll_interval, Duration::from_secs(5));
        assert_eq!(c.max_retries, 7);
        std::env::remove_var("FRESHET_POLL_INTERVAL");
        std::env::remove_var("FRESHET_MAX_RETRIES");
    }

    #[test]
    fn bad_env_value_is_an_error() {
        std::env::set_var("FRESHET_CLAIM_TIMEOUT", "soon");
        assert!(EngineConfig::from_env().is_err());
        std::env::remove_var("FRESHET_CLAIM_TIMEOUT");
    }
}
