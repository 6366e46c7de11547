use tracing_subscriber::EnvFilter;

/// Initialize structured logging for the CLI and worker.
///
/// `RUST_LOG` wins when set; otherwise the `--log-level` flag applies to
/// every crate in the workspace. Targets are suppressed because the
/// structured fields (table, worker, strategy) already locate the event.
pub fn init(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},sqlparser=warn")));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
