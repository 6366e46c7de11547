use anyhow::Result;

use freshet_engine::{worker, EngineConfig, WorkerContext};

/// Execute the `worker` command: run the poll loop until ctrl-c, with
/// graceful shutdown (in-flight work finishes, then claims release).
pub async fn execute(config: EngineConfig, with_scheduler: bool) -> Result<()> {
    let meta = super::open_meta(&config)?;
    let lake = super::open_lake(&config)?;

    #[cfg(feature = "prometheus")]
    if let Some(addr) = &config.metrics_addr {
        freshet_engine::metrics::init_exporter(addr)?;
    }

    let ctx = WorkerContext::new(meta, lake, config);

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested; finishing in-flight work");
            cancel.cancel();
        }
    });

    worker::run_worker(ctx, with_scheduler).await
}
