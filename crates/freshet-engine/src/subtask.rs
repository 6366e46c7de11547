//! Subtask execution: one partition of a parallel affected-keys refresh.

use std::ops::ControlFlow;

use tokio_util::sync::CancellationToken;

use freshet_types::{RefreshError, Subtask};

use freshet_lake::Lake as _;
use freshet_meta::MetaStore as _;

use crate::context::WorkerContext;
use crate::errors::EngineError;
use crate::executor::with_retries;
use crate::metrics;
use crate::sqlbuild;
use crate::ticker;

/// Claim and execute one pending subtask, if any exists. Returns whether
/// a subtask was claimed.
///
/// The partition result lands in a fresh named table
/// (`temp_<id>_<random>`) which the coordinator merges and drops; this
/// worker only reports success or a classified failure on the subtask
/// row. A lost heartbeat abandons the work silently; the sweeper owns
/// re-queueing.
///
/// # Errors
///
/// Returns an error only for metadata-store failures around the claim
/// itself; execution failures are recorded on the subtask row.
pub async fn try_run_subtask(ctx: &WorkerContext) -> Result<bool, EngineError> {
    let Some(subtask) = ctx.meta.claim_subtask(&ctx.worker_id)? else {
        return Ok(false);
    };
    tracing::info!(
        id = subtask.id,
        table = %subtask.dynamic_table,
        kind = subtask.payload.spec.kind(),
        "Claimed subtask"
    );

    let lost = CancellationToken::new();
    let heartbeat = spawn_subtask_heartbeat(ctx, subtask.id, lost.clone());

    let result = tokio::select! {
        () = lost.cancelled() => {
            // The claim is no longer ours; leave the row to the sweeper.
            tracing::warn!(id = subtask.id, "Subtask heartbeat lost; abandoning execution");
            heartbeat.abort();
            return Ok(true);
        }
        r = execute_subtask(ctx, &subtask) => r,
    };

    lost.cancel();
    let _ = heartbeat.await;

    match result {
        Ok(location) => {
            ctx.meta
                .complete_subtask(subtask.id, &ctx.worker_id, &location)?;
            metrics::record_subtask(true);
            tracing::info!(id = subtask.id, location, "Subtask completed");
        }
        Err(e) => {
            ctx.meta.fail_subtask(subtask.id, &e.to_string())?;
            metrics::record_subtask(false);
            tracing::warn!(id = subtask.id, "Subtask failed: {e}");
        }
    }
    Ok(true)
}

/// Materialize the partition-scoped result: the definition query pinned at
/// the coordinator's snapshot map, restricted to the affected keys that
/// fall in this partition.
async fn execute_subtask(ctx: &WorkerContext, subtask: &Subtask) -> Result<String, EngineError> {
    let table = ctx
        .meta
        .get_table(&subtask.dynamic_table)?
        .ok_or_else(|| {
            EngineError::Refresh(RefreshError::definitional(
                "TABLE_GONE",
                format!("dynamic table '{}' no longer exists", subtask.dynamic_table),
            ))
        })?;
    let shape = freshet_sql::analyze_query(&table.query_sql)?;

    let exclude = table
        .upstream_dynamic()
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    let pinned = freshet_sql::pin_snapshots(&table.query_sql, &subtask.payload.pins, &exclude)?;

    let partition = sqlbuild::partition_predicate(&subtask.payload.spec);
    let predicate = sqlbuild::keys_in_predicate(
        &shape.grouping_key_exprs,
        &table.grouping_keys,
        &subtask.payload.keys_table,
        Some(&partition),
    );
    let scoped = freshet_sql::add_predicate(&pinned, &predicate)?;

    let location = sqlbuild::subtask_result_name(subtask.id);
    with_retries(ctx.config.max_retries, || {
        create_result(ctx, location.clone(), scoped.clone())
    })
    .await?;
    Ok(location)
}

async fn create_result(
    ctx: &WorkerContext,
    location: String,
    select: String,
) -> Result<(), EngineError> {
    ctx.lake
        .create_table_as(&location, &select)
        .await
        .map_err(EngineError::from)
}

fn spawn_subtask_heartbeat(
    ctx: &WorkerContext,
    id: i64,
    lost: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let stop = lost.clone();
        ticker::every(ctx.config.heartbeat_interval, &stop, move || {
            let ctx = ctx.clone();
            let lost = lost.clone();
            async move {
                match ctx.meta.heartbeat_subtask(id, &ctx.worker_id) {
                    Ok(true) => ControlFlow::Continue(()),
                    Ok(false) => {
                        lost.cancel();
                        ControlFlow::Break(())
                    }
                    Err(e) => {
                        tracing::warn!(id, "Subtask heartbeat write failed: {e}");
                        lost.cancel();
                        ControlFlow::Break(())
                    }
                }
            }
        })
        .await;
    })
}
