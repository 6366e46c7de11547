//! Worker main loop.
//!
//! Per poll, in priority order: claim one due table-level refresh, else
//! claim one pending subtask, else sleep. A claimed refresh runs under a
//! heartbeat task and a refresh timeout; graceful shutdown stops new work,
//! lets the in-flight piece finish, and aborts at a hard deadline.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use freshet_lake::Lake as _;
use freshet_meta::MetaStore as _;

use freshet_types::{
    now_iso, DynamicTable, ErrorKind, PendingRefresh, RefreshError, TableName, TableStatus,
};

use crate::claims;
use crate::context::WorkerContext;
use crate::errors::EngineError;
use crate::executor;
use crate::scheduler;
use crate::subtask;
use crate::ticker;

/// Run the worker loop until shutdown. With `with_scheduler`, a scheduler
/// tick runs in the same process at its own interval.
///
/// # Errors
///
/// Returns an error only for unrecoverable startup problems; runtime
/// failures are logged and the loop keeps polling.
pub async fn run_worker(ctx: WorkerContext, with_scheduler: bool) -> anyhow::Result<()> {
    tracing::info!(worker = %ctx.worker_id, with_scheduler, "Worker started");
    let mut last_tick: Option<Instant> = None;

    while !ctx.cancel.is_cancelled() {
        if with_scheduler
            && last_tick.map_or(true, |t| t.elapsed() >= ctx.config.scheduler_interval)
        {
            match scheduler::run_tick(&ctx).await {
                Ok(report) if !report.due.is_empty() => {
                    tracing::info!(due = report.due.len(), "Scheduler enqueued work");
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Scheduler tick failed: {e}"),
            }
            last_tick = Some(Instant::now());
        }

        let worked = match poll_once(&ctx).await {
            Ok(worked) => worked,
            Err(e) => {
                tracing::error!("Worker poll failed: {e}");
                false
            }
        };

        if !worked && !ticker::sleep(ctx.config.poll_interval, &ctx.cancel).await {
            break;
        }
    }

    tracing::info!(worker = %ctx.worker_id, "Worker stopped");
    Ok(())
}

/// One poll: table-level refresh first, subtask second. Returns whether
/// any work was claimed.
async fn poll_once(ctx: &WorkerContext) -> Result<bool, EngineError> {
    let due = ctx.meta.due_refreshes(&now_iso())?;
    for pending in due {
        if ctx.cancel.is_cancelled() {
            return Ok(false);
        }
        if claims::try_claim(ctx, &pending.dynamic_table)?.is_none() {
            continue;
        }
        process_refresh(ctx, &pending).await;
        return Ok(true);
    }
    subtask::try_run_subtask(ctx).await
}

/// Run one claimed refresh end to end: readiness checks, heartbeat task,
/// timeout, outcome handling, claim release.
async fn process_refresh(ctx: &WorkerContext, pending: &PendingRefresh) {
    let table_name = &pending.dynamic_table;
    let table = match ctx.meta.get_table(table_name) {
        Ok(Some(table)) => table,
        Ok(None) => {
            // Dropped between enqueue and claim.
            let _ = ctx.meta.delete_pending(table_name);
            claims::release(ctx, table_name);
            return;
        }
        Err(e) => {
            tracing::error!(table = %table_name, "Failed to load table: {e}");
            claims::release(ctx, table_name);
            return;
        }
    };

    if table.status != TableStatus::Active {
        let _ = ctx.meta.delete_pending(table_name);
        claims::release(ctx, table_name);
        return;
    }

    // Dependent bootstraps run upstream-first: postpone while a dynamic
    // upstream has never produced a usable state.
    match upstream_not_ready(ctx, &table) {
        Ok(None) => {}
        Ok(Some(upstream)) => {
            tracing::debug!(table = %table_name, upstream, "Postponing: upstream not yet populated");
            claims::release(ctx, table_name);
            return;
        }
        Err(e) => {
            tracing::error!(table = %table_name, "Upstream readiness check failed: {e}");
            claims::release(ctx, table_name);
            return;
        }
    }

    // Heartbeat for the life of the refresh; loss aborts it. Shutdown
    // does NOT abort directly; the hard deadline does.
    let refresh_cancel = CancellationToken::new();
    let heartbeat = claims::spawn_heartbeat(ctx, table_name.clone(), refresh_cancel.clone());
    let hard_deadline = spawn_hard_deadline(ctx, refresh_cancel.clone());

    let outcome = tokio::select! {
        () = refresh_cancel.cancelled() => Err(EngineError::Refresh(RefreshError::coordination(
            "CLAIM_LOST",
            "refresh aborted: claim lost or shutdown deadline reached",
        ))),
        result = tokio::time::timeout(
            ctx.config.refresh_timeout,
            executor::execute_refresh(ctx, &table, pending.trigger),
        ) => match result {
            Ok(inner) => inner,
            Err(_elapsed) => Err(EngineError::Refresh(RefreshError::transient_lake(
                "REFRESH_TIMEOUT",
                format!(
                    "refresh exceeded {}s",
                    ctx.config.refresh_timeout.as_secs()
                ),
            ))),
        },
    };

    refresh_cancel.cancel();
    let _ = heartbeat.await;
    hard_deadline.abort();

    match outcome {
        Ok(_) => {
            let _ = ctx.meta.delete_pending(table_name);
            claims::release(ctx, table_name);
        }
        Err(err) => {
            // The executor rolls back its own transaction, but an aborted
            // future may not have reached its failure path.
            if let Err(e) = ctx.lake.rollback().await {
                tracing::warn!(table = %table_name, "Post-abort rollback failed: {e}");
            }
            handle_refresh_failure(ctx, &table, &err);
            claims::release(ctx, table_name);
        }
    }
}

/// Returns the first dynamic upstream that has never completed a
/// refresh, if any.
fn upstream_not_ready(
    ctx: &WorkerContext,
    table: &DynamicTable,
) -> Result<Option<String>, EngineError> {
    for upstream in table.upstream_dynamic() {
        let name = TableName::new(upstream);
        if ctx.meta.get_table(&name)?.is_some() && ctx.meta.last_success(&name)?.is_none() {
            return Ok(Some(upstream.to_string()));
        }
    }
    Ok(None)
}

fn handle_refresh_failure(ctx: &WorkerContext, table: &DynamicTable, err: &EngineError) {
    tracing::error!(table = %table.name, code = err.code(), "Refresh failed: {err}");
    let definitional = err
        .as_refresh_error()
        .is_some_and(|e| e.kind == ErrorKind::Definitional);
    let exhausted = consecutive_failures(ctx, &table.name) >= ctx.config.max_retries;
    if definitional || exhausted {
        // Operator intervention required; the scheduler stops enqueuing
        // until the status is cleared.
        if let Err(e) = ctx.meta.set_status(&table.name, TableStatus::Failed) {
            tracing::error!(table = %table.name, "Failed to mark table failed: {e}");
        }
        let _ = ctx.meta.delete_pending(&table.name);
    }
    // Otherwise the pending row stays queued and another attempt follows.
}

/// Consecutive `failed` entries at the head of the table's history.
fn consecutive_failures(ctx: &WorkerContext, table: &TableName) -> u32 {
    match ctx.meta.history(table, ctx.config.max_retries.max(1)) {
        Ok(entries) => {
            let mut count = 0;
            for entry in entries {
                if entry.outcome == freshet_types::RefreshOutcome::Failed {
                    count += 1;
                } else {
                    break;
                }
            }
            count
        }
        Err(e) => {
            tracing::warn!(table = %table, "Failed to read history for failure count: {e}");
            0
        }
    }
}

/// After a shutdown request, allow in-flight work `2 × claim_timeout`
/// before aborting it.
fn spawn_hard_deadline(
    ctx: &WorkerContext,
    refresh_cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let root = ctx.cancel.clone();
    let deadline = ctx.config.shutdown_deadline();
    tokio::spawn(async move {
        root.cancelled().await;
        tokio::time::sleep(deadline).await;
        refresh_cancel.cancel();
    })
}
