//! Parallel affected-keys coordination.
//!
//! The claiming worker converts its claim to coordinator mode, publishes
//! one subtask per hash partition, waits for the fleet to complete them,
//! and merges the partial results into the target in one transaction, in
//! subtask-id order, so a retried coordinator produces the same row
//! sequence.

use std::time::Instant;

use freshet_types::{DynamicTable, PartitionSpec, RefreshError, SnapshotMap, SubtaskPayload};

use freshet_lake::Lake as _;
use freshet_meta::MetaStore as _;

use crate::context::WorkerContext;
use crate::errors::EngineError;
use crate::executor::with_retries;
use crate::sqlbuild;
use crate::ticker;

/// Run the coordinator protocol. Returns rows changed by the merge.
///
/// The caller (executor) holds the table claim and handles snapshot
/// advancement, history, and claim release; this function owns subtask
/// lifecycle and result-table cleanup.
///
/// # Errors
///
/// Returns a coordination error when the claim cannot be converted, a
/// subtask exhausts its retry budget, or the wait deadline passes. Cleanup
/// runs on every error path.
pub async fn run_parallel_refresh(
    ctx: &WorkerContext,
    table: &DynamicTable,
    pins: &SnapshotMap,
    keys_table: &str,
    subtasks: u32,
) -> Result<i64, EngineError> {
    if !ctx
        .meta
        .convert_claim_to_coordinator(&table.name, &ctx.worker_id, subtasks)?
    {
        return Err(RefreshError::coordination(
            "CLAIM_NOT_CONVERTIBLE",
            format!("claim on '{}' is not held in single mode by this worker", table.name),
        )
        .into());
    }

    let key_column = table
        .grouping_keys
        .first()
        .cloned()
        .ok_or_else(|| {
            EngineError::Refresh(RefreshError::definitional(
                "NO_GROUPING_KEYS",
                "parallel refresh requires grouping keys",
            ))
        })?;

    let payloads: Vec<SubtaskPayload> = (0..subtasks)
        .map(|bucket| SubtaskPayload {
            spec: PartitionSpec::HashRange {
                key_column: key_column.clone(),
                buckets: subtasks,
                bucket,
            },
            pins: pins.clone(),
            keys_table: keys_table.to_string(),
        })
        .collect();
    let ids = ctx.meta.publish_subtasks(&table.name, &payloads)?;
    tracing::info!(
        table = %table.name,
        subtasks,
        first_id = ids.first().copied().unwrap_or(0),
        "Published parallel refresh subtasks"
    );

    match wait_for_subtasks(ctx, table, subtasks).await {
        Ok(()) => {}
        Err(e) => {
            cleanup(ctx, table, keys_table).await;
            return Err(e);
        }
    }

    let merged = merge_results(ctx, table, keys_table).await;
    cleanup(ctx, table, keys_table).await;
    merged
}

/// Poll the subtask table at a fixed cadence until all partitions
/// complete, any partition fails terminally, or the deadline passes.
async fn wait_for_subtasks(
    ctx: &WorkerContext,
    table: &DynamicTable,
    total: u32,
) -> Result<(), EngineError> {
    let deadline = Instant::now() + ctx.config.coordinator_wait_timeout;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(RefreshError::coordination(
                "COORDINATOR_CANCELLED",
                "shutdown requested while waiting for subtasks",
            )
            .into());
        }
        let counts = ctx
            .meta
            .subtask_counts(&table.name, ctx.config.subtask_retry_max)?;
        ctx.meta
            .update_claim_progress(&table.name, &ctx.worker_id, counts.completed)?;
        if counts.failed_terminal > 0 {
            return Err(RefreshError::coordination(
                "SUBTASK_FAILED",
                format!(
                    "{} subtask(s) of '{}' failed past their retry budget",
                    counts.failed_terminal, table.name
                ),
            )
            .into());
        }
        if counts.completed == total {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RefreshError::coordination(
                "COORDINATOR_TIMEOUT",
                format!(
                    "subtasks of '{}' did not complete within {}s",
                    table.name,
                    ctx.config.coordinator_wait_timeout.as_secs()
                ),
            )
            .into());
        }
        tracing::debug!(
            table = %table.name,
            completed = counts.completed,
            pending = counts.pending,
            claimed = counts.claimed,
            failed = counts.failed_retryable,
            "Waiting for subtasks"
        );
        ticker::sleep(ctx.config.coordinator_poll_interval, &ctx.cancel).await;
    }
}

/// Merge all partition results in one transaction: DELETE the affected
/// keys, then INSERT each result in subtask-id order. DELETE-then-INSERT
/// of the complete affected set makes a retried merge overwrite any
/// partial predecessor.
async fn merge_results(
    ctx: &WorkerContext,
    table: &DynamicTable,
    keys_table: &str,
) -> Result<i64, EngineError> {
    let subtasks = ctx.meta.list_subtasks(&table.name)?;
    let mut results = Vec::with_capacity(subtasks.len());
    for st in &subtasks {
        let Some(location) = st.result_location.as_deref() else {
            return Err(RefreshError::coordination(
                "SUBTASK_RESULT_MISSING",
                format!("subtask {} completed without a result location", st.id),
            )
            .into());
        };
        results.push(location.to_string());
    }

    let target = table.name.as_str();
    let target_pred = sqlbuild::keys_in_predicate(
        &table.grouping_keys,
        &table.grouping_keys,
        keys_table,
        None,
    );

    with_retries(ctx.config.max_retries, || {
        merge_transaction(ctx, target.to_string(), target_pred.clone(), results.clone())
    })
    .await
}

async fn merge_transaction(
    ctx: &WorkerContext,
    target: String,
    target_pred: String,
    results: Vec<String>,
) -> Result<i64, EngineError> {
    ctx.lake.begin().await?;
    let applied: Result<i64, EngineError> = async {
        let mut rows = ctx
            .lake
            .execute(&format!("DELETE FROM {target} WHERE {target_pred}"))
            .await?;
        for result in &results {
            rows += ctx
                .lake
                .execute(&format!("INSERT INTO {target} SELECT * FROM {result}"))
                .await?;
        }
        Ok(i64::try_from(rows).unwrap_or(i64::MAX))
    }
    .await;
    match applied {
        Ok(rows) => {
            ctx.lake.commit().await?;
            Ok(rows)
        }
        Err(e) => {
            let _ = ctx.lake.rollback().await;
            Err(e)
        }
    }
}

/// Drop every result table and the shared key set, then delete the
/// subtask rows. Failures are logged, not surfaced: cleanup must never
/// mask the refresh outcome.
async fn cleanup(ctx: &WorkerContext, table: &DynamicTable, keys_table: &str) {
    match ctx.meta.list_subtasks(&table.name) {
        Ok(subtasks) => {
            for st in subtasks {
                if let Some(location) = st.result_location.as_deref() {
                    if let Err(e) = ctx.lake.drop_table(location).await {
                        tracing::warn!(location, "Failed to drop subtask result: {e}");
                    }
                }
            }
        }
        Err(e) => tracing::warn!(table = %table.name, "Failed to list subtasks for cleanup: {e}"),
    }
    if let Err(e) = ctx.lake.drop_table(keys_table).await {
        tracing::warn!(keys_table, "Failed to drop shared key set: {e}");
    }
    if let Err(e) = ctx.meta.delete_subtasks(&table.name) {
        tracing::warn!(table = %table.name, "Failed to delete subtask rows: {e}");
    }
}
