//! Refresh execution.
//!
//! Carries out one refresh attempt for a claimed table: snapshot pinning,
//! strategy selection, affected-key extraction, the transactional apply on
//! the lake, and metadata advancement. The lake commit always happens
//! first; metadata writes follow with bounded retries and an idempotent
//! history insert, so a metadata-side failure after a durable lake commit
//! resolves on replay.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Instant;

use freshet_sql::QueryShape;
use freshet_lake::Lake as _;
use freshet_meta::MetaStore as _;
use freshet_types::{
    now_iso, DynamicTable, HistoryEntry, RefreshError, RefreshOutcome, RefreshTrigger,
    SnapshotMap, StrategyKind, TableName, TableStatus,
};

use crate::context::WorkerContext;
use crate::coordinator;
use crate::errors::{compute_backoff, EngineError};
use crate::metrics;
use crate::sqlbuild;
use crate::strategy::{self, Final, Preliminary};

/// Outcome of one refresh attempt, as recorded in history.
#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub strategy: StrategyKind,
    pub outcome: RefreshOutcome,
    pub rows_affected: i64,
    pub affected_keys: Option<i64>,
    pub duration_ms: i64,
}

/// Retry an operation on retryable errors with exponential backoff.
pub(crate) async fn with_retries<T, F, Fut>(max_retries: u32, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_retries.max(1) => {
                attempt += 1;
                let delay = compute_backoff(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after transient error: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn lake_exec(ctx: &WorkerContext, sql: String) -> Result<u64, EngineError> {
    ctx.lake.execute(&sql).await.map_err(EngineError::from)
}

async fn lake_temp_as(ctx: &WorkerContext, name: String, select: String) -> Result<i64, EngineError> {
    ctx.lake
        .create_temp_table_as(&name, &select)
        .await
        .map_err(EngineError::from)
}

/// Execute one refresh for a table whose claim this worker holds (with a
/// fresh heartbeat). Records history on every path.
///
/// # Errors
///
/// Returns the classified error after recording a `failed` history entry;
/// definitional failures additionally move the table to `failed` status at
/// the worker level.
pub async fn execute_refresh(
    ctx: &WorkerContext,
    table: &DynamicTable,
    trigger: RefreshTrigger,
) -> Result<RefreshReport, EngineError> {
    let started_at = now_iso();
    let start = Instant::now();

    // Partial-chain rule: a failed upstream skips this table for the pass
    // instead of failing it.
    for upstream in table.upstream_dynamic() {
        let up = ctx.meta.get_table(&TableName::new(upstream))?;
        if up.is_some_and(|u| u.status == TableStatus::Failed) {
            tracing::info!(
                table = %table.name,
                upstream,
                "Skipping refresh: upstream is failed"
            );
            let report = RefreshReport {
                strategy: StrategyKind::Skipped,
                outcome: RefreshOutcome::Skipped,
                rows_affected: 0,
                affected_keys: None,
                duration_ms: elapsed_ms(start),
            };
            record_history(
                ctx,
                table,
                &started_at,
                &report,
                &SnapshotMap::new(),
                trigger,
                Some(("UPSTREAM_FAILED", format!("upstream '{upstream}' is failed"))),
            )
            .await?;
            return Ok(report);
        }
    }

    // The definition is re-analyzed each attempt; a stored query that no
    // longer parses is a definitional failure.
    let shape = match freshet_sql::analyze_query(&table.query_sql) {
        Ok(shape) => shape,
        Err(e) => {
            let err = EngineError::from(e);
            fail_history(ctx, table, &started_at, start, &SnapshotMap::new(), trigger, &err).await;
            return Err(err);
        }
    };

    let stored: SnapshotMap = ctx
        .meta
        .source_snapshots(&table.name)?
        .into_iter()
        .map(|s| (s.source, s.last_snapshot))
        .collect();

    // Pin every source once, up front: all change feeds and reads in this
    // attempt use this one snapshot map. Dynamic upstreams are lake tables
    // with snapshots of their own; they are tracked and diffed like base
    // sources, only their pin is skipped in the rewrite.
    let mut current = SnapshotMap::new();
    for source in &table.sources {
        let snap = with_retries(ctx.config.max_retries, || {
            current_snapshot(ctx, source.name.clone())
        })
        .await;
        match snap {
            Ok(snap) => {
                current.insert(source.name.clone(), snap);
            }
            Err(err) => {
                fail_history(ctx, table, &started_at, start, &current, trigger, &err).await;
                return Err(err);
            }
        }
    }

    let exclude: BTreeSet<String> = table
        .upstream_dynamic()
        .iter()
        .map(|s| (*s).to_string())
        .collect();

    let attempt = run_strategy(ctx, table, &shape, &stored, &current, &exclude).await;

    match attempt {
        Ok(report) => {
            // Lake state is durable; advance metadata with bounded
            // retries. History is idempotent on (table, start, worker).
            let advance_snapshots = report.outcome == RefreshOutcome::Success
                || (report.outcome == RefreshOutcome::Skipped
                    && report.strategy != StrategyKind::Skipped);
            if advance_snapshots {
                with_retries(ctx.config.max_retries, || {
                    advance_meta(ctx, table.name.clone(), current.clone())
                })
                .await?;
            }
            record_history(ctx, table, &started_at, &report, &current, trigger, None).await?;
            metrics::record_refresh(report.strategy, report.outcome, report.duration_ms);
            tracing::info!(
                table = %table.name,
                strategy = %report.strategy,
                outcome = %report.outcome,
                rows = report.rows_affected,
                duration_ms = report.duration_ms,
                "Refresh finished"
            );
            Ok(report)
        }
        Err(err) => {
            // Roll back whatever the failed step left open.
            if let Err(rollback_err) = ctx.lake.rollback().await {
                tracing::warn!(table = %table.name, "Rollback after failure also failed: {rollback_err}");
            }
            fail_history(ctx, table, &started_at, start, &current, trigger, &err).await;
            Err(err)
        }
    }
}

async fn current_snapshot(ctx: &WorkerContext, source: String) -> Result<i64, EngineError> {
    ctx.lake
        .current_snapshot(&source)
        .await
        .map_err(EngineError::from)
}

async fn advance_meta(
    ctx: &WorkerContext,
    table: TableName,
    pins: SnapshotMap,
) -> Result<(), EngineError> {
    ctx.meta
        .advance_snapshots(&table, &pins)
        .map_err(|e| EngineError::Refresh(RefreshError::transient_lake("META_ADVANCE", e.to_string())))
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

async fn run_strategy(
    ctx: &WorkerContext,
    table: &DynamicTable,
    shape: &QueryShape,
    stored: &SnapshotMap,
    current: &SnapshotMap,
    exclude: &BTreeSet<String>,
) -> Result<RefreshReport, EngineError> {
    let start = Instant::now();
    match strategy::preliminary(table, stored, current) {
        Preliminary::NoOp => Ok(RefreshReport {
            strategy: StrategyKind::Skipped,
            outcome: RefreshOutcome::Skipped,
            rows_affected: 0,
            affected_keys: None,
            duration_ms: elapsed_ms(start),
        }),
        Preliminary::Bootstrap => {
            let rows = run_full_load(ctx, table, current, exclude, true).await?;
            Ok(RefreshReport {
                strategy: StrategyKind::Bootstrap,
                outcome: RefreshOutcome::Success,
                rows_affected: rows,
                affected_keys: None,
                duration_ms: elapsed_ms(start),
            })
        }
        Preliminary::Full(reason) => {
            tracing::debug!(table = %table.name, ?reason, "Full refresh selected");
            let rows = run_full_load(ctx, table, current, exclude, false).await?;
            Ok(RefreshReport {
                strategy: StrategyKind::Full,
                outcome: RefreshOutcome::Success,
                rows_affected: rows,
                affected_keys: None,
                duration_ms: elapsed_ms(start),
            })
        }
        Preliminary::NeedsAffectedCount { changed_sources } => {
            run_incremental(ctx, table, shape, stored, current, exclude, &changed_sources, start)
                .await
        }
    }
}

/// Full and bootstrap loads share one shape: pin, (re)create or clear the
/// target, insert the whole result. Bootstrap differs only in that the
/// snapshot map was captured before the query ran (the caller already did)
/// and the target is expected to be empty.
async fn run_full_load(
    ctx: &WorkerContext,
    table: &DynamicTable,
    pins: &SnapshotMap,
    exclude: &BTreeSet<String>,
    bootstrap: bool,
) -> Result<i64, EngineError> {
    let pinned = freshet_sql::pin_snapshots(&table.query_sql, pins, exclude)?;
    let target = table.name.as_str();

    let exists = ctx.lake.table_exists(target).await?;
    if !exists {
        // DDL runs outside the data transaction; an empty CREATE ... AS
        // gives the target the query's schema.
        with_retries(ctx.config.max_retries, || {
            lake_exec(
                ctx,
                format!("CREATE TABLE {target} AS SELECT * FROM ({pinned}) LIMIT 0"),
            )
        })
        .await?;
    }

    if table.shadow && !bootstrap {
        return run_shadow_swap(ctx, table, &pinned).await;
    }

    with_retries(ctx.config.max_retries, || {
        run_full_transaction(ctx, target.to_string(), pinned.clone(), bootstrap)
    })
    .await
}

async fn run_full_transaction(
    ctx: &WorkerContext,
    target: String,
    pinned: String,
    bootstrap: bool,
) -> Result<i64, EngineError> {
    ctx.lake.begin().await?;
    let result: Result<i64, EngineError> = async {
        if !bootstrap {
            ctx.lake.execute(&format!("DELETE FROM {target}")).await?;
        }
        let inserted = ctx
            .lake
            .execute(&format!("INSERT INTO {target} {pinned}"))
            .await?;
        Ok(i64::try_from(inserted).unwrap_or(i64::MAX))
    }
    .await;
    match result {
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

/// Shadow variant: build the replacement off to the side, swap names in a
/// second small transaction.
async fn run_shadow_swap(
    ctx: &WorkerContext,
    table: &DynamicTable,
    pinned: &str,
) -> Result<i64, EngineError> {
    let shadow = sqlbuild::shadow_name(&table.name);
    let target = table.name.as_str();

    ctx.lake.drop_table(&shadow).await?;
    ctx.lake.create_table_as(&shadow, pinned).await?;
    let rows = ctx.lake.row_count(&shadow).await?;

    let swap: Result<(), EngineError> = async {
        ctx.lake.begin().await?;
        ctx.lake.execute(&format!("DROP TABLE {target}")).await?;
        ctx.lake.rename_table(&shadow, table.name.table()).await?;
        ctx.lake.commit().await?;
        Ok(())
    }
    .await;
    if let Err(e) = swap {
        let _ = ctx.lake.rollback().await;
        let _ = ctx.lake.drop_table(&shadow).await;
        return Err(e);
    }
    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
async fn run_incremental(
    ctx: &WorkerContext,
    table: &DynamicTable,
    shape: &QueryShape,
    stored: &SnapshotMap,
    current: &SnapshotMap,
    exclude: &BTreeSet<String>,
    changed_sources: &[String],
    start: Instant,
) -> Result<RefreshReport, EngineError> {
    // Affected-key extraction: union the key projection of every changed
    // source's feed, de-duplicated, into session scratch.
    let keys_temp = sqlbuild::keys_temp_name(&table.name);
    let mut key_selects = Vec::with_capacity(changed_sources.len());
    for source in changed_sources {
        let from = stored.get(source).copied().unwrap_or(0);
        let to = current
            .get(source)
            .copied()
            .unwrap_or(from);
        let feed = ctx.lake.changes_relation(source, from, to);
        key_selects.push(freshet_sql::keys_query(
            &table.query_sql,
            source,
            &feed,
            current,
            exclude,
        )?);
    }
    let union_select = key_selects.join(" UNION ");
    let affected = with_retries(ctx.config.max_retries, || {
        lake_temp_as(ctx, keys_temp.clone(), union_select.clone())
    })
    .await?;

    let total = ctx.lake.row_count(table.name.as_str()).await?;

    let decision = strategy::finalize(
        table,
        u64::try_from(affected).unwrap_or(0),
        u64::try_from(total).unwrap_or(0),
        ctx.meta.idle_worker_estimate(&one_hour_ago())?,
    );

    let report = match decision {
        Final::FullCardinality => {
            tracing::debug!(
                table = %table.name,
                affected,
                total,
                "Affected ratio above threshold; falling back to full refresh"
            );
            let rows = run_full_load(ctx, table, current, exclude, false).await?;
            RefreshReport {
                strategy: StrategyKind::Full,
                outcome: RefreshOutcome::Success,
                rows_affected: rows,
                affected_keys: Some(affected),
                duration_ms: elapsed_ms(start),
            }
        }
        Final::AffectedKeys => {
            let (rows, skipped) =
                run_affected_single(ctx, table, shape, current, exclude, &keys_temp).await?;
            RefreshReport {
                strategy: StrategyKind::AffectedKeys,
                outcome: if skipped {
                    RefreshOutcome::Skipped
                } else {
                    RefreshOutcome::Success
                },
                rows_affected: rows,
                affected_keys: Some(affected),
                duration_ms: elapsed_ms(start),
            }
        }
        Final::ParallelAffectedKeys { subtasks } => {
            // Promote the key set to a named table other workers can see.
            let shared = sqlbuild::keys_shared_name(&table.name);
            ctx.lake.drop_table(&shared).await?;
            ctx.lake
                .create_table_as(&shared, &format!("SELECT * FROM {keys_temp}"))
                .await?;
            let rows =
                coordinator::run_parallel_refresh(ctx, table, current, &shared, subtasks).await?;
            RefreshReport {
                strategy: StrategyKind::ParallelAffectedKeys,
                outcome: RefreshOutcome::Success,
                rows_affected: rows,
                affected_keys: Some(affected),
                duration_ms: elapsed_ms(start),
            }
        }
    };

    ctx.lake.drop_table(&keys_temp).await?;
    Ok(report)
}

/// Single-worker affected-keys apply: DELETE the affected keys from the
/// target, INSERT their recomputation, atomically. With `deduplication`,
/// candidate rows are diffed against the target first and an empty diff
/// skips the transaction entirely.
async fn run_affected_single(
    ctx: &WorkerContext,
    table: &DynamicTable,
    shape: &QueryShape,
    pins: &SnapshotMap,
    exclude: &BTreeSet<String>,
    keys_table: &str,
) -> Result<(i64, bool), EngineError> {
    let target = table.name.as_str();
    let key_names = &table.grouping_keys;

    let query_pred =
        sqlbuild::keys_in_predicate(&shape.grouping_key_exprs, key_names, keys_table, None);
    let target_pred = sqlbuild::keys_in_predicate(key_names, key_names, keys_table, None);

    let pinned = freshet_sql::pin_snapshots(&table.query_sql, pins, exclude)?;
    let filtered = freshet_sql::add_predicate(&pinned, &query_pred)?;

    if table.deduplication {
        return run_affected_dedup(ctx, table, &filtered, &target_pred).await;
    }

    let rows = with_retries(ctx.config.max_retries, || {
        run_delete_insert(
            ctx,
            format!("DELETE FROM {target} WHERE {target_pred}"),
            format!("INSERT INTO {target} {filtered}"),
        )
    })
    .await?;
    Ok((rows, false))
}

async fn run_delete_insert(
    ctx: &WorkerContext,
    delete_sql: String,
    insert_sql: String,
) -> Result<i64, EngineError> {
    ctx.lake.begin().await?;
    let result: Result<i64, EngineError> = async {
        let deleted = ctx.lake.execute(&delete_sql).await?;
        let inserted = ctx.lake.execute(&insert_sql).await?;
        Ok(i64::try_from(deleted + inserted).unwrap_or(i64::MAX))
    }
    .await;
    match result {
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

async fn run_affected_dedup(
    ctx: &WorkerContext,
    table: &DynamicTable,
    filtered_query: &str,
    target_pred: &str,
) -> Result<(i64, bool), EngineError> {
    let target = table.name.as_str();
    let key_names = &table.grouping_keys;
    let new_temp = sqlbuild::dedup_new_name(&table.name);
    let diff_temp = sqlbuild::dedup_diff_name(&table.name);

    with_retries(ctx.config.max_retries, || {
        lake_temp_as(ctx, new_temp.clone(), filtered_query.to_string())
    })
    .await?;

    let diff_select = sqlbuild::dedup_diff_select(&new_temp, target, key_names, target_pred);
    let differing = with_retries(ctx.config.max_retries, || {
        lake_temp_as(ctx, diff_temp.clone(), diff_select.clone())
    })
    .await?;

    let outcome = if differing == 0 {
        // Nothing actually changed under deduplication; skip the
        // transaction entirely.
        Ok((0, true))
    } else {
        let diff_pred_target =
            sqlbuild::keys_in_predicate(key_names, key_names, &diff_temp, None);
        let rows = with_retries(ctx.config.max_retries, || {
            run_delete_insert(
                ctx,
                format!("DELETE FROM {target} WHERE {diff_pred_target}"),
                format!(
                    "INSERT INTO {target} SELECT * FROM {new_temp} WHERE {diff_pred_target}"
                ),
            )
        })
        .await?;
        Ok((rows, false))
    };

    ctx.lake.drop_table(&new_temp).await?;
    ctx.lake.drop_table(&diff_temp).await?;
    outcome
}

fn one_hour_ago() -> String {
    (chrono::Utc::now() - chrono::Duration::hours(1))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[allow(clippy::too_many_arguments)]
async fn record_history(
    ctx: &WorkerContext,
    table: &DynamicTable,
    started_at: &str,
    report: &RefreshReport,
    pins: &SnapshotMap,
    trigger: RefreshTrigger,
    error: Option<(&str, String)>,
) -> Result<(), EngineError> {
    let entry = HistoryEntry {
        dynamic_table: table.name.clone(),
        worker_id: ctx.worker_id.clone(),
        started_at: started_at.to_string(),
        completed_at: Some(now_iso()),
        outcome: report.outcome,
        strategy: report.strategy,
        rows_affected: Some(report.rows_affected),
        affected_keys_count: report.affected_keys,
        duration_ms: Some(report.duration_ms),
        error_code: error.as_ref().map(|(code, _)| (*code).to_string()),
        error_message: error.map(|(_, msg)| msg),
        snapshots: pins.clone(),
        trigger,
    };
    with_retries(ctx.config.max_retries, || {
        append_history(ctx, entry.clone())
    })
    .await
}

async fn append_history(ctx: &WorkerContext, entry: HistoryEntry) -> Result<(), EngineError> {
    ctx.meta
        .append_history(&entry)
        .map_err(|e| EngineError::Refresh(RefreshError::transient_lake("META_HISTORY", e.to_string())))
}

/// Best-effort failed-history record; a metadata failure here is logged,
/// not surfaced, because the refresh error is the one the caller needs.
async fn fail_history(
    ctx: &WorkerContext,
    table: &DynamicTable,
    started_at: &str,
    start: Instant,
    pins: &SnapshotMap,
    trigger: RefreshTrigger,
    err: &EngineError,
) {
    let report = RefreshReport {
        strategy: StrategyKind::Skipped,
        outcome: RefreshOutcome::Failed,
        rows_affected: 0,
        affected_keys: None,
        duration_ms: elapsed_ms(start),
    };
    let code = err.code().to_string();
    if let Err(history_err) = record_history(
        ctx,
        table,
        started_at,
        &report,
        pins,
        trigger,
        Some((code.as_str(), err.to_string())),
    )
    .await
    {
        tracing::error!(
            table = %table.name,
            "Failed to record refresh failure: {history_err}"
        );
    }
    metrics::record_refresh(report.strategy, RefreshOutcome::Failed, report.duration_ms);
}
