//! Scheduling: staleness scan, dependency closure, queue maintenance.
//!
//! One logical scheduler runs per deployment (usually co-located with a
//! worker via `freshet worker --scheduler`). Each tick computes the due
//! set, closes it under stale upstreams, enqueues in dependency order with
//! depth-derived priorities, expires dead claims, and sweeps orphaned
//! subtasks.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use freshet_meta::SweepOutcome;
use freshet_meta::MetaStore as _;
use freshet_types::{
    now_iso, DynamicTable, PendingRefresh, RefreshOutcome, RefreshTrigger, TableName, TableStatus,
    TargetLag,
};

use crate::context::WorkerContext;
use crate::errors::EngineError;
use crate::graph::DependencyGraph;
use crate::metrics;

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub due: Vec<TableName>,
    pub enqueued: usize,
    pub expired_claims: Vec<TableName>,
    pub sweep: SweepOutcome,
}

/// Run one scheduler tick.
///
/// # Errors
///
/// Returns an error on metadata-store failure; a cycle in stored
/// dependencies (which `create`/`alter` should have rejected) surfaces as
/// an infrastructure error.
pub async fn run_tick(ctx: &WorkerContext) -> Result<TickReport, EngineError> {
    let now = now_iso();
    let tables = ctx.meta.list_tables()?;
    let edges = ctx.meta.dependencies()?;

    let graph = DependencyGraph::from_edges(
        tables.iter().map(|t| t.name.as_str().to_string()),
        edges
            .iter()
            .map(|(d, u)| (d.as_str().to_string(), u.as_str().to_string())),
    );
    let depths = graph
        .depths()
        .map_err(|e| EngineError::Infrastructure(anyhow::anyhow!("stored dependency cycle: {e}")))?;

    let by_name: BTreeMap<&str, &DynamicTable> =
        tables.iter().map(|t| (t.name.as_str(), t)).collect();

    // Staleness per table, from its newest non-failed attempt.
    let mut due: BTreeSet<String> = BTreeSet::new();
    for table in &tables {
        if is_due(ctx, table, &now)? {
            due.insert(table.name.as_str().to_string());
        }
    }

    // Close under dependencies: a due table pulls in stale upstreams so
    // the chain lands in the queue together, ordered by priority.
    let mut closure = due.clone();
    for name in &due {
        for ancestor in graph.ancestors_of(name) {
            if closure.contains(&ancestor) {
                continue;
            }
            let Some(up) = by_name.get(ancestor.as_str()) else {
                continue;
            };
            if is_due(ctx, up, &now)? {
                closure.insert(ancestor);
            }
        }
    }

    metrics::record_due_tables(closure.len());

    // Topological order is implied by depth-ascending priorities; enqueue
    // in sorted order anyway so the insert sequence is deterministic.
    let mut enqueued = 0;
    let mut due_tables = Vec::new();
    for name in &closure {
        let depth = depths.get(name).copied().unwrap_or(0);
        let pending = PendingRefresh {
            dynamic_table: TableName::new(name.clone()),
            due_at: now.clone(),
            priority: i32::try_from(depth).unwrap_or(i32::MAX),
            trigger: RefreshTrigger::Scheduled,
            enqueued_at: now.clone(),
        };
        if ctx.meta.enqueue_refresh(&pending, false)? {
            enqueued += 1;
        }
        due_tables.push(pending.dynamic_table);
    }

    // Claims whose heartbeat went stale: delete them so the pending rows
    // become claimable again.
    let expired_claims = ctx.meta.expire_claims(&now)?;
    if !expired_claims.is_empty() {
        metrics::record_expired_claims(expired_claims.len());
        tracing::warn!(count = expired_claims.len(), "Expired stale claims");
    }

    // Orphaned and stale subtasks.
    let stale_before = ago(ctx.config.claim_timeout);
    let sweep = ctx
        .meta
        .sweep(&stale_before, ctx.config.subtask_retry_max)?;

    tracing::debug!(
        due = due_tables.len(),
        enqueued,
        expired = expired_claims.len(),
        requeued_subtasks = sweep.subtasks_requeued,
        "Scheduler tick complete"
    );

    Ok(TickReport {
        due: due_tables,
        enqueued,
        expired_claims,
        sweep,
    })
}

/// Whether a table needs refreshing right now.
///
/// Duration lag: staleness measured from the newest non-failed attempt.
/// `downstream` lag: due when any upstream has a *data-changing* refresh
/// (outcome `success`, not `skipped`) newer than this table's own last
/// attempt.
fn is_due(ctx: &WorkerContext, table: &DynamicTable, now: &str) -> Result<bool, EngineError> {
    if table.status != TableStatus::Active {
        return Ok(false);
    }
    let last = ctx.meta.last_success(&table.name)?;
    match table.target_lag {
        TargetLag::Duration(lag) => match last {
            None => Ok(true),
            Some(entry) => {
                let end = entry.completed_at.unwrap_or(entry.started_at);
                Ok(staleness(&end, now) >= lag)
            }
        },
        TargetLag::Downstream => {
            let own_mark = last.map(|e| e.completed_at.unwrap_or(e.started_at));
            for upstream in table.upstream_dynamic() {
                let refreshed = ctx
                    .meta
                    .last_with_outcome(&TableName::new(upstream), RefreshOutcome::Success)?;
                let Some(refreshed) = refreshed else {
                    continue;
                };
                let up_mark = refreshed.completed_at.unwrap_or(refreshed.started_at);
                match &own_mark {
                    None => return Ok(true),
                    Some(own) if up_mark > *own => return Ok(true),
                    Some(_) => {}
                }
            }
            // Never refreshed and no upstream activity: bootstrap once so
            // the table exists at all.
            Ok(own_mark.is_none())
        }
    }
}

fn staleness(since: &str, now: &str) -> Duration {
    let (Ok(a), Ok(b)) = (
        since.parse::<DateTime<Utc>>(),
        now.parse::<DateTime<Utc>>(),
    ) else {
        return Duration::ZERO;
    };
    (b - a).to_std().unwrap_or(Duration::ZERO)
}

fn ago(span: Duration) -> String {
    (Utc::now() - chrono::Duration::from_std(span).unwrap_or(chrono::Duration::zero()))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
