//! Strategy selection for one pending refresh.
//!
//! Two pure decision stages, because the affected-key count is expensive:
//! [`preliminary`] runs on the snapshot diff alone; when it answers
//! [`Preliminary::NeedsAffectedCount`], the executor extracts the affected
//! keys and finishes the decision with [`finalize`].

use freshet_types::{DynamicTable, RefreshStrategy, SnapshotMap};

/// First-stage decision from policy and snapshot state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preliminary {
    /// No stored snapshots: first population.
    Bootstrap,
    /// Every source is unchanged: record `skipped`, touch nothing.
    NoOp,
    /// Full recomputation, for the given reason.
    Full(FullReason),
    /// Incremental is possible; extract affected keys for these changed
    /// sources, then call [`finalize`].
    NeedsAffectedCount { changed_sources: Vec<String> },
}

/// Why a full refresh was selected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullReason {
    /// `refresh_strategy = 'full'` policy.
    Policy,
    /// The query has no grouping keys (or is classified full-only).
    FullOnly,
    /// A source has no stored snapshot to diff from.
    MissingSourcePin,
}

/// Final decision once the affected-key count is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Final {
    /// The change set is too large a fraction of the target.
    FullCardinality,
    /// Fan out across workers with this many subtasks.
    ParallelAffectedKeys { subtasks: u32 },
    /// Single-worker incremental refresh.
    AffectedKeys,
}

/// Target rows per subtask when sizing the parallel fan-out.
const ROWS_PER_SUBTASK: u64 = 5_000_000;

/// Decide as much as the snapshot diff allows.
#[must_use]
pub fn preliminary(
    table: &DynamicTable,
    stored: &SnapshotMap,
    current: &SnapshotMap,
) -> Preliminary {
    if stored.is_empty() {
        return Preliminary::Bootstrap;
    }

    let mut changed = Vec::new();
    let mut missing_pin = false;
    for source in &table.sources {
        let Some(cur) = current.get(&source.name) else {
            missing_pin = true;
            continue;
        };
        match stored.get(&source.name) {
            None => missing_pin = true,
            Some(last) if cur > last => changed.push(source.name.clone()),
            Some(_) => {}
        }
    }

    if !missing_pin && changed.is_empty() {
        return Preliminary::NoOp;
    }
    if table.refresh_strategy == RefreshStrategy::Full {
        return Preliminary::Full(FullReason::Policy);
    }
    if table.grouping_keys.is_empty() {
        return Preliminary::Full(FullReason::FullOnly);
    }
    if missing_pin {
        return Preliminary::Full(FullReason::MissingSourcePin);
    }
    Preliminary::NeedsAffectedCount {
        changed_sources: changed,
    }
}

/// Finish the decision with the affected-key count, the target's total
/// row count, and the fleet's idle-worker estimate.
#[must_use]
pub fn finalize(
    table: &DynamicTable,
    affected_keys: u64,
    total_rows: u64,
    idle_workers: u32,
) -> Final {
    // An empty or tiny target makes the ratio meaningless; recompute it
    // whole.
    if total_rows == 0 {
        return Final::FullCardinality;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = affected_keys as f64 / total_rows as f64;
    if ratio > table.cardinality_threshold {
        return Final::FullCardinality;
    }
    if table.allow_parallel && affected_keys >= table.parallel_threshold && idle_workers >= 2 {
        return Final::ParallelAffectedKeys {
            subtasks: subtask_count(affected_keys, table.max_parallelism),
        };
    }
    Final::AffectedKeys
}

/// `min(max_parallelism, max(2, ceil(affected / 5M)))`.
#[must_use]
pub fn subtask_count(affected_keys: u64, max_parallelism: u32) -> u32 {
    let by_size = affected_keys.div_ceil(ROWS_PER_SUBTASK).max(2);
    u32::try_from(by_size)
        .unwrap_or(u32::MAX)
        .min(max_parallelism.max(2))
}
