//! Metadata store trait definition.
//!
//! [`MetaStore`] defines the storage contract for the coordination schema:
//! table registry, per-source snapshot pointers, dependency edges, refresh
//! history, claims, the pending-refresh queue, and the subtask queue.
//! Implementations must be `Send + Sync` for use behind `Arc<dyn MetaStore>`.

use freshet_types::{
    Claim, DynamicTable, HistoryEntry, PendingRefresh, RefreshOutcome, SourceSnapshot, SnapshotMap,
    Subtask, SubtaskPayload, TableName, TableStatus, WorkerId,
};

use crate::error;

/// Aggregate subtask counts for one parent refresh, grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubtaskCounts {
    pub pending: u32,
    pub claimed: u32,
    pub completed: u32,
    /// Failed rows that still have retries left.
    pub failed_retryable: u32,
    /// Failed rows past their retry budget.
    pub failed_terminal: u32,
}

impl SubtaskCounts {
    /// Total subtasks across all statuses.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.pending + self.claimed + self.completed + self.failed_retryable + self.failed_terminal
    }
}

/// What a sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Stale or retryable-failed subtasks returned to `pending`.
    pub subtasks_requeued: u32,
    /// Subtasks moved to terminal `failed`.
    pub subtasks_failed: u32,
    /// Orphaned pending refreshes deleted (cascading their subtasks).
    pub orphans_deleted: u32,
}

/// Storage contract for the coordination schema.
///
/// All timestamps are RFC 3339 UTC strings produced by
/// [`freshet_types::now_iso`]; ordering comparisons are lexicographic.
pub trait MetaStore: Send + Sync {
    // -- registry -----------------------------------------------------------

    /// Insert a table and its dependency edges in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure or when
    /// the name already exists.
    fn register_table(&self, table: &DynamicTable) -> error::Result<()>;

    /// Fetch one table by qualified name.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn get_table(&self, name: &TableName) -> error::Result<Option<DynamicTable>>;

    /// All registered tables, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn list_tables(&self) -> error::Result<Vec<DynamicTable>>;

    /// Rewrite a table's stored properties (and `updated_at`).
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn update_table(&self, table: &DynamicTable) -> error::Result<()>;

    /// Set only the scheduling status.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn set_status(&self, name: &TableName, status: TableStatus) -> error::Result<()>;

    /// Delete a table; snapshots, dependencies, history, pending refreshes,
    /// and subtasks cascade.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn drop_table(&self, name: &TableName) -> error::Result<()>;

    // -- dependencies -------------------------------------------------------

    /// Every `(downstream, upstream)` edge.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn dependencies(&self) -> error::Result<Vec<(TableName, TableName)>>;

    /// Downstream tables that read from `upstream`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn dependents_of(&self, upstream: &TableName) -> error::Result<Vec<TableName>>;

    // -- source snapshots ---------------------------------------------------

    /// Stored snapshot pointers for one table.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn source_snapshots(&self, table: &TableName) -> error::Result<Vec<SourceSnapshot>>;

    /// Upsert all snapshot pointers for `table` in one transaction.
    ///
    /// Called only after the lake commit that consumed these snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn advance_snapshots(&self, table: &TableName, snapshots: &SnapshotMap) -> error::Result<()>;

    // -- history ------------------------------------------------------------

    /// Append one attempt record. Idempotent on
    /// `(dynamic_table, started_at, worker_id)`: replaying after a
    /// metadata-side failure is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn append_history(&self, entry: &HistoryEntry) -> error::Result<()>;

    /// Most recent attempts for one table, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn history(&self, table: &TableName, limit: u32) -> error::Result<Vec<HistoryEntry>>;

    /// The newest non-failed attempt (success or skipped), if any.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn last_success(&self, table: &TableName) -> error::Result<Option<HistoryEntry>>;

    /// The newest attempt with exactly this outcome. Used to distinguish
    /// a real data change (`success`) from a no-op (`skipped`) when
    /// propagating `downstream` lag.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn last_with_outcome(
        &self,
        table: &TableName,
        outcome: RefreshOutcome,
    ) -> error::Result<Option<HistoryEntry>>;

    // -- pending queue ------------------------------------------------------

    /// Insert a work item. With `upgrade` false this is
    /// `ON CONFLICT DO NOTHING`; with `upgrade` true an existing row keeps
    /// the better (lower) priority and earlier due time. Returns whether a
    /// row was inserted or upgraded.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn enqueue_refresh(&self, pending: &PendingRefresh, upgrade: bool) -> error::Result<bool>;

    /// Unclaimed work items with `due_at <= now`, best priority first.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn due_refreshes(&self, now: &str) -> error::Result<Vec<PendingRefresh>>;

    /// Remove a work item (cascades its subtasks).
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn delete_pending(&self, table: &TableName) -> error::Result<()>;

    // -- claims -------------------------------------------------------------

    /// Atomically claim `table` for `worker`. Success iff no live claim
    /// row existed.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn try_claim(
        &self,
        table: &TableName,
        worker: &WorkerId,
        timeout_secs: u64,
    ) -> error::Result<Option<Claim>>;

    /// Refresh the claim's heartbeat and expiry. Returns `false` when the
    /// claim no longer belongs to `worker` (lost claim).
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn heartbeat_claim(
        &self,
        table: &TableName,
        worker: &WorkerId,
        timeout_secs: u64,
    ) -> error::Result<bool>;

    /// Release a claim held by `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn release_claim(&self, table: &TableName, worker: &WorkerId) -> error::Result<()>;

    /// Current claim row for `table`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn get_claim(&self, table: &TableName) -> error::Result<Option<Claim>>;

    /// Delete claims whose expiry has passed; returns the freed tables.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn expire_claims(&self, now: &str) -> error::Result<Vec<TableName>>;

    /// Convert a `single` claim to `coordinator` mode with
    /// `subtasks_total` planned partitions. Returns `false` when the claim
    /// is not held by `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn convert_claim_to_coordinator(
        &self,
        table: &TableName,
        worker: &WorkerId,
        subtasks_total: u32,
    ) -> error::Result<bool>;

    /// Record coordinator progress (completed subtask count).
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn update_claim_progress(
        &self,
        table: &TableName,
        worker: &WorkerId,
        subtasks_completed: u32,
    ) -> error::Result<bool>;

    /// Estimate of idle workers: ids seen in history since `since` or
    /// currently holding work, minus ids currently holding work.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn idle_worker_estimate(&self, since: &str) -> error::Result<u32>;

    // -- subtasks -----------------------------------------------------------

    /// Insert all partitions for one parent refresh, `pending`, in one
    /// transaction. Returns the new subtask ids in partition order.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn publish_subtasks(
        &self,
        table: &TableName,
        payloads: &[SubtaskPayload],
    ) -> error::Result<Vec<i64>>;

    /// Claim the oldest `pending` subtask for `worker`
    /// (pending → claimed), if any.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn claim_subtask(&self, worker: &WorkerId) -> error::Result<Option<Subtask>>;

    /// Refresh a claimed subtask's heartbeat. Returns `false` when the row
    /// is no longer claimed by `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn heartbeat_subtask(&self, id: i64, worker: &WorkerId) -> error::Result<bool>;

    /// Mark a claimed subtask completed with its result location.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn complete_subtask(
        &self,
        id: i64,
        worker: &WorkerId,
        result_location: &str,
    ) -> error::Result<()>;

    /// Mark a subtask failed with a classified message, incrementing its
    /// retry count.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn fail_subtask(&self, id: i64, error_message: &str) -> error::Result<()>;

    /// Aggregate counts by status for one parent refresh.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn subtask_counts(&self, table: &TableName, retry_max: u32) -> error::Result<SubtaskCounts>;

    /// All subtasks of one parent refresh, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn list_subtasks(&self, table: &TableName) -> error::Result<Vec<Subtask>>;

    /// Delete all subtasks of one parent refresh.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn delete_subtasks(&self, table: &TableName) -> error::Result<()>;

    /// Sweep: requeue claimed subtasks with stale heartbeats (or fail them
    /// past `retry_max`), requeue retryable failures, and delete pending
    /// refreshes that have subtasks but no live claim.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError`](crate::MetaError) on storage failure.
    fn sweep(&self, stale_before: &str, retry_max: u32) -> error::Result<SweepOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn MetaStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn MetaStore) {}
    }

    #[test]
    fn subtask_counts_total() {
        let counts = SubtaskCounts {
            pending: 1,
            claimed: 2,
            completed: 3,
            failed_retryable: 1,
            failed_terminal: 0,
        };
        assert_eq!(counts.total(), 7);
    }
}
