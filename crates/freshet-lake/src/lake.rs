//! Lake trait definition.

use async_trait::async_trait;
use freshet_types::SnapshotId;

use crate::error::Result;

/// The engine's view of the analytical store.
///
/// All heavy computation runs inside the lake; the engine only ships SQL.
/// Statements may contain snapshot-pin clauses of the form
/// `FOR SYSTEM_TIME AS OF <n>`; implementations translate them to their
/// native point-in-time syntax before execution.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn Lake>`.
#[async_trait]
pub trait Lake: Send + Sync {
    /// Execute one DML/DDL statement, returning the affected row count.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run a scalar query returning a single `BIGINT`.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn query_i64(&self, sql: &str) -> Result<i64>;

    /// Open an explicit transaction with snapshot isolation.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn begin(&self) -> Result<()>;

    /// Commit the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn commit(&self) -> Result<()>;

    /// Roll back the open transaction. Must be a no-op when none is open.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn rollback(&self) -> Result<()>;

    /// Current snapshot id of `source` (opaque, totally ordered per
    /// source).
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn current_snapshot(&self, source: &str) -> Result<SnapshotId>;

    /// A FROM-able relation of rows of `source` changed after `from` up to
    /// and including `to`, annotated with change kind. Contains at least
    /// every column of `source`.
    fn changes_relation(&self, source: &str, from: SnapshotId, to: SnapshotId) -> String;

    /// Whether `table` exists.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// `CREATE TABLE <table> AS <select>`: named (semi-persistent)
    /// result tables, visible to other workers.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn create_table_as(&self, table: &str, select: &str) -> Result<()>;

    /// `CREATE TEMP TABLE <table> AS <select>`: session-scoped scratch
    /// space. Returns the materialized row count.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn create_temp_table_as(&self, table: &str, select: &str) -> Result<i64>;

    /// Drop a table if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Rename `from` to `to` (used by the shadow full-refresh swap).
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn rename_table(&self, from: &str, to: &str) -> Result<()>;

    /// `SELECT COUNT(*)` of a table.
    ///
    /// # Errors
    ///
    /// Returns [`LakeError`](crate::LakeError) on execution failure.
    async fn row_count(&self, table: &str) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn Lake`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn Lake) {}
    }
}
