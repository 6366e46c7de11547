//! Coordination entities owned by the metadata store.
//!
//! Pure data types shared by the `MetaStore` implementations and the
//! engine. Timestamps are RFC 3339 UTC strings (see [`crate::now_iso`]);
//! snapshot identifiers are the lake's opaque, per-source, totally ordered
//! `i64` values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::table::TableName;

/// Opaque lake snapshot identifier, totally ordered per source.
pub type SnapshotId = i64;

/// Identifier of a worker process (`<host>-<pid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a worker identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for WorkerId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// The snapshot of `source` last consumed by `dynamic_table`'s most recent
/// successful refresh. Absence of a row means "never refreshed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub dynamic_table: TableName,
    pub source: String,
    pub last_snapshot: SnapshotId,
    /// RFC 3339 timestamp of the refresh that wrote this row.
    pub last_processed_at: String,
}

/// Map of source name to snapshot id, ordered for deterministic JSON.
pub type SnapshotMap = BTreeMap<String, SnapshotId>;

/// A queued refresh work item. At most one exists per table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRefresh {
    pub dynamic_table: TableName,
    /// RFC 3339 time at which the refresh becomes claimable.
    pub due_at: String,
    /// Lower sorts first. Scheduler uses DAG depth (roots = 0); manual
    /// refreshes use [`PendingRefresh::MANUAL_PRIORITY`].
    pub priority: i32,
    pub trigger: RefreshTrigger,
    pub enqueued_at: String,
}

impl PendingRefresh {
    /// Priority for operator-triggered refreshes; sorts before any
    /// scheduler-assigned depth priority.
    pub const MANUAL_PRIORITY: i32 = -10;
}

/// What caused a refresh to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    #[default]
    Scheduled,
    Manual,
}

impl RefreshTrigger {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a known trigger.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            _ => Err(input.to_string()),
        }
    }
}

/// Whether a claim holder is refreshing alone or coordinating subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimMode {
    #[default]
    Single,
    Coordinator,
}

impl ClaimMode {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Coordinator => "coordinator",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a known mode.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input {
            "single" => Ok(Self::Single),
            "coordinator" => Ok(Self::Coordinator),
            _ => Err(input.to_string()),
        }
    }
}

/// Exclusive ownership of one table's refresh. Unique per table across the
/// fleet (enforced by the metadata store's primary key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub dynamic_table: TableName,
    pub worker_id: WorkerId,
    pub claimed_at: String,
    pub heartbeat_at: String,
    pub expires_at: String,
    pub mode: ClaimMode,
    pub subtasks_total: u32,
    pub subtasks_completed: u32,
}

/// How a subtask's share of the affected-key set is delimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionSpec {
    /// `hash(key) % buckets = bucket`
    HashRange {
        key_column: String,
        buckets: u32,
        bucket: u32,
    },
    /// `key % buckets = bucket` (integer keys only)
    Modulo {
        key_column: String,
        buckets: u32,
        bucket: u32,
    },
    /// A literal source-partition predicate.
    Partition { predicate: String },
}

impl PartitionSpec {
    /// Storage label for the `kind` column.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HashRange { .. } => "hash_range",
            Self::Modulo { .. } => "modulo",
            Self::Partition { .. } => "partition",
        }
    }
}

/// Lifecycle state of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl SubtaskStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a known status.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(input.to_string()),
        }
    }
}

/// Everything a subtask worker needs to execute one partition without
/// re-deriving state: the partition bounds, the coordinator's snapshot
/// pins, and the shared affected-keys table. Serialized as JSON at the
/// metadata boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskPayload {
    pub spec: PartitionSpec,
    /// Snapshot map captured by the coordinator; every subtask of one
    /// refresh reads sources at exactly these pins.
    pub pins: SnapshotMap,
    /// Named lake table holding the full affected-key set.
    pub keys_table: String,
}

/// One partition of a parallel affected-keys refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: i64,
    /// The owning refresh; equals the table name and cascades from the
    /// pending-refresh row.
    pub parent_refresh: TableName,
    pub dynamic_table: TableName,
    pub payload: SubtaskPayload,
    pub status: SubtaskStatus,
    /// Temporary table holding this partition's result, set on completion.
    pub result_location: Option<String>,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<String>,
    pub heartbeat_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: String,
}

/// Outcome of one refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Success,
    Failed,
    Skipped,
}

impl RefreshOutcome {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a known outcome.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(input.to_string()),
        }
    }
}

impl std::fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The strategy a refresh attempt executed (or `skipped` for the no-op
/// path, which records history without touching the lake).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Bootstrap,
    Full,
    AffectedKeys,
    ParallelAffectedKeys,
    Skipped,
}

impl StrategyKind {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Full => "full",
            Self::AffectedKeys => "affected_keys",
            Self::ParallelAffectedKeys => "parallel_affected_keys",
            Self::Skipped => "skipped",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a known strategy kind.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input {
            "bootstrap" => Ok(Self::Bootstrap),
            "full" => Ok(Self::Full),
            "affected_keys" => Ok(Self::AffectedKeys),
            "parallel_affected_keys" => Ok(Self::ParallelAffectedKeys),
            "skipped" => Ok(Self::Skipped),
            _ => Err(input.to_string()),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One refresh attempt as recorded in the metadata store.
///
/// Idempotent on `(dynamic_table, started_at, worker_id)`: re-inserting
/// after a metadata-side failure is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub dynamic_table: TableName,
    pub worker_id: WorkerId,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub outcome: RefreshOutcome,
    pub strategy: StrategyKind,
    pub rows_affected: Option<i64>,
    pub affected_keys_count: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// The snapshot map consumed by this attempt.
    pub snapshots: SnapshotMap,
    pub trigger: RefreshTrigger,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_spec_serializes_tagged() {
        let spec = PartitionSpec::HashRange {
            key_column: "customer_id".into(),
            buckets: 4,
            bucket: 1,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains(r#""kind":"hash_range""#), "got: {json}");
        let back: PartitionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert_eq!(spec.kind(), "hash_range");
    }

    #[test]
    fn partition_spec_literal_predicate() {
        let spec = PartitionSpec::Partition {
            predicate: "order_date >= '2026-01-01'".into(),
        };
        assert_eq!(spec.kind(), "partition");
        let json = serde_json::to_string(&spec).unwrap();
        let back: PartitionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn status_enums_round_trip() {
        for s in [
            SubtaskStatus::Pending,
            SubtaskStatus::Claimed,
            SubtaskStatus::Completed,
            SubtaskStatus::Failed,
        ] {
            assert_eq!(SubtaskStatus::parse(s.as_str()).unwrap(), s);
        }
        for s in [
            StrategyKind::Bootstrap,
            StrategyKind::Full,
            StrategyKind::AffectedKeys,
            StrategyKind::ParallelAffectedKeys,
            StrategyKind::Skipped,
        ] {
            assert_eq!(StrategyKind::parse(s.as_str()).unwrap(), s);
        }
        assert!(SubtaskStatus::parse("unknown").is_err());
    }

    #[test]
    fn snapshot_map_json_is_deterministic() {
        let mut map = SnapshotMap::new();
        map.insert("orders".into(), 7);
        map.insert("customers".into(), 3);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"customers":3,"orders":7}"#);
    }

    #[test]
    fn manual_priority_sorts_before_scheduled() {
        assert!(PendingRefresh::MANUAL_PRIORITY < 0);
    }
}
