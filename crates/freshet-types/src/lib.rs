//! Shared model and error types for the Freshet dynamic-table engine.
//!
//! Pure data: no I/O, no SQL. Kept in its own crate so the metadata store,
//! lake client, and engine can share them without circular dependencies.

pub mod error;
pub mod state;
pub mod table;

pub use error::{ErrorKind, RefreshError};
pub use state::{
    Claim, ClaimMode, HistoryEntry, PartitionSpec, PendingRefresh, RefreshOutcome, RefreshTrigger,
    SnapshotId, SnapshotMap, SourceSnapshot, StrategyKind, Subtask, SubtaskPayload, SubtaskStatus,
    WorkerId,
};
pub use table::{
    DynamicTable, InitializeMode, RefreshStrategy, SourceRef, TableName, TableStatus, TargetLag,
};

/// Current UTC time as a fixed-width RFC 3339 string.
///
/// Microsecond precision with a literal `Z` suffix, so string comparison
/// orders the same way the instants do. Every persisted timestamp in the
/// metadata store uses this format.
#[must_use]
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_iso_is_fixed_width_utc() {
        let a = now_iso();
        assert!(a.ends_with('Z'), "got: {a}");
        assert_eq!(a.len(), "2026-01-15T10:00:00.000000Z".len(), "got: {a}");
    }

    #[test]
    fn now_iso_orders_lexically() {
        let a = now_iso();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_iso();
        assert!(a < b);
    }
}
