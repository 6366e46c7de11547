//! Row codecs shared by the backends.
//!
//! Each backend reads its native row into one of these plain structs; the
//! conversion to model types (JSON columns, enum labels) lives here so both
//! backends decode identically and corruption surfaces as
//! [`MetaError::Corrupt`](crate::MetaError::Corrupt).

use freshet_types::{
    Claim, ClaimMode, DynamicTable, HistoryEntry, PendingRefresh, RefreshOutcome, RefreshStrategy,
    RefreshTrigger, InitializeMode, SnapshotMap, SourceRef, StrategyKind, Subtask, SubtaskPayload,
    SubtaskStatus, TableName, TableStatus, TargetLag, WorkerId,
};

use crate::error::{MetaError, Result};

fn corrupt(field: &str, value: &str) -> MetaError {
    MetaError::Corrupt(format!("unknown {field}: '{value}'"))
}

/// Flat `dynamic_tables` row.
#[derive(Debug, Clone)]
pub(crate) struct TableRow {
    pub name: String,
    pub query_sql: String,
    pub grouping_keys: String,
    pub sources: String,
    pub target_lag: String,
    pub refresh_strategy: String,
    pub deduplication: bool,
    pub cardinality_threshold: f64,
    pub allow_parallel: bool,
    pub parallel_threshold: i64,
    pub max_parallelism: i64,
    pub shadow: bool,
    pub initialize: String,
    pub status: String,
    pub comment: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TableRow {
    pub fn from_table(table: &DynamicTable) -> Result<Self> {
        Ok(Self {
            name: table.name.as_str().to_string(),
            query_sql: table.query_sql.clone(),
            grouping_keys: serde_json::to_string(&table.grouping_keys)?,
            sources: serde_json::to_string(&table.sources)?,
            target_lag: table.target_lag.as_storage(),
            refresh_strategy: table.refresh_strategy.as_str().to_string(),
            deduplication: table.deduplication,
            cardinality_threshold: table.cardinality_threshold,
            allow_parallel: table.allow_parallel,
            parallel_threshold: i64::try_from(table.parallel_threshold).unwrap_or(i64::MAX),
            max_parallelism: i64::from(table.max_parallelism),
            shadow: table.shadow,
            initialize: table.initialize.as_str().to_string(),
            status: table.status.as_str().to_string(),
            comment: table.comment.clone(),
            created_at: table.created_at.clone(),
            updated_at: table.updated_at.clone(),
        })
    }

    pub fn into_table(self) -> Result<DynamicTable> {
        let grouping_keys: Vec<String> = serde_json::from_str(&self.grouping_keys)?;
        let sources: Vec<SourceRef> = serde_json::from_str(&self.sources)?;
        Ok(DynamicTable {
            name: TableName::new(self.name),
            query_sql: self.query_sql,
            grouping_keys,
            sources,
            target_lag: TargetLag::from_storage(&self.target_lag)
                .map_err(|v| corrupt("target_lag", &v))?,
            refresh_strategy: RefreshStrategy::parse(&self.refresh_strategy)
                .map_err(|v| corrupt("refresh_strategy", &v))?,
            deduplication: self.deduplication,
            cardinality_threshold: self.cardinality_threshold,
            allow_parallel: self.allow_parallel,
            parallel_threshold: u64::try_from(self.parallel_threshold).unwrap_or(0),
            max_parallelism: u32::try_from(self.max_parallelism).unwrap_or(2),
            shadow: self.shadow,
            initialize: InitializeMode::parse(&self.initialize)
                .map_err(|v| corrupt("initialize", &v))?,
            status: TableStatus::parse(&self.status).map_err(|v| corrupt("status", &v))?,
            comment: self.comment,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Flat `refresh_history` row.
#[derive(Debug, Clone)]
pub(crate) struct HistoryRow {
    pub dynamic_table: String,
    pub worker_id: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub strategy: String,
    pub rows_affected: Option<i64>,
    pub affected_keys_count: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub snapshots_json: String,
    pub trigger_kind: String,
}

impl HistoryRow {
    pub fn from_entry(entry: &HistoryEntry) -> Result<Self> {
        Ok(Self {
            dynamic_table: entry.dynamic_table.as_str().to_string(),
            worker_id: entry.worker_id.as_str().to_string(),
            started_at: entry.started_at.clone(),
            completed_at: entry.completed_at.clone(),
            status: entry.outcome.as_str().to_string(),
            strategy: entry.strategy.as_str().to_string(),
            rows_affected: entry.rows_affected,
            affected_keys_count: entry.affected_keys_count,
            duration_ms: entry.duration_ms,
            error_code: entry.error_code.clone(),
            error_message: entry.error_message.clone(),
            snapshots_json: serde_json::to_string(&entry.snapshots)?,
            trigger_kind: entry.trigger.as_str().to_string(),
        })
    }

    pub fn into_entry(self) -> Result<HistoryEntry> {
        let snapshots: SnapshotMap = serde_json::from_str(&self.snapshots_json)?;
        Ok(HistoryEntry {
            dynamic_table: TableName::new(self.dynamic_table),
            worker_id: WorkerId::new(self.worker_id),
            started_at: self.started_at,
            completed_at: self.completed_at,
            outcome: RefreshOutcome::parse(&self.status).map_err(|v| corrupt("status", &v))?,
            strategy: StrategyKind::parse(&self.strategy).map_err(|v| corrupt("strategy", &v))?,
            rows_affected: self.rows_affected,
            affected_keys_count: self.affected_keys_count,
            duration_ms: self.duration_ms,
            error_code: self.error_code,
            error_message: self.error_message,
            snapshots,
            trigger: RefreshTrigger::parse(&self.trigger_kind)
                .map_err(|v| corrupt("trigger", &v))?,
        })
    }
}

/// Flat `refresh_claims` row.
#[derive(Debug, Clone)]
pub(crate) struct ClaimRow {
    pub dynamic_table: String,
    pub worker_id: String,
    pub claimed_at: String,
    pub heartbeat_at: String,
    pub expires_at: String,
    pub mode: String,
    pub subtasks_total: i64,
    pub subtasks_completed: i64,
}

impl ClaimRow {
    pub fn into_claim(self) -> Result<Claim> {
        Ok(Claim {
            dynamic_table: TableName::new(self.dynamic_table),
            worker_id: WorkerId::new(self.worker_id),
            claimed_at: self.claimed_at,
            heartbeat_at: self.heartbeat_at,
            expires_at: self.expires_at,
            mode: ClaimMode::parse(&self.mode).map_err(|v| corrupt("mode", &v))?,
            subtasks_total: u32::try_from(self.subtasks_total).unwrap_or(0),
            subtasks_completed: u32::try_from(self.subtasks_completed).unwrap_or(0),
        })
    }
}

/// Flat `pending_refreshes` row.
#[derive(Debug, Clone)]
pub(crate) struct PendingRow {
    pub dynamic_table: String,
    pub due_at: String,
    pub priority: i64,
    pub trigger_kind: String,
    pub enqueued_at: String,
}

impl PendingRow {
    pub fn into_pending(self) -> Result<PendingRefresh> {
        Ok(PendingRefresh {
            dynamic_table: TableName::new(self.dynamic_table),
            due_at: self.due_at,
            priority: i32::try_from(self.priority).unwrap_or(0),
            trigger: RefreshTrigger::parse(&self.trigger_kind)
                .map_err(|v| corrupt("trigger", &v))?,
            enqueued_at: self.enqueued_at,
        })
    }
}

/// Flat `refresh_subtasks` row.
#[derive(Debug, Clone)]
pub(crate) struct SubtaskRow {
    pub id: i64,
    pub parent_refresh: String,
    pub dynamic_table: String,
    pub partition_spec_json: String,
    pub status: String,
    pub result_location: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub heartbeat_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
}

impl SubtaskRow {
    pub fn into_subtask(self) -> Result<Subtask> {
        let payload: SubtaskPayload = serde_json::from_str(&self.partition_spec_json)?;
        Ok(Subtask {
            id: self.id,
            parent_refresh: TableName::new(self.parent_refresh),
            dynamic_table: TableName::new(self.dynamic_table),
            payload,
            status: SubtaskStatus::parse(&self.status).map_err(|v| corrupt("status", &v))?,
            result_location: self.result_location,
            claimed_by: self.claimed_by.map(WorkerId::new),
            claimed_at: self.claimed_at,
            heartbeat_at: self.heartbeat_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_types::now_iso;

    #[test]
    fn table_row_round_trips() {
        let table = DynamicTable {
            name: TableName::new("dynamic.customer_counts"),
            query_sql: "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id".into(),
            grouping_keys: vec!["customer_id".into()],
            sources: vec![SourceRef { name: "orders".into(), is_dynamic: false }],
            target_lag: TargetLag::Downstream,
            refresh_strategy: RefreshStrategy::Auto,
            deduplication: true,
            cardinality_threshold: 0.25,
            allow_parallel: true,
            parallel_threshold: 1_000_000,
            max_parallelism: 8,
            shadow: false,
            initialize: InitializeMode::OnSchedule,
            status: TableStatus::Active,
            comment: Some("rollup".into()),
            created_at: now_iso(),
            updated_at: now_iso(),
        };
        let row = TableRow::from_table(&table).unwrap();
        let back = row.into_table().unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn bad_enum_label_is_corrupt() {
        let mut row = TableRow::from_table(&DynamicTable {
            name: TableName::new("t"),
            query_sql: "SELECT 1 FROM x".into(),
            grouping_keys: vec![],
            sources: vec![],
            target_lag: TargetLag::Downstream,
            refresh_strategy: RefreshStrategy::Full,
            deduplication: false,
            cardinality_threshold: 0.3,
            allow_parallel: false,
            parallel_threshold: 0,
            max_parallelism: 2,
            shadow: false,
            initialize: InitializeMode::OnCreate,
            status: TableStatus::Active,
            comment: None,
            created_at: now_iso(),
            updated_at: now_iso(),
        })
        .unwrap();
        row.status = "wedged".into();
        assert!(matches!(row.into_table(), Err(MetaError::Corrupt(_))));
    }
}
