//! `SQLite`-backed implementation of [`MetaStore`].
//!
//! Single-node and test backend. Uses a single `Mutex<Connection>`; every
//! operation is short, so contention is not a concern. The schema mirrors
//! the PostgreSQL backend with SQLite spellings.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use freshet_types::{
    now_iso, Claim, DynamicTable, HistoryEntry, PendingRefresh, SourceSnapshot, SnapshotMap,
    Subtask, SubtaskPayload, TableName, TableStatus, WorkerId,
};

use crate::backend::{MetaStore, SubtaskCounts, SweepOutcome};
use crate::codec::{ClaimRow, HistoryRow, PendingRow, SubtaskRow, TableRow};
use crate::error::{self, MetaError};

/// Idempotent DDL for the coordination schema (`SQLite` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS dynamic_tables (
    name TEXT PRIMARY KEY,
    query_sql TEXT NOT NULL,
    grouping_keys TEXT NOT NULL,
    sources TEXT NOT NULL,
    target_lag TEXT NOT NULL,
    refresh_strategy TEXT NOT NULL,
    deduplication BOOLEAN NOT NULL DEFAULT 0,
    cardinality_threshold REAL NOT NULL DEFAULT 0.3,
    allow_parallel BOOLEAN NOT NULL DEFAULT 0,
    parallel_threshold INTEGER NOT NULL,
    max_parallelism INTEGER NOT NULL,
    shadow BOOLEAN NOT NULL DEFAULT 0,
    initialize TEXT NOT NULL,
    status TEXT NOT NULL,
    comment TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS source_snapshots (
    dynamic_table TEXT NOT NULL REFERENCES dynamic_tables(name) ON DELETE CASCADE,
    source TEXT NOT NULL,
    last_snapshot INTEGER NOT NULL,
    last_processed_at TEXT NOT NULL,
    PRIMARY KEY (dynamic_table, source)
);

CREATE TABLE IF NOT EXISTS dependencies (
    downstream TEXT NOT NULL REFERENCES dynamic_tables(name) ON DELETE CASCADE,
    upstream TEXT NOT NULL,
    PRIMARY KEY (downstream, upstream)
);

CREATE INDEX IF NOT EXISTS idx_dependencies_upstream ON dependencies(upstream);

CREATE TABLE IF NOT EXISTS refresh_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dynamic_table TEXT NOT NULL REFERENCES dynamic_tables(name) ON DELETE CASCADE,
    worker_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    strategy TEXT NOT NULL,
    rows_affected INTEGER,
    affected_keys_count INTEGER,
    duration_ms INTEGER,
    error_code TEXT,
    error_message TEXT,
    snapshots_json TEXT NOT NULL,
    trigger_kind TEXT NOT NULL,
    UNIQUE (dynamic_table, started_at, worker_id)
);

CREATE INDEX IF NOT EXISTS idx_history_table ON refresh_history(dynamic_table, started_at);

CREATE TABLE IF NOT EXISTS pending_refreshes (
    dynamic_table TEXT PRIMARY KEY REFERENCES dynamic_tables(name) ON DELETE CASCADE,
    due_at TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    trigger_kind TEXT NOT NULL DEFAULT 'scheduled',
    enqueued_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS refresh_claims (
    dynamic_table TEXT PRIMARY KEY,
    worker_id TEXT NOT NULL,
    claimed_at TEXT NOT NULL,
    heartbeat_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    mode TEXT NOT NULL DEFAULT 'single',
    subtasks_total INTEGER NOT NULL DEFAULT 0,
    subtasks_completed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS refresh_subtasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_refresh TEXT NOT NULL REFERENCES pending_refreshes(dynamic_table) ON DELETE CASCADE,
    dynamic_table TEXT NOT NULL,
    kind TEXT NOT NULL,
    partition_spec_json TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    result_location TEXT,
    claimed_by TEXT,
    claimed_at TEXT,
    heartbeat_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_subtasks_status ON refresh_subtasks(status, id);
";

const TABLE_COLS: &str = "name, query_sql, grouping_keys, sources, target_lag, refresh_strategy, \
     deduplication, cardinality_threshold, allow_parallel, parallel_threshold, max_parallelism, \
     shadow, initialize, status, comment, created_at, updated_at";

const HISTORY_COLS: &str = "dynamic_table, worker_id, started_at, completed_at, status, strategy, \
     rows_affected, affected_keys_count, duration_ms, error_code, error_message, snapshots_json, \
     trigger_kind";

const SUBTASK_COLS: &str = "id, parent_refresh, dynamic_table, partition_spec_json, status, \
     result_location, claimed_by, claimed_at, heartbeat_at, completed_at, error_message, \
     retry_count, created_at";

const CLAIM_COLS: &str = "dynamic_table, worker_id, claimed_at, heartbeat_at, expires_at, mode, \
     subtasks_total, subtasks_completed";

/// `SQLite`-backed metadata store.
pub struct SqliteMetaStore {
    conn: Mutex<Connection>,
}

impl SqliteMetaStore {
    /// Open (or create) a file-backed store and initialize the schema.
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::Sqlite`] if the database cannot be opened or
    /// the DDL fails.
    pub fn open(path: &Path) -> error::Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open an in-memory store (used by tests and `freshet validate`).
    ///
    /// # Errors
    ///
    /// Returns [`MetaError::Sqlite`] if the DDL fails.
    pub fn in_memory() -> error::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| MetaError::LockPoisoned)
    }
}

fn read_table_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TableRow> {
    Ok(TableRow {
        name: row.get(0)?,
        query_sql: row.get(1)?,
        grouping_keys: row.get(2)?,
        sources: row.get(3)?,
        target_lag: row.get(4)?,
        refresh_strategy: row.get(5)?,
        deduplication: row.get(6)?,
        cardinality_threshold: row.get(7)?,
        allow_parallel: row.get(8)?,
        parallel_threshold: row.get(9)?,
        max_parallelism: row.get(10)?,
        shadow: row.get(11)?,
        initialize: row.get(12)?,
        status: row.get(13)?,
        comment: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn read_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        dynamic_table: row.get(0)?,
        worker_id: row.get(1)?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        status: row.get(4)?,
        strategy: row.get(5)?,
        rows_affected: row.get(6)?,
        affected_keys_count: row.get(7)?,
        duration_ms: row.get(8)?,
        error_code: row.get(9)?,
        error_message: row.get(10)?,
        snapshots_json: row.get(11)?,
        trigger_kind: row.get(12)?,
    })
}

fn read_subtask_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubtaskRow> {
    Ok(SubtaskRow {
        id: row.get(0)?,
        parent_refresh: row.get(1)?,
        dynamic_table: row.get(2)?,
        partition_spec_json: row.get(3)?,
        status: row.get(4)?,
        result_location: row.get(5)?,
        claimed_by: row.get(6)?,
        claimed_at: row.get(7)?,
        heartbeat_at: row.get(8)?,
        completed_at: row.get(9)?,
        error_message: row.get(10)?,
        retry_count: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn read_claim_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClaimRow> {
    Ok(ClaimRow {
        dynamic_table: row.get(0)?,
        worker_id: row.get(1)?,
        claimed_at: row.get(2)?,
        heartbeat_at: row.get(3)?,
        expires_at: row.get(4)?,
        mode: row.get(5)?,
        subtasks_total: row.get(6)?,
        subtasks_completed: row.get(7)?,
    })
}

fn expiry(now: &str, timeout_secs: u64) -> String {
    let now: chrono::DateTime<chrono::Utc> = now.parse().unwrap_or_else(|_| chrono::Utc::now());
    (now + chrono::Duration::seconds(i64::try_from(timeout_secs).unwrap_or(i64::MAX)))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

impl MetaStore for SqliteMetaStore {
    fn register_table(&self, table: &DynamicTable) -> error::Result<()> {
        let row = TableRow::from_table(table)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO dynamic_tables ({TABLE_COLS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                row.name,
                row.query_sql,
                row.grouping_keys,
                row.sources,
                row.target_lag,
                row.refresh_strategy,
                row.deduplication,
                row.cardinality_threshold,
                row.allow_parallel,
                row.parallel_threshold,
                row.max_parallelism,
                row.shadow,
                row.initialize,
                row.status,
                row.comment,
                row.created_at,
                row.updated_at,
            ],
        )?;
        for source in &table.sources {
            tx.execute(
                "INSERT INTO dependencies (downstream, upstream) VALUES (?1, ?2)",
                params![table.name.as_str(), source.name],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_table(&self, name: &TableName) -> error::Result<Option<DynamicTable>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {TABLE_COLS} FROM dynamic_tables WHERE name = ?1"),
                params![name.as_str()],
                read_table_row,
            )
            .optional()?;
        row.map(TableRow::into_table).transpose()
    }

    fn list_tables(&self) -> error::Result<Vec<DynamicTable>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {TABLE_COLS} FROM dynamic_tables ORDER BY name"))?;
        let rows = stmt.query_map([], read_table_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_table()?);
        }
        Ok(out)
    }

    fn update_table(&self, table: &DynamicTable) -> error::Result<()> {
        let row = TableRow::from_table(table)?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE dynamic_tables SET query_sql = ?2, grouping_keys = ?3, sources = ?4, \
             target_lag = ?5, refresh_strategy = ?6, deduplication = ?7, \
             cardinality_threshold = ?8, allow_parallel = ?9, parallel_threshold = ?10, \
             max_parallelism = ?11, shadow = ?12, initialize = ?13, status = ?14, \
             comment = ?15, updated_at = ?16 WHERE name = ?1",
            params![
                row.name,
                row.query_sql,
                row.grouping_keys,
                row.sources,
                row.target_lag,
                row.refresh_strategy,
                row.deduplication,
                row.cardinality_threshold,
                row.allow_parallel,
                row.parallel_threshold,
                row.max_parallelism,
                row.shadow,
                row.initialize,
                row.status,
                row.comment,
                now_iso(),
            ],
        )?;
        Ok(())
    }

    fn set_status(&self, name: &TableName, status: TableStatus) -> error::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE dynamic_tables SET status = ?2, updated_at = ?3 WHERE name = ?1",
            params![name.as_str(), status.as_str(), now_iso()],
        )?;
        Ok(())
    }

    fn drop_table(&self, name: &TableName) -> error::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM refresh_claims WHERE dynamic_table = ?1",
            params![name.as_str()],
        )?;
        conn.execute(
            "DELETE FROM dynamic_tables WHERE name = ?1",
            params![name.as_str()],
        )?;
        Ok(())
    }

    fn dependencies(&self) -> error::Result<Vec<(TableName, TableName)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT downstream, upstream FROM dependencies ORDER BY downstream")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (down, up) = row?;
            out.push((TableName::new(down), TableName::new(up)));
        }
        Ok(out)
    }

    fn dependents_of(&self, upstream: &TableName) -> error::Result<Vec<TableName>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT downstream FROM dependencies WHERE upstream = ?1 ORDER BY downstream")?;
        let rows = stmt.query_map(params![upstream.as_str()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(TableName::new(row?));
        }
        Ok(out)
    }

    fn source_snapshots(&self, table: &TableName) -> error::Result<Vec<SourceSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source, last_snapshot, last_processed_at FROM source_snapshots \
             WHERE dynamic_table = ?1 ORDER BY source",
        )?;
        let rows = stmt.query_map(params![table.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (source, last_snapshot, last_processed_at) = row?;
            out.push(SourceSnapshot {
                dynamic_table: table.clone(),
                source,
                last_snapshot,
                last_processed_at,
            });
        }
        Ok(out)
    }

    fn advance_snapshots(&self, table: &TableName, snapshots: &SnapshotMap) -> error::Result<()> {
        let now = now_iso();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (source, snapshot) in snapshots {
            tx.execute(
                "INSERT INTO source_snapshots \
                 (dynamic_table, source, last_snapshot, last_processed_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (dynamic_table, source) \
                 DO UPDATE SET last_snapshot = ?3, last_processed_at = ?4",
                params![table.as_str(), source, snapshot, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn append_history(&self, entry: &HistoryEntry) -> error::Result<()> {
        let row = HistoryRow::from_entry(entry)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO refresh_history ({HISTORY_COLS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                 ON CONFLICT (dynamic_table, started_at, worker_id) DO NOTHING"
            ),
            params![
                row.dynamic_table,
                row.worker_id,
                row.started_at,
                row.completed_at,
                row.status,
                row.strategy,
                row.rows_affected,
                row.affected_keys_count,
                row.duration_ms,
                row.error_code,
                row.error_message,
                row.snapshots_json,
                row.trigger_kind,
            ],
        )?;
        Ok(())
    }

    fn history(&self, table: &TableName, limit: u32) -> error::Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLS} FROM refresh_history WHERE dynamic_table = ?1 \
             ORDER BY started_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![table.as_str(), limit], read_history_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_entry()?);
        }
        Ok(out)
    }

    fn last_success(&self, table: &TableName) -> error::Result<Option<HistoryEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {HISTORY_COLS} FROM refresh_history \
                     WHERE dynamic_table = ?1 AND status IN ('success', 'skipped') \
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![table.as_str()],
                read_history_row,
            )
            .optional()?;
        row.map(HistoryRow::into_entry).transpose()
    }

    fn last_with_outcome(
        &self,
        table: &TableName,
        outcome: freshet_types::RefreshOutcome,
    ) -> error::Result<Option<HistoryEntry>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {HISTORY_COLS} FROM refresh_history \
                     WHERE dynamic_table = ?1 AND status = ?2 \
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![table.as_str(), outcome.as_str()],
                read_history_row,
            )
            .optional()?;
        row.map(HistoryRow::into_entry).transpose()
    }

    fn enqueue_refresh(&self, pending: &PendingRefresh, upgrade: bool) -> error::Result<bool> {
        let conn = self.lock()?;
        let changed = if upgrade {
            conn.execute(
                "INSERT INTO pending_refreshes \
                 (dynamic_table, due_at, priority, trigger_kind, enqueued_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (dynamic_table) DO UPDATE SET \
                 priority = MIN(pending_refreshes.priority, excluded.priority), \
                 due_at = MIN(pending_refreshes.due_at, excluded.due_at), \
                 trigger_kind = excluded.trigger_kind \
                 WHERE excluded.priority < pending_refreshes.priority \
                    OR excluded.due_at < pending_refreshes.due_at",
                params![
                    pending.dynamic_table.as_str(),
                    pending.due_at,
                    pending.priority,
                    pending.trigger.as_str(),
                    pending.enqueued_at,
                ],
            )?
        } else {
            conn.execute(
                "INSERT INTO pending_refreshes \
                 (dynamic_table, due_at, priority, trigger_kind, enqueued_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (dynamic_table) DO NOTHING",
                params![
                    pending.dynamic_table.as_str(),
                    pending.due_at,
                    pending.priority,
                    pending.trigger.as_str(),
                    pending.enqueued_at,
                ],
            )?
        };
        Ok(changed > 0)
    }

    fn due_refreshes(&self, now: &str) -> error::Result<Vec<PendingRefresh>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT p.dynamic_table, p.due_at, p.priority, p.trigger_kind, p.enqueued_at \
             FROM pending_refreshes p \
             LEFT JOIN refresh_claims c ON c.dynamic_table = p.dynamic_table \
             WHERE p.due_at <= ?1 AND c.dynamic_table IS NULL \
             ORDER BY p.priority ASC, p.due_at ASC",
        )?;
        let rows = stmt.query_map(params![now], |row| {
            Ok(PendingRow {
                dynamic_table: row.get(0)?,
                due_at: row.get(1)?,
                priority: row.get(2)?,
                trigger_kind: row.get(3)?,
                enqueued_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_pending()?);
        }
        Ok(out)
    }

    fn delete_pending(&self, table: &TableName) -> error::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pending_refreshes WHERE dynamic_table = ?1",
            params![table.as_str()],
        )?;
        Ok(())
    }

    fn try_claim(
        &self,
        table: &TableName,
        worker: &WorkerId,
        timeout_secs: u64,
    ) -> error::Result<Option<Claim>> {
        let now = now_iso();
        let expires = expiry(&now, timeout_secs);
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO refresh_claims \
             (dynamic_table, worker_id, claimed_at, heartbeat_at, expires_at, mode, \
              subtasks_total, subtasks_completed) \
             VALUES (?1, ?2, ?3, ?3, ?4, 'single', 0, 0) \
             ON CONFLICT (dynamic_table) DO NOTHING",
            params![table.as_str(), worker.as_str(), now, expires],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let row = conn.query_row(
            &format!("SELECT {CLAIM_COLS} FROM refresh_claims WHERE dynamic_table = ?1"),
            params![table.as_str()],
            read_claim_row,
        )?;
        Ok(Some(row.into_claim()?))
    }

    fn heartbeat_claim(
        &self,
        table: &TableName,
        worker: &WorkerId,
        timeout_secs: u64,
    ) -> error::Result<bool> {
        let now = now_iso();
        let expires = expiry(&now, timeout_secs);
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE refresh_claims SET heartbeat_at = ?3, expires_at = ?4 \
             WHERE dynamic_table = ?1 AND worker_id = ?2",
            params![table.as_str(), worker.as_str(), now, expires],
        )?;
        Ok(changed > 0)
    }

    fn release_claim(&self, table: &TableName, worker: &WorkerId) -> error::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM refresh_claims WHERE dynamic_table = ?1 AND worker_id = ?2",
            params![table.as_str(), worker.as_str()],
        )?;
        Ok(())
    }

    fn get_claim(&self, table: &TableName) -> error::Result<Option<Claim>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {CLAIM_COLS} FROM refresh_claims WHERE dynamic_table = ?1"),
                params![table.as_str()],
                read_claim_row,
            )
            .optional()?;
        row.map(ClaimRow::into_claim).transpose()
    }

    fn expire_claims(&self, now: &str) -> error::Result<Vec<TableName>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "DELETE FROM refresh_claims WHERE expires_at < ?1 RETURNING dynamic_table",
        )?;
        let rows = stmt.query_map(params![now], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(TableName::new(row?));
        }
        Ok(out)
    }

    fn convert_claim_to_coordinator(
        &self,
        table: &TableName,
        worker: &WorkerId,
        subtasks_total: u32,
    ) -> error::Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE refresh_claims SET mode = 'coordinator', subtasks_total = ?3 \
             WHERE dynamic_table = ?1 AND worker_id = ?2 AND mode = 'single'",
            params![table.as_str(), worker.as_str(), subtasks_total],
        )?;
        Ok(changed > 0)
    }

    fn update_claim_progress(
        &self,
        table: &TableName,
        worker: &WorkerId,
        subtasks_completed: u32,
    ) -> error::Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE refresh_claims SET subtasks_completed = ?3 \
             WHERE dynamic_table = ?1 AND worker_id = ?2",
            params![table.as_str(), worker.as_str(), subtasks_completed],
        )?;
        Ok(changed > 0)
    }

    fn idle_worker_estimate(&self, since: &str) -> error::Result<u32> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ( \
               SELECT DISTINCT worker_id FROM refresh_history WHERE started_at >= ?1 \
               EXCEPT SELECT worker_id FROM refresh_claims \
               EXCEPT SELECT claimed_by FROM refresh_subtasks \
                 WHERE status = 'claimed' AND claimed_by IS NOT NULL \
             )",
            params![since],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(count).unwrap_or(0))
    }

    fn publish_subtasks(
        &self,
        table: &TableName,
        payloads: &[SubtaskPayload],
    ) -> error::Result<Vec<i64>> {
        let now = now_iso();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            tx.execute(
                "INSERT INTO refresh_subtasks \
                 (parent_refresh, dynamic_table, kind, partition_spec_json, status, \
                  retry_count, created_at) \
                 VALUES (?1, ?1, ?2, ?3, 'pending', 0, ?4)",
                params![
                    table.as_str(),
                    payload.spec.kind(),
                    serde_json::to_string(payload)?,
                    now
                ],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(ids)
    }

    fn claim_subtask(&self, worker: &WorkerId) -> error::Result<Option<Subtask>> {
        let now = now_iso();
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "UPDATE refresh_subtasks \
                     SET status = 'claimed', claimed_by = ?1, claimed_at = ?2, heartbeat_at = ?2 \
                     WHERE id = (SELECT id FROM refresh_subtasks WHERE status = 'pending' \
                                 ORDER BY id LIMIT 1) \
                       AND status = 'pending' \
                     RETURNING {SUBTASK_COLS}"
                ),
                params![worker.as_str(), now],
                read_subtask_row,
            )
            .optional()?;
        row.map(SubtaskRow::into_subtask).transpose()
    }

    fn heartbeat_subtask(&self, id: i64, worker: &WorkerId) -> error::Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE refresh_subtasks SET heartbeat_at = ?3 \
             WHERE id = ?1 AND claimed_by = ?2 AND status = 'claimed'",
            params![id, worker.as_str(), now_iso()],
        )?;
        Ok(changed > 0)
    }

    fn complete_subtask(
        &self,
        id: i64,
        worker: &WorkerId,
        result_location: &str,
    ) -> error::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE refresh_subtasks \
             SET status = 'completed', result_location = ?3, completed_at = ?4 \
             WHERE id = ?1 AND claimed_by = ?2 AND status = 'claimed'",
            params![id, worker.as_str(), result_location, now_iso()],
        )?;
        Ok(())
    }

    fn fail_subtask(&self, id: i64, error_message: &str) -> error::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE refresh_subtasks \
             SET status = 'failed', error_message = ?2, retry_count = retry_count + 1 \
             WHERE id = ?1",
            params![id, error_message],
        )?;
        Ok(())
    }

    fn subtask_counts(&self, table: &TableName, retry_max: u32) -> error::Result<SubtaskCounts> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, retry_count >= ?2, COUNT(*) FROM refresh_subtasks \
             WHERE parent_refresh = ?1 GROUP BY status, retry_count >= ?2",
        )?;
        let rows = stmt.query_map(params![table.as_str(), retry_max], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut counts = SubtaskCounts::default();
        for row in rows {
            let (status, exhausted, n) = row?;
            let n = u32::try_from(n).unwrap_or(0);
            match status.as_str() {
                "pending" => counts.pending += n,
                "claimed" => counts.claimed += n,
                "completed" => counts.completed += n,
                "failed" if exhausted => counts.failed_terminal += n,
                "failed" => counts.failed_retryable += n,
                other => return Err(MetaError::Corrupt(format!("unknown status: '{other}'"))),
            }
        }
        Ok(counts)
    }

    fn list_subtasks(&self, table: &TableName) -> error::Result<Vec<Subtask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBTASK_COLS} FROM refresh_subtasks WHERE parent_refresh = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![table.as_str()], read_subtask_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_subtask()?);
        }
        Ok(out)
    }

    fn delete_subtasks(&self, table: &TableName) -> error::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM refresh_subtasks WHERE parent_refresh = ?1",
            params![table.as_str()],
        )?;
        Ok(())
    }

    fn sweep(&self, stale_before: &str, retry_max: u32) -> error::Result<SweepOutcome> {
        let conn = self.lock()?;
        let requeued_stale = conn.execute(
            "UPDATE refresh_subtasks \
             SET status = 'pending', claimed_by = NULL, claimed_at = NULL, \
                 heartbeat_at = NULL, retry_count = retry_count + 1 \
             WHERE status = 'claimed' AND heartbeat_at < ?1 AND retry_count < ?2",
            params![stale_before, retry_max],
        )?;
        let failed = conn.execute(
            "UPDATE refresh_subtasks \
             SET status = 'failed', \
                 error_message = COALESCE(error_message, 'heartbeat expired') \
             WHERE status = 'claimed' AND heartbeat_at < ?1",
            params![stale_before],
        )?;
        let requeued_failed = conn.execute(
            "UPDATE refresh_subtasks \
             SET status = 'pending', claimed_by = NULL, claimed_at = NULL, heartbeat_at = NULL \
             WHERE status = 'failed' AND retry_count < ?1",
            params![retry_max],
        )?;
        let orphans = conn.execute(
            "DELETE FROM pending_refreshes \
             WHERE dynamic_table IN (SELECT DISTINCT parent_refresh FROM refresh_subtasks) \
               AND dynamic_table NOT IN (SELECT dynamic_table FROM refresh_claims)",
            [],
        )?;
        Ok(SweepOutcome {
            subtasks_requeued: u32::try_from(requeued_stale + requeued_failed).unwrap_or(0),
            subtasks_failed: u32::try_from(failed).unwrap_or(0),
            orphans_deleted: u32::try_from(orphans).unwrap_or(0),
        })
    }
}
