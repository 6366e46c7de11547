//! Test lake: an in-memory DuckDB implementing the `Lake` trait with
//! simulated snapshots.
//!
//! `advance(source)` bumps the source's version and materializes a copy
//! (`__snap_<source>_<v>`); pinned reads resolve to the copies and change
//! feeds derive from `EXCEPT ALL` in both directions between two copies.
//! Small data only. Every refresh semantics test in this crate drives the
//! real executor through this lake.

use std::collections::BTreeMap;
use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use duckdb::Connection;
use regex::{Captures, Regex};

use freshet_lake::error::{LakeError, Result as LakeResult};
use freshet_lake::Lake;
use freshet_types::SnapshotId;

// Pins render as either `t AS a FOR SYSTEM_TIME AS OF n` or
// `t FOR SYSTEM_TIME AS OF n AS a` depending on the SQL writer; accept
// both.
static PIN_ALIAS_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b([A-Za-z_][A-Za-z0-9_.]*)\s+AS\s+([A-Za-z_][A-Za-z0-9_]*)\s+FOR SYSTEM_TIME AS OF (\d+)",
    )
    .expect("valid regex")
});
static PIN_VERSION_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_.]*)\s+FOR SYSTEM_TIME AS OF (\d+)")
        .expect("valid regex")
});

fn sanitize(source: &str) -> String {
    source.replace('.', "_")
}

fn snap_table(source: &str, version: i64) -> String {
    format!("__snap_{}_{}", sanitize(source), version)
}

/// Resolve pin clauses to snapshot-copy tables.
fn translate(sql: &str) -> String {
    let pass1 = PIN_ALIAS_FIRST.replace_all(sql, |caps: &Captures<'_>| {
        let version: i64 = caps[3].parse().expect("pin version");
        format!("{} AS {}", snap_table(&caps[1], version), &caps[2])
    });
    PIN_VERSION_FIRST
        .replace_all(&pass1, |caps: &Captures<'_>| {
            let version: i64 = caps[2].parse().expect("pin version");
            snap_table(&caps[1], version)
        })
        .into_owned()
}

pub struct SimLake {
    conn: Mutex<Connection>,
    versions: Mutex<BTreeMap<String, i64>>,
}

impl SimLake {
    pub fn new() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory duckdb");
        conn.execute_batch("CREATE SCHEMA IF NOT EXISTS dynamic;")
            .expect("create schema");
        Self {
            conn: Mutex::new(conn),
            versions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Raw statement, no pin translation. Test setup only.
    pub fn exec(&self, sql: &str) {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(sql)
            .unwrap_or_else(|e| panic!("exec failed: {e}\n  sql: {sql}"));
    }

    /// Key/value pairs, ordered by key. For asserting aggregate targets.
    pub fn pairs(&self, sql: &str) -> Vec<(i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).expect("prepare");
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
            .expect("query");
        rows.map(|r| r.expect("row")).collect()
    }

    /// Bump the source's version and materialize the snapshot copy.
    pub fn advance(&self, source: &str) -> i64 {
        let mut versions = self.versions.lock().unwrap();
        let version = versions.get(source).copied().unwrap_or(0) + 1;
        versions.insert(source.to_string(), version);
        drop(versions);
        self.exec(&format!(
            "CREATE TABLE {} AS SELECT * FROM {source}",
            snap_table(source, version)
        ));
        version
    }
}

#[async_trait]
impl Lake for SimLake {
    async fn execute(&self, sql: &str) -> LakeResult<u64> {
        let sql = translate(sql);
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(&sql, [])
            .map_err(|e| LakeError::Execution(format!("{e}: {sql}")))?;
        Ok(changed as u64)
    }

    async fn query_i64(&self, sql: &str) -> LakeResult<i64> {
        let sql = translate(sql);
        let conn = self.conn.lock().unwrap();
        conn.query_row(&sql, [], |row| row.get(0))
            .map_err(|e| LakeError::Execution(format!("{e}: {sql}")))
    }

    async fn begin(&self) -> LakeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN TRANSACTION")
            .map_err(|e| LakeError::Execution(e.to_string()))
    }

    async fn commit(&self) -> LakeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("COMMIT")
            .map_err(|e| LakeError::Execution(e.to_string()))
    }

    async fn rollback(&self) -> LakeResult<()> {
        let conn = self.conn.lock().unwrap();
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("no transaction") => Ok(()),
            Err(e) => Err(LakeError::Execution(e.to_string())),
        }
    }

    async fn current_snapshot(&self, source: &str) -> LakeResult<SnapshotId> {
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(source)
            .copied()
            .unwrap_or(0))
    }

    fn changes_relation(&self, source: &str, from: SnapshotId, to: SnapshotId) -> String {
        let new = snap_table(source, to);
        if from <= 0 {
            return format!("(SELECT * FROM {new})");
        }
        let old = snap_table(source, from);
        format!(
            "((SELECT * FROM {new} EXCEPT ALL SELECT * FROM {old}) \
              UNION ALL \
              (SELECT * FROM {old} EXCEPT ALL SELECT * FROM {new}))"
        )
    }

    async fn table_exists(&self, table: &str) -> LakeResult<bool> {
        let (schema, table) = table.rsplit_once('.').unwrap_or(("main", table));
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = ? AND table_name = ?",
                [schema, table],
                |row| row.get(0),
            )
            .map_err(|e| LakeError::Execution(e.to_string()))?;
        Ok(count > 0)
    }

    async fn create_table_as(&self, table: &str, select: &str) -> LakeResult<()> {
        let select = translate(select);
        let conn = self.conn.lock().unwrap();
        conn.execute(&format!("CREATE TABLE {table} AS {select}"), [])
            .map_err(|e| LakeError::Execution(format!("{e}: CREATE TABLE {table}")))?;
        Ok(())
    }

    async fn create_temp_table_as(&self, table: &str, select: &str) -> LakeResult<i64> {
        let select = translate(select);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("CREATE OR REPLACE TEMP TABLE {table} AS {select}"),
            [],
        )
        .map_err(|e| LakeError::Execution(format!("{e}: CREATE TEMP TABLE {table} AS {select}")))?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .map_err(|e| LakeError::Execution(e.to_string()))
    }

    async fn drop_table(&self, table: &str) -> LakeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))
            .map_err(|e| LakeError::Execution(e.to_string()))
    }

    async fn rename_table(&self, from: &str, to: &str) -> LakeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))
            .map_err(|e| LakeError::Execution(e.to_string()))
    }

    async fn row_count(&self, table: &str) -> LakeResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .map_err(|e| LakeError::Execution(e.to_string()))
    }
}
