//! DuckLake implementation of [`Lake`].
//!
//! Wraps a DuckDB connection with the `ducklake` extension loaded and a
//! catalog attached under the alias [`CATALOG`]. The engine's pin clause
//! (`FOR SYSTEM_TIME AS OF <n>`) is translated to DuckLake's
//! `AT (VERSION => n)` at the execution boundary; change feeds map to
//! `ducklake_table_changes`.

use std::sync::{LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use duckdb::Connection;
use regex::Regex;

use freshet_types::SnapshotId;

use crate::error::{DuckResultExt, LakeError, Result};
use crate::lake::Lake;

/// Alias the DuckLake catalog is attached under.
pub const CATALOG: &str = "lake";

static PIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bFOR SYSTEM_TIME AS OF (\d+)\b").expect("valid pin regex")
});

/// Translate engine pin clauses to DuckLake's native spelling.
fn translate_pins(sql: &str) -> String {
    PIN_RE.replace_all(sql, "AT (VERSION => $1)").into_owned()
}

/// Split a source name into (schema, table), defaulting to `main`.
fn split_source(source: &str) -> (&str, &str) {
    source.rsplit_once('.').unwrap_or(("main", source))
}

/// DuckLake-backed lake client.
pub struct DuckLakeClient {
    conn: Mutex<Connection>,
}

impl DuckLakeClient {
    /// Open an in-process DuckDB, load the `ducklake` extension, and
    /// attach the catalog at `attach_uri`
    /// (e.g. `"ducklake:postgres:host=... dbname=lakemeta"`).
    ///
    /// # Errors
    ///
    /// Returns [`LakeError::Connection`] when the database cannot be
    /// opened, the extension fails to load, or the attach fails.
    pub fn open(attach_uri: &str, data_path: Option<&str>) -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| LakeError::Connection(e.to_string()))?;
        conn.execute_batch("INSTALL ducklake; LOAD ducklake;")
            .map_err(|e| LakeError::Connection(format!("loading ducklake extension: {e}")))?;
        let attach = match data_path {
            Some(path) => format!("ATTACH '{attach_uri}' AS {CATALOG} (DATA_PATH '{path}');"),
            None => format!("ATTACH '{attach_uri}' AS {CATALOG};"),
        };
        conn.execute_batch(&format!("{attach} USE {CATALOG};"))
            .map_err(|e| LakeError::Connection(format!("attaching lake catalog: {e}")))?;
        tracing::info!(catalog = CATALOG, "Lake catalog attached");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LakeError::LockPoisoned)
    }
}

#[async_trait]
impl Lake for DuckLakeClient {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let sql = translate_pins(sql);
        let conn = self.lock()?;
        let changed = conn.execute(&sql, []).to_lake_err()?;
        Ok(changed as u64)
    }

    async fn query_i64(&self, sql: &str) -> Result<i64> {
        let sql = translate_pins(sql);
        let conn = self.lock()?;
        conn.query_row(&sql, [], |row| row.get(0)).to_lake_err()
    }

    async fn begin(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN TRANSACTION").to_lake_err()
    }

    async fn commit(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("COMMIT").to_lake_err()
    }

    async fn rollback(&self) -> Result<()> {
        let conn = self.lock()?;
        // Rolling back without an open transaction is not an error here;
        // the executor calls this unconditionally on failure paths.
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("no transaction") => Ok(()),
            Err(e) => Err(LakeError::Execution(e.to_string())),
        }
    }

    async fn current_snapshot(&self, _source: &str) -> Result<SnapshotId> {
        // DuckLake snapshots are catalog-wide and totally ordered, which
        // satisfies the per-source ordering contract.
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT MAX(snapshot_id) FROM ducklake_snapshots('{CATALOG}')"),
            [],
            |row| row.get(0),
        )
        .to_lake_err()
    }

    fn changes_relation(&self, source: &str, from: SnapshotId, to: SnapshotId) -> String {
        let (schema, table) = split_source(source);
        // ducklake_table_changes takes an inclusive start snapshot; the
        // feed must cover (from, to].
        format!(
            "ducklake_table_changes('{CATALOG}', '{schema}', '{table}', {start}, {to})",
            start = from + 1
        )
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let (schema, table) = split_source(table);
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = ? AND table_name = ?",
                [schema, table],
                |row| row.get(0),
            )
            .to_lake_err()?;
        Ok(count > 0)
    }

    async fn create_table_as(&self, table: &str, select: &str) -> Result<()> {
        let sql = translate_pins(select);
        let conn = self.lock()?;
        conn.execute(&format!("CREATE TABLE {table} AS {sql}"), [])
            .to_lake_err()?;
        Ok(())
    }

    async fn create_temp_table_as(&self, table: &str, select: &str) -> Result<i64> {
        let sql = translate_pins(select);
        let conn = self.lock()?;
        conn.execute(
            &format!("CREATE OR REPLACE TEMP TABLE {table} AS {sql}"),
            [],
        )
        .to_lake_err()?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .to_lake_err()
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))
            .to_lake_err()
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))
            .to_lake_err()
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .to_lake_err()
    }
}
