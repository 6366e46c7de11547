//! Registry operations behind the CLI: create, alter, drop, suspend,
//! resume, manual refresh, listings.
//!
//! Everything DDL-shaped validates here (cycles, impossible strategies,
//! out-of-range properties) so refresh-time code can trust the stored
//! model.

use freshet_sql::{RefreshCapability, TableDefinition};
use freshet_types::{
    now_iso, DynamicTable, HistoryEntry, InitializeMode, PendingRefresh, RefreshError,
    RefreshStrategy, RefreshTrigger, SourceRef, TableName, TableStatus, TargetLag,
};

use freshet_lake::Lake;
use freshet_meta::MetaStore;

use crate::errors::EngineError;
use crate::graph::DependencyGraph;

/// Create a dynamic table from a parsed definition: cycle check, invariant
/// enforcement, registration, and (for `initialize = on_create`) an
/// immediate bootstrap enqueue.
///
/// # Errors
///
/// Returns a definitional error for duplicate names (without
/// `IF NOT EXISTS`), cycles, or strategy/shape mismatches.
pub fn create_table(meta: &dyn MetaStore, def: &TableDefinition) -> Result<DynamicTable, EngineError> {
    if let Some(existing) = meta.get_table(&def.name)? {
        if def.if_not_exists {
            return Ok(existing);
        }
        return Err(RefreshError::definitional(
            "TABLE_EXISTS",
            format!("dynamic table '{}' already exists", def.name),
        )
        .into());
    }

    let tables = meta.list_tables()?;
    let edges = meta.dependencies()?;
    let mut graph = DependencyGraph::from_edges(
        tables.iter().map(|t| t.name.as_str().to_string()),
        edges
            .iter()
            .map(|(d, u)| (d.as_str().to_string(), u.as_str().to_string())),
    );
    graph
        .add_table(def.name.as_str(), def.shape.sources.iter().cloned())
        .map_err(|e| RefreshError::definitional("DEPENDENCY_CYCLE", e.to_string()))?;

    let registered: Vec<&DynamicTable> = tables.iter().collect();
    let sources: Vec<SourceRef> = def
        .shape
        .sources
        .iter()
        .map(|name| SourceRef {
            name: name.clone(),
            is_dynamic: registered.iter().any(|t| t.name.as_str() == name),
        })
        .collect();

    // Invariant: grouping keys are stored non-empty iff the strategy can
    // be affected_keys.
    let grouping_keys = if def.shape.capability == RefreshCapability::AffectedKeys {
        def.shape.grouping_keys.clone()
    } else {
        Vec::new()
    };

    let table = DynamicTable {
        name: def.name.clone(),
        query_sql: def.query_sql.clone(),
        grouping_keys,
        sources,
        target_lag: def.target_lag,
        refresh_strategy: def.refresh_strategy,
        deduplication: def.deduplication,
        cardinality_threshold: def.cardinality_threshold,
        allow_parallel: def.allow_parallel,
        parallel_threshold: def.parallel_threshold,
        max_parallelism: def.max_parallelism,
        shadow: def.shadow,
        initialize: def.initialize,
        status: TableStatus::Active,
        comment: def.comment.clone(),
        created_at: now_iso(),
        updated_at: now_iso(),
    };
    meta.register_table(&table)?;
    tracing::info!(table = %table.name, sources = table.sources.len(), "Dynamic table created");

    if table.initialize == InitializeMode::OnCreate {
        // Chains created together bootstrap in dependency order: the
        // depth offset keeps upstream-first priority within the elevated
        // manual band.
        let depth = graph
            .depths()
            .map(|d| d.get(def.name.as_str()).copied().unwrap_or(0))
            .unwrap_or(0);
        let pending = PendingRefresh {
            dynamic_table: table.name.clone(),
            due_at: now_iso(),
            priority: PendingRefresh::MANUAL_PRIORITY + i32::try_from(depth).unwrap_or(0),
            trigger: RefreshTrigger::Manual,
            enqueued_at: now_iso(),
        };
        meta.enqueue_refresh(&pending, true)?;
    }

    Ok(table)
}

/// Apply `--set KEY=VALUE` updates to a table's properties.
///
/// # Errors
///
/// Returns a definitional error for unknown keys, unparseable values, or
/// changes that would violate invariants (e.g. `affected_keys` on a
/// full-only query).
pub fn alter_table(
    meta: &dyn MetaStore,
    name: &TableName,
    sets: &[(String, String)],
) -> Result<DynamicTable, EngineError> {
    let mut table = require_table(meta, name)?;

    for (key, value) in sets {
        apply_property(&mut table, key, value)?;
    }

    // Re-validate the strategy invariant against the stored query.
    if table.refresh_strategy == RefreshStrategy::AffectedKeys {
        let shape = freshet_sql::analyze_query(&table.query_sql)?;
        freshet_sql::validate_strategy(&shape, RefreshStrategy::AffectedKeys)?;
    }

    table.updated_at = now_iso();
    meta.update_table(&table)?;
    tracing::info!(table = %name, changes = sets.len(), "Dynamic table altered");
    Ok(table)
}

fn apply_property(table: &mut DynamicTable, key: &str, value: &str) -> Result<(), EngineError> {
    let bad = |msg: String| -> EngineError {
        RefreshError::definitional("INVALID_PROPERTY", msg).into()
    };
    match key.to_ascii_lowercase().as_str() {
        "target_lag" => {
            table.target_lag = TargetLag::parse(value)
                .map_err(|v| bad(format!("invalid target_lag '{v}'")))?;
        }
        "refresh_strategy" => {
            table.refresh_strategy = RefreshStrategy::parse(value)
                .map_err(|v| bad(format!("invalid refresh_strategy '{v}'")))?;
        }
        "deduplication" | "deduplicate" => {
            table.deduplication = parse_bool(value).map_err(bad)?;
        }
        "cardinality_threshold" => {
            let v: f64 = value
                .parse()
                .map_err(|_| bad(format!("invalid cardinality_threshold '{value}'")))?;
            if !(0.0..=1.0).contains(&v) {
                return Err(bad(format!(
                    "cardinality_threshold must be in [0, 1], got {v}"
                )));
            }
            table.cardinality_threshold = v;
        }
        "allow_parallel" => {
            table.allow_parallel = parse_bool(value).map_err(bad)?;
        }
        "parallel_threshold" => {
            table.parallel_threshold = value
                .parse()
                .map_err(|_| bad(format!("invalid parallel_threshold '{value}'")))?;
        }
        "max_parallelism" => {
            let v: u32 = value
                .parse()
                .map_err(|_| bad(format!("invalid max_parallelism '{value}'")))?;
            if v < 2 {
                return Err(bad(format!("max_parallelism must be at least 2, got {v}")));
            }
            table.max_parallelism = v;
        }
        "shadow_refresh" | "shadow" => {
            table.shadow = parse_bool(value).map_err(bad)?;
        }
        "initialize" => {
            table.initialize = InitializeMode::parse(value)
                .map_err(|v| bad(format!("invalid initialize '{v}'")))?;
        }
        "comment" => {
            table.comment = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
        }
        other => {
            return Err(bad(format!("unknown property '{other}'")));
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true or false, got '{other}'")),
    }
}

/// Drop a table: metadata cascade plus the lake-side data table. Refused
/// while dependents exist.
///
/// # Errors
///
/// Returns a definitional error naming the dependents when any exist.
pub async fn drop_table(
    meta: &dyn MetaStore,
    lake: &dyn Lake,
    name: &TableName,
) -> Result<(), EngineError> {
    require_table(meta, name)?;
    let dependents = meta.dependents_of(name)?;
    if !dependents.is_empty() {
        let names: Vec<&str> = dependents.iter().map(TableName::as_str).collect();
        return Err(RefreshError::definitional(
            "HAS_DEPENDENTS",
            format!("cannot drop '{name}': tables {names:?} depend on it"),
        )
        .into());
    }
    meta.drop_table(name)?;
    // The data table may never have been bootstrapped.
    if let Err(e) = lake.drop_table(name.as_str()).await {
        tracing::warn!(table = %name, "Dropping lake table failed: {e}");
    }
    tracing::info!(table = %name, "Dynamic table dropped");
    Ok(())
}

/// Suspend scheduling for a table.
///
/// # Errors
///
/// Returns a definitional error when the table does not exist.
pub fn suspend(meta: &dyn MetaStore, name: &TableName) -> Result<(), EngineError> {
    require_table(meta, name)?;
    meta.set_status(name, TableStatus::Suspended)?;
    Ok(())
}

/// Resume scheduling; also clears `failed`.
///
/// # Errors
///
/// Returns a definitional error when the table does not exist.
pub fn resume(meta: &dyn MetaStore, name: &TableName) -> Result<(), EngineError> {
    require_table(meta, name)?;
    meta.set_status(name, TableStatus::Active)?;
    Ok(())
}

/// Enqueue a manual refresh with elevated priority, upgrading any queued
/// scheduled refresh in place.
///
/// # Errors
///
/// Returns a definitional error when the table does not exist.
pub fn manual_refresh(meta: &dyn MetaStore, name: &TableName) -> Result<(), EngineError> {
    require_table(meta, name)?;
    let pending = PendingRefresh {
        dynamic_table: name.clone(),
        due_at: now_iso(),
        priority: PendingRefresh::MANUAL_PRIORITY,
        trigger: RefreshTrigger::Manual,
        enqueued_at: now_iso(),
    };
    meta.enqueue_refresh(&pending, true)?;
    Ok(())
}

/// One row of `freshet list`.
#[derive(Debug, Clone)]
pub struct TableSummary {
    pub name: TableName,
    pub status: TableStatus,
    pub target_lag: TargetLag,
    pub strategy: RefreshStrategy,
    pub last_refresh: Option<String>,
    pub staleness_seconds: Option<i64>,
    pub last_error_code: Option<String>,
}

/// Summaries for every registered table.
///
/// # Errors
///
/// Returns an error on metadata-store failure.
pub fn list_summaries(meta: &dyn MetaStore) -> Result<Vec<TableSummary>, EngineError> {
    let now = now_iso();
    let mut out = Vec::new();
    for table in meta.list_tables()? {
        let last = meta.last_success(&table.name)?;
        let last_refresh = last.map(|e| e.completed_at.unwrap_or(e.started_at));
        let staleness_seconds = last_refresh.as_deref().and_then(|m| seconds_between(m, &now));
        let last_error_code = if table.status == TableStatus::Failed {
            meta.history(&table.name, 1)?
                .into_iter()
                .next()
                .and_then(|e| e.error_code)
        } else {
            None
        };
        out.push(TableSummary {
            name: table.name.clone(),
            status: table.status,
            target_lag: table.target_lag,
            strategy: table.refresh_strategy,
            last_refresh,
            staleness_seconds,
            last_error_code,
        });
    }
    Ok(out)
}

/// Full properties plus recent history for `freshet describe`.
///
/// # Errors
///
/// Returns a definitional error when the table does not exist.
pub fn describe(
    meta: &dyn MetaStore,
    name: &TableName,
    history_limit: u32,
) -> Result<(DynamicTable, Vec<HistoryEntry>), EngineError> {
    let table = require_table(meta, name)?;
    let history = meta.history(name, history_limit)?;
    Ok((table, history))
}

fn require_table(meta: &dyn MetaStore, name: &TableName) -> Result<DynamicTable, EngineError> {
    meta.get_table(name)?.ok_or_else(|| {
        RefreshError::definitional(
            "NO_SUCH_TABLE",
            format!("dynamic table '{name}' does not exist"),
        )
        .into()
    })
}

fn seconds_between(since: &str, now: &str) -> Option<i64> {
    let a: chrono::DateTime<chrono::Utc> = since.parse().ok()?;
    let b: chrono::DateTime<chrono::Utc> = now.parse().ok()?;
    Some((b - a).num_seconds())
}
