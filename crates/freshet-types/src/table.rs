//! Dynamic-table model: identity, definition, and policy properties.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Qualified dynamic-table name (`schema.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    /// Create a table name from its qualified form.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Build from schema and bare table name.
    #[must_use]
    pub fn qualified(schema: &str, table: &str) -> Self {
        Self(format!("{schema}.{table}"))
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The schema component, if the name is qualified.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(s, _)| s)
    }

    /// The bare table component.
    #[must_use]
    pub fn table(&self) -> &str {
        self.0.rsplit_once('.').map_or(&self.0, |(_, t)| t)
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for TableName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Maximum allowed staleness relative to sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLag {
    /// Refresh whenever staleness exceeds this duration.
    Duration(Duration),
    /// Refresh whenever any upstream dynamic table refreshes.
    Downstream,
}

impl TargetLag {
    /// Parse the DDL form: `'downstream'` or `'<n> <unit>'` where unit is
    /// seconds/minutes/hours/days (singular or plural).
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a recognized lag.
    pub fn parse(input: &str) -> Result<Self, String> {
        let s = input.trim().to_ascii_lowercase();
        if s == "downstream" {
            return Ok(Self::Downstream);
        }
        let mut parts = s.split_whitespace();
        let (Some(n), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(input.to_string());
        };
        let n: u64 = n.parse().map_err(|_| input.to_string())?;
        let secs = match unit.trim_end_matches('s') {
            "second" | "sec" => n,
            "minute" | "min" => n * 60,
            "hour" => n * 3_600,
            "day" => n * 86_400,
            _ => return Err(input.to_string()),
        };
        Ok(Self::Duration(Duration::from_secs(secs)))
    }

    /// Storage / display form (`"300s"` or `"downstream"`).
    #[must_use]
    pub fn as_storage(&self) -> String {
        match self {
            Self::Duration(d) => format!("{}s", d.as_secs()),
            Self::Downstream => "downstream".to_string(),
        }
    }

    /// Parse the storage form produced by [`TargetLag::as_storage`].
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is neither `downstream` nor `<n>s`.
    pub fn from_storage(input: &str) -> Result<Self, String> {
        if input == "downstream" {
            return Ok(Self::Downstream);
        }
        let secs: u64 = input
            .strip_suffix('s')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| input.to_string())?;
        Ok(Self::Duration(Duration::from_secs(secs)))
    }
}

impl std::fmt::Display for TargetLag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_storage())
    }
}

/// User-selected refresh strategy policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStrategy {
    /// Engine picks the cheapest correct strategy.
    #[default]
    Auto,
    /// Always recompute from scratch.
    Full,
    /// Incremental recomputation of changed grouping keys.
    AffectedKeys,
}

impl RefreshStrategy {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Full => "full",
            Self::AffectedKeys => "affected_keys",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a known strategy.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "full" => Ok(Self::Full),
            "affected_keys" => Ok(Self::AffectedKeys),
            _ => Err(input.to_string()),
        }
    }
}

impl std::fmt::Display for RefreshStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the first population of a new table runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializeMode {
    /// Bootstrap immediately as part of `create`.
    #[default]
    OnCreate,
    /// Leave bootstrapping to the scheduler.
    OnSchedule,
}

impl InitializeMode {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnCreate => "on_create",
            Self::OnSchedule => "on_schedule",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a known mode.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input.to_ascii_lowercase().as_str() {
            "on_create" => Ok(Self::OnCreate),
            "on_schedule" => Ok(Self::OnSchedule),
            _ => Err(input.to_string()),
        }
    }
}

/// Scheduling status of a dynamic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    #[default]
    Active,
    Suspended,
    Failed,
}

impl TableStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns the offending input when it is not a known status.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "failed" => Ok(Self::Failed),
            _ => Err(input.to_string()),
        }
    }
}

impl std::fmt::Display for TableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relation referenced by a dynamic table's definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Logical source name as written in the query.
    pub name: String,
    /// Whether the source is itself a dynamic table (already materialized
    /// at a pinned version, so it is never snapshot-pinned).
    pub is_dynamic: bool,
}

/// A declaratively defined, query-backed table kept fresh by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicTable {
    /// Qualified target name.
    pub name: TableName,
    /// The stored definition query (the `AS ...` body).
    pub query_sql: String,
    /// Grouping-key columns, empty when the query has no extractable keys.
    pub grouping_keys: Vec<String>,
    /// Every relation the definition reads from.
    pub sources: Vec<SourceRef>,
    /// Staleness bound.
    pub target_lag: TargetLag,
    /// Strategy policy.
    pub refresh_strategy: RefreshStrategy,
    /// Enable the row-diff apply path for affected-keys refreshes.
    pub deduplication: bool,
    /// Affected/total ratio above which incremental falls back to full.
    pub cardinality_threshold: f64,
    /// Permit the parallel affected-keys path.
    pub allow_parallel: bool,
    /// Minimum affected-key count before parallel is considered.
    pub parallel_threshold: u64,
    /// Upper bound on subtasks per parallel refresh.
    pub max_parallelism: u32,
    /// Build the target from a temporary and swap, instead of in place.
    pub shadow: bool,
    /// When the initial bootstrap runs.
    pub initialize: InitializeMode,
    /// Scheduling status.
    pub status: TableStatus,
    /// Opaque user comment.
    pub comment: Option<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last-update timestamp.
    pub updated_at: String,
}

impl DynamicTable {
    /// Default `cardinality_threshold` when the DDL does not set one.
    pub const DEFAULT_CARDINALITY_THRESHOLD: f64 = 0.3;
    /// Default `parallel_threshold` (affected keys) when unset.
    pub const DEFAULT_PARALLEL_THRESHOLD: u64 = 10_000_000;
    /// Default `max_parallelism` when unset.
    pub const DEFAULT_MAX_PARALLELISM: u32 = 4;

    /// Names of sources that are base lake tables (not dynamic tables).
    #[must_use]
    pub fn base_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| !s.is_dynamic)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Names of sources that are themselves dynamic tables.
    #[must_use]
    pub fn upstream_dynamic(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| s.is_dynamic)
            .map(|s| s.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_components() {
        let n = TableName::qualified("dynamic", "customer_counts");
        assert_eq!(n.as_str(), "dynamic.customer_counts");
        assert_eq!(n.schema(), Some("dynamic"));
        assert_eq!(n.table(), "customer_counts");

        let bare = TableName::new("orders");
        assert_eq!(bare.schema(), None);
        assert_eq!(bare.table(), "orders");
    }

    #[test]
    fn target_lag_parses_ddl_forms() {
        assert_eq!(
            TargetLag::parse("5 minutes").unwrap(),
            TargetLag::Duration(Duration::from_secs(300))
        );
        assert_eq!(
            TargetLag::parse("1 hour").unwrap(),
            TargetLag::Duration(Duration::from_secs(3600))
        );
        assert_eq!(
            TargetLag::parse("30 seconds").unwrap(),
            TargetLag::Duration(Duration::from_secs(30))
        );
        assert_eq!(TargetLag::parse("DOWNSTREAM").unwrap(), TargetLag::Downstream);
        assert!(TargetLag::parse("5 fortnights").is_err());
        assert!(TargetLag::parse("minutes").is_err());
    }

    #[test]
    fn target_lag_storage_round_trip() {
        for lag in [
            TargetLag::Duration(Duration::from_secs(300)),
            TargetLag::Downstream,
        ] {
            assert_eq!(TargetLag::from_storage(&lag.as_storage()).unwrap(), lag);
        }
    }

    #[test]
    fn refresh_strategy_round_trip() {
        for s in [
            RefreshStrategy::Auto,
            RefreshStrategy::Full,
            RefreshStrategy::AffectedKeys,
        ] {
            assert_eq!(RefreshStrategy::parse(s.as_str()).unwrap(), s);
        }
        assert!(RefreshStrategy::parse("incremental").is_err());
    }

    #[test]
    fn base_sources_excludes_dynamic_upstreams() {
        let t = DynamicTable {
            name: TableName::new("dynamic.t"),
            query_sql: "SELECT 1".into(),
            grouping_keys: vec![],
            sources: vec![
                SourceRef { name: "orders".into(), is_dynamic: false },
                SourceRef { name: "dynamic.daily".into(), is_dynamic: true },
            ],
            target_lag: TargetLag::Downstream,
            refresh_strategy: RefreshStrategy::Auto,
            deduplication: false,
            cardinality_threshold: 0.3,
            allow_parallel: false,
            parallel_threshold: DynamicTable::DEFAULT_PARALLEL_THRESHOLD,
            max_parallelism: DynamicTable::DEFAULT_MAX_PARALLELISM,
            shadow: false,
            initialize: InitializeMode::OnCreate,
            status: TableStatus::Active,
            comment: None,
            created_at: crate::now_iso(),
            updated_at: crate::now_iso(),
        };
        assert_eq!(t.base_sources(), vec!["orders"]);
        assert_eq!(t.upstream_dynamic(), vec!["dynamic.daily"]);
    }
}
