//! `CREATE DYNAMIC TABLE` DDL parsing.
//!
//! Grammar:
//!
//! ```sql
//! CREATE DYNAMIC TABLE [IF NOT EXISTS] [schema.]name
//!     TARGET_LAG = '<duration> | downstream'
//!     [REFRESH_STRATEGY = 'auto' | 'full' | 'affected_keys']
//!     [DEDUPLICATE = true | false]
//!     [CARDINALITY_THRESHOLD = <fraction>]
//!     [ALLOW_PARALLEL = true | false]
//!     [PARALLEL_THRESHOLD = <count>]
//!     [MAX_PARALLELISM = <count>]
//!     [SHADOW_REFRESH = true | false]
//!     [INITIALIZE = 'on_create' | 'on_schedule']
//!     [COMMENT = '<text>']
//! AS <query>
//! ```
//!
//! The head is matched with regexes; the query tail goes through
//! [`crate::analyze::analyze_query`].

use std::sync::LazyLock;

use regex::Regex;

use freshet_types::{DynamicTable, InitializeMode, RefreshStrategy, TableName, TargetLag};

use crate::analyze::{self, QueryShape};
use crate::error::{Result, SqlError};

/// Schema used when the DDL does not qualify the table name.
pub const DEFAULT_SCHEMA: &str = "dynamic";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^CREATE\s+DYNAMIC\s+TABLE\s+(?:(?P<ine>IF\s+NOT\s+EXISTS)\s+)?(?:(?P<schema>\w+)\.(?P<table>\w+)|(?P<bare>\w+))",
    )
    .expect("valid name regex")
});

static TARGET_LAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bTARGET_LAG\s*=\s*'([^']+)'").expect("valid regex"));

static STRATEGY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bREFRESH_STRATEGY\s*=\s*'(\w+)'").expect("valid regex"));

static DEDUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bDEDUPLICATE\s*=\s*(true|false)").expect("valid regex"));

static THRESHOLD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCARDINALITY_THRESHOLD\s*=\s*([0-9]*\.?[0-9]+)").expect("valid regex")
});

static ALLOW_PARALLEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bALLOW_PARALLEL\s*=\s*(true|false)").expect("valid regex"));

static PARALLEL_THRESHOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bPARALLEL_THRESHOLD\s*=\s*(\d+)").expect("valid regex"));

static MAX_PARALLELISM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bMAX_PARALLELISM\s*=\s*(\d+)").expect("valid regex"));

static SHADOW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSHADOW_REFRESH\s*=\s*(true|false)").expect("valid regex"));

static INITIALIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bINITIALIZE\s*=\s*'(\w+)'").expect("valid regex"));

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCOMMENT\s*=\s*'([^']*)'").expect("valid regex"));

static AS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bAS\s+(.+)$").expect("valid regex"));

/// A parsed and analyzed `CREATE DYNAMIC TABLE` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: TableName,
    pub if_not_exists: bool,
    pub query_sql: String,
    pub target_lag: TargetLag,
    pub refresh_strategy: RefreshStrategy,
    pub deduplication: bool,
    pub cardinality_threshold: f64,
    pub allow_parallel: bool,
    pub parallel_threshold: u64,
    pub max_parallelism: u32,
    pub shadow: bool,
    pub initialize: InitializeMode,
    pub comment: Option<String>,
    /// Analysis of the definition query.
    pub shape: QueryShape,
}

/// Parse and validate a `CREATE DYNAMIC TABLE` statement.
///
/// # Errors
///
/// Returns [`SqlError::Ddl`] for a malformed head, [`SqlError::Parse`] /
/// [`SqlError::Unsupported`] for a query body the engine rejects, and
/// [`SqlError::Unsupported`] when the declared strategy is impossible for
/// the query.
pub fn parse_create(ddl: &str) -> Result<TableDefinition> {
    // Normalize whitespace so the option regexes see one line.
    let ddl = ddl.split_whitespace().collect::<Vec<_>>().join(" ");

    let caps = NAME_RE.captures(&ddl).ok_or_else(|| {
        SqlError::Ddl("invalid CREATE DYNAMIC TABLE syntax: missing table name".into())
    })?;
    let name = match (caps.name("schema"), caps.name("table"), caps.name("bare")) {
        (Some(schema), Some(table), _) => TableName::qualified(schema.as_str(), table.as_str()),
        (_, _, Some(bare)) => TableName::qualified(DEFAULT_SCHEMA, bare.as_str()),
        _ => unreachable!("name regex matched without captures"),
    };
    let if_not_exists = caps.name("ine").is_some();

    // Split off the query tail before scanning options, so option-looking
    // text inside the query body cannot be misread as an option. The head
    // regexes below only see the text before AS.
    let as_caps = AS_RE
        .captures(&ddl)
        .ok_or_else(|| SqlError::Ddl("missing AS clause with query".into()))?;
    let query_sql = as_caps.get(1).expect("AS capture").as_str().trim().to_string();
    let head = &ddl[..as_caps.get(0).expect("AS match").start()];

    let target_lag_raw = TARGET_LAG_RE
        .captures(head)
        .and_then(|c| c.get(1))
        .ok_or_else(|| SqlError::Ddl("TARGET_LAG is required".into()))?;
    let target_lag = TargetLag::parse(target_lag_raw.as_str())
        .map_err(|v| SqlError::Ddl(format!("invalid TARGET_LAG: '{v}'")))?;

    let refresh_strategy = match STRATEGY_RE.captures(head).and_then(|c| c.get(1)) {
        Some(m) => RefreshStrategy::parse(m.as_str())
            .map_err(|v| SqlError::Ddl(format!("invalid REFRESH_STRATEGY: '{v}'")))?,
        None => RefreshStrategy::Auto,
    };

    let deduplication = capture_bool(&DEDUP_RE, head).unwrap_or(false);
    let allow_parallel = capture_bool(&ALLOW_PARALLEL_RE, head).unwrap_or(false);
    let shadow = capture_bool(&SHADOW_RE, head).unwrap_or(false);

    let cardinality_threshold = match THRESHOLD_RE.captures(head).and_then(|c| c.get(1)) {
        Some(m) => {
            let v: f64 = m
                .as_str()
                .parse()
                .map_err(|_| SqlError::Ddl(format!("invalid CARDINALITY_THRESHOLD: '{}'", m.as_str())))?;
            if !(0.0..=1.0).contains(&v) {
                return Err(SqlError::Ddl(format!(
                    "CARDINALITY_THRESHOLD must be in [0, 1], got {v}"
                )));
            }
            v
        }
        None => DynamicTable::DEFAULT_CARDINALITY_THRESHOLD,
    };

    let parallel_threshold = match PARALLEL_THRESHOLD_RE.captures(head).and_then(|c| c.get(1)) {
        Some(m) => m
            .as_str()
            .parse()
            .map_err(|_| SqlError::Ddl(format!("invalid PARALLEL_THRESHOLD: '{}'", m.as_str())))?,
        None => DynamicTable::DEFAULT_PARALLEL_THRESHOLD,
    };

    let max_parallelism = match MAX_PARALLELISM_RE.captures(head).and_then(|c| c.get(1)) {
        Some(m) => {
            let v: u32 = m
                .as_str()
                .parse()
                .map_err(|_| SqlError::Ddl(format!("invalid MAX_PARALLELISM: '{}'", m.as_str())))?;
            if v < 2 {
                return Err(SqlError::Ddl(format!(
                    "MAX_PARALLELISM must be at least 2, got {v}"
                )));
            }
            v
        }
        None => DynamicTable::DEFAULT_MAX_PARALLELISM,
    };

    let initialize = match INITIALIZE_RE.captures(head).and_then(|c| c.get(1)) {
        Some(m) => InitializeMode::parse(m.as_str())
            .map_err(|v| SqlError::Ddl(format!("invalid INITIALIZE: '{v}'")))?,
        None => InitializeMode::OnCreate,
    };

    let comment = COMMENT_RE
        .captures(head)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let shape = analyze::analyze_query(&query_sql)?;
    analyze::validate_strategy(&shape, refresh_strategy)?;

    Ok(TableDefinition {
        name,
        if_not_exists,
        query_sql,
        target_lag,
        refresh_strategy,
        deduplication,
        cardinality_threshold,
        allow_parallel,
        parallel_threshold,
        max_parallelism,
        shadow,
        initialize,
        comment,
        shape,
    })
}

fn capture_bool(re: &Regex, input: &str) -> Option<bool> {
    re.captures(input)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::RefreshCapability;
    use std::time::Duration;

    const BASIC: &str = "
        CREATE DYNAMIC TABLE customer_counts
        TARGET_LAG = '5 minutes'
        AS
        SELECT customer_id, COUNT(*) AS order_count
        FROM orders
        GROUP BY customer_id
    ";

    #[test]
    fn parses_basic_create() {
        let def = parse_create(BASIC).unwrap();
        assert_eq!(def.name.as_str(), "dynamic.customer_counts");
        assert_eq!(
            def.target_lag,
            TargetLag::Duration(Duration::from_secs(300))
        );
        assert_eq!(def.refresh_strategy, RefreshStrategy::Auto);
        assert!(!def.deduplication);
        assert!((def.cardinality_threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(def.shape.sources, vec!["orders"]);
        assert_eq!(def.shape.grouping_keys, vec!["customer_id"]);
        assert_eq!(def.shape.capability, RefreshCapability::AffectedKeys);
        assert!(def.query_sql.starts_with("SELECT customer_id"));
    }

    #[test]
    fn parses_schema_qualified_name_and_if_not_exists() {
        let def = parse_create(
            "CREATE DYNAMIC TABLE IF NOT EXISTS marts.revenue \
             TARGET_LAG = '1 hour' \
             AS SELECT region, SUM(amount) FROM orders GROUP BY region",
        )
        .unwrap();
        assert_eq!(def.name.as_str(), "marts.revenue");
        assert!(def.if_not_exists);
    }

    #[test]
    fn parses_all_options() {
        let def = parse_create(
            "CREATE DYNAMIC TABLE t \
             TARGET_LAG = 'downstream' \
             REFRESH_STRATEGY = 'affected_keys' \
             DEDUPLICATE = true \
             CARDINALITY_THRESHOLD = 0.5 \
             ALLOW_PARALLEL = true \
             PARALLEL_THRESHOLD = 1000000 \
             MAX_PARALLELISM = 8 \
             SHADOW_REFRESH = true \
             INITIALIZE = 'on_schedule' \
             COMMENT = 'per-customer rollup' \
             AS SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id",
        )
        .unwrap();
        assert_eq!(def.target_lag, TargetLag::Downstream);
        assert_eq!(def.refresh_strategy, RefreshStrategy::AffectedKeys);
        assert!(def.deduplication);
        assert!((def.cardinality_threshold - 0.5).abs() < f64::EPSILON);
        assert!(def.allow_parallel);
        assert_eq!(def.parallel_threshold, 1_000_000);
        assert_eq!(def.max_parallelism, 8);
        assert!(def.shadow);
        assert_eq!(def.initialize, InitializeMode::OnSchedule);
        assert_eq!(def.comment.as_deref(), Some("per-customer rollup"));
    }

    #[test]
    fn target_lag_is_required() {
        let err = parse_create(
            "CREATE DYNAMIC TABLE t AS SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id",
        )
        .unwrap_err();
        assert!(err.to_string().contains("TARGET_LAG"), "got: {err}");
    }

    #[test]
    fn missing_as_clause_fails() {
        let err = parse_create("CREATE DYNAMIC TABLE t TARGET_LAG = '5 minutes'").unwrap_err();
        assert!(err.to_string().contains("AS clause"), "got: {err}");
    }

    #[test]
    fn missing_name_fails() {
        let err = parse_create("CREATE TABLE t TARGET_LAG = '5 minutes' AS SELECT 1").unwrap_err();
        assert!(matches!(err, SqlError::Ddl(_)));
    }

    #[test]
    fn cardinality_threshold_must_be_a_fraction() {
        let err = parse_create(
            "CREATE DYNAMIC TABLE t TARGET_LAG = '5 minutes' CARDINALITY_THRESHOLD = 1.5 \
             AS SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id",
        )
        .unwrap_err();
        assert!(err.to_string().contains("[0, 1]"), "got: {err}");
    }

    #[test]
    fn affected_keys_strategy_requires_grouping_keys() {
        let err = parse_create(
            "CREATE DYNAMIC TABLE t TARGET_LAG = '5 minutes' \
             REFRESH_STRATEGY = 'affected_keys' \
             AS SELECT customer_id, amount FROM orders",
        )
        .unwrap_err();
        assert!(matches!(err, SqlError::Unsupported(_)));
    }

    #[test]
    fn unparseable_query_body_fails() {
        let err = parse_create(
            "CREATE DYNAMIC TABLE t TARGET_LAG = '5 minutes' AS SELEKT broken",
        )
        .unwrap_err();
        assert!(matches!(err, SqlError::Parse(_)));
    }

    #[test]
    fn query_tail_with_option_like_text_is_untouched() {
        // A string literal in the body that resembles an option must not
        // confuse the head scan.
        let def = parse_create(
            "CREATE DYNAMIC TABLE t TARGET_LAG = '10 minutes' AS \
             SELECT customer_id, COUNT(*) FROM orders \
             WHERE note <> 'COMMENT = ''x''' GROUP BY customer_id",
        )
        .unwrap();
        assert_eq!(def.comment, None);
        assert_eq!(
            def.target_lag,
            TargetLag::Duration(Duration::from_secs(600))
        );
    }
}
