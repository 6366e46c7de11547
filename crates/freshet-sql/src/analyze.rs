//! Definition-query analysis: sources, grouping keys, refresh capability.

use std::collections::BTreeSet;

use sqlparser::ast::{
    Expr, GroupByExpr, NamedWindowExpr, Select, SelectItem, SetExpr, TableFactor, WindowType,
};

use freshet_types::RefreshStrategy;

use crate::error::{Result, SqlError};
use crate::walk;

/// Functions whose output varies between evaluations. A definition that
/// projects one of these cannot be recomputed per affected key, because two
/// refreshes of the same key would disagree.
const NONDETERMINISTIC_FUNCTIONS: &[&str] = &[
    "random",
    "uuid",
    "gen_random_uuid",
    "now",
    "current_timestamp",
    "current_date",
    "current_time",
    "current_localtime",
    "current_localtimestamp",
];

/// Whether a definition query can be refreshed incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCapability {
    /// Eligible for the affected-keys strategies.
    AffectedKeys,
    /// Only full recomputation is correct.
    FullOnly,
}

/// Structural facts about a definition query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryShape {
    /// Every relation the query reads, fully qualified as written, sorted
    /// and de-duplicated. CTE names are excluded.
    pub sources: Vec<String>,
    /// Grouping-key column names from the outermost GROUP BY.
    pub grouping_keys: Vec<String>,
    /// The same keys as written in the query (alias-qualified), for
    /// predicates injected into the definition query.
    pub grouping_key_exprs: Vec<String>,
    pub capability: RefreshCapability,
    /// Why the query is full-only, when it is.
    pub full_only_reasons: Vec<String>,
}

/// Analyze a definition query.
///
/// # Errors
///
/// Returns [`SqlError::Parse`] when the input is not a single `SELECT`
/// query, and [`SqlError::Unsupported`] for constructs the engine rejects
/// under any strategy (window functions without a partition key, LIMIT
/// without ORDER BY).
pub fn analyze_query(sql: &str) -> Result<QueryShape> {
    let mut query = walk::parse_single_query(sql)?;

    if query.limit.is_some() && query.order_by.is_none() {
        return Err(SqlError::Unsupported(
            "LIMIT without ORDER BY yields an unstable row set".into(),
        ));
    }

    let mut full_only_reasons = Vec::new();

    if query.with.as_ref().is_some_and(|w| w.recursive) {
        full_only_reasons.push("recursive CTE".to_string());
    }

    let mut has_set_operation = false;
    collect_set_operations(query.body.as_ref(), &mut has_set_operation);
    if has_set_operation {
        full_only_reasons.push("set operation (UNION/INTERSECT/EXCEPT)".to_string());
    }

    let mut grouping_keys = Vec::new();
    let mut grouping_key_exprs = Vec::new();
    if let SetExpr::Select(select) = query.body.as_ref() {
        check_window_functions(select)?;

        if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
            for expr in exprs {
                grouping_keys.push(grouping_key_name(expr));
                grouping_key_exprs.push(expr.to_string());
            }
        }

        if select.distinct.is_some() && grouping_keys.is_empty() {
            full_only_reasons.push("DISTINCT without GROUP BY".to_string());
        }

        if let Some(func) = nondeterministic_projection(select) {
            full_only_reasons.push(format!("non-deterministic function {func}() in projection"));
        }
    }

    if grouping_keys.is_empty() {
        full_only_reasons.push("no grouping keys".to_string());
    }

    let mut sources = BTreeSet::new();
    let mut scope = Vec::new();
    walk::walk_query(&mut query, &mut scope, &mut |factor, ctes| {
        if let TableFactor::Table { name, .. } = factor {
            let full = walk::object_name_string(name);
            if !ctes.iter().any(|c| c == &full) {
                sources.insert(full);
            }
        }
    });
    if sources.is_empty() {
        return Err(SqlError::Parse(
            "definition query reads from no table".into(),
        ));
    }

    let capability = if full_only_reasons.is_empty() {
        RefreshCapability::AffectedKeys
    } else {
        RefreshCapability::FullOnly
    };

    Ok(QueryShape {
        sources: sources.into_iter().collect(),
        grouping_keys,
        grouping_key_exprs,
        capability,
        full_only_reasons,
    })
}

/// Reject a declared strategy the query cannot satisfy.
///
/// # Errors
///
/// Returns [`SqlError::Unsupported`] when `affected_keys` is declared for a
/// full-only query.
pub fn validate_strategy(shape: &QueryShape, declared: RefreshStrategy) -> Result<()> {
    if declared == RefreshStrategy::AffectedKeys
        && shape.capability == RefreshCapability::FullOnly
    {
        return Err(SqlError::Unsupported(format!(
            "refresh_strategy = 'affected_keys' is not possible for this query: {}",
            shape.full_only_reasons.join("; ")
        )));
    }
    Ok(())
}

fn collect_set_operations(set_expr: &SetExpr, found: &mut bool) {
    match set_expr {
        SetExpr::SetOperation { .. } => *found = true,
        SetExpr::Query(query) => collect_set_operations(query.body.as_ref(), found),
        _ => {}
    }
}

/// Window functions must carry a PARTITION BY; an unpartitioned window
/// makes every output row depend on every input row.
fn check_window_functions(select: &Select) -> Result<()> {
    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        if let Expr::Function(func) = expr {
            let partitioned = match &func.over {
                None => continue,
                Some(WindowType::WindowSpec(spec)) => !spec.partition_by.is_empty(),
                Some(WindowType::NamedWindow(name)) => select.named_window.iter().any(|w| {
                    w.0.value == name.value
                        && matches!(
                            &w.1,
                            NamedWindowExpr::WindowSpec(spec) if !spec.partition_by.is_empty()
                        )
                }),
            };
            if !partitioned {
                return Err(SqlError::Unsupported(format!(
                    "window function {} without PARTITION BY",
                    func.name
                )));
            }
        }
    }
    Ok(())
}

fn nondeterministic_projection(select: &Select) -> Option<String> {
    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        if let Expr::Function(func) = expr {
            let name = func
                .name
                .0
                .last()
                .map(|i| i.value.to_ascii_lowercase())
                .unwrap_or_default();
            if NONDETERMINISTIC_FUNCTIONS.contains(&name.as_str()) {
                return Some(name);
            }
        }
    }
    None
}

pub(crate) fn grouping_key_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_else(|| expr.to_string()),
        other => other.to_string(),
    }
}

/// Convenience: analyze and return only the source list.
///
/// # Errors
///
/// Propagates [`analyze_query`] errors.
pub fn extract_sources(sql: &str) -> Result<Vec<String>> {
    Ok(analyze_query(sql)?.sources)
}
