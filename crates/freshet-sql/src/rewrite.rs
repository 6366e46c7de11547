//! Snapshot-pin and predicate rewriting.
//!
//! All rewrites are AST-to-AST; rendering back to SQL text is the single
//! final step. The rewriter is pure: identical inputs produce byte-identical
//! output.

use std::collections::{BTreeMap, BTreeSet};

use sqlparser::ast::{
    BinaryOperator, Distinct, Expr, GroupByExpr, Ident, SelectItem, SetExpr, TableFactor,
    TableVersion, Value,
};

use freshet_types::SnapshotId;

use crate::error::{Result, SqlError};
use crate::walk;

/// Qualify every occurrence of a pinned source with a snapshot-pin clause.
///
/// `pins` maps fully qualified source names to the snapshot to read them
/// at. Names in `exclude` (dynamic-table sources, already materialized at a
/// pinned version) and CTE-defined names are left untouched. Aliases are
/// preserved.
///
/// # Errors
///
/// Returns [`SqlError::Parse`] when `sql` is not a single `SELECT` query.
pub fn pin_snapshots(
    sql: &str,
    pins: &BTreeMap<String, SnapshotId>,
    exclude: &BTreeSet<String>,
) -> Result<String> {
    let mut query = walk::parse_single_query(sql)?;
    let mut scope = Vec::new();
    walk::walk_query(&mut query, &mut scope, &mut |factor, ctes| {
        if let TableFactor::Table { name, version, .. } = factor {
            let full = walk::object_name_string(name);
            if exclude.contains(&full) || ctes.iter().any(|c| c == &full) {
                return;
            }
            if let Some(snapshot) = pins.get(&full) {
                *version = Some(TableVersion::ForSystemTimeAsOf(Expr::Value(Value::Number(
                    snapshot.to_string(),
                    false,
                ))));
            }
        }
    });
    Ok(query.to_string())
}

/// AND-combine `predicate` into the query's WHERE clause (creating one if
/// absent) at the outermost SELECT.
///
/// # Errors
///
/// Returns [`SqlError::Parse`] when either input fails to parse, or
/// [`SqlError::Unsupported`] when the outermost body is not a plain SELECT
/// (set operations cannot take a combined WHERE).
pub fn add_predicate(sql: &str, predicate: &str) -> Result<String> {
    let mut query = walk::parse_single_query(sql)?;
    let pred = walk::parse_expr(predicate)?;

    let SetExpr::Select(select) = query.body.as_mut() else {
        return Err(SqlError::Unsupported(
            "cannot add a predicate to a set-operation query".into(),
        ));
    };

    select.selection = Some(match select.selection.take() {
        Some(existing) => Expr::BinaryOp {
            left: Box::new(Expr::Nested(Box::new(existing))),
            op: BinaryOperator::And,
            right: Box::new(Expr::Nested(Box::new(pred))),
        },
        None => pred,
    });

    Ok(query.to_string())
}

/// Replace every occurrence of `source` with `relation_sql` (a FROM-able
/// fragment such as a change-feed table function), pinning the remaining
/// sources from `pins`.
///
/// The replacement keeps the original alias when one exists; otherwise it
/// is aliased to the source's bare table name so column references keep
/// resolving.
///
/// # Errors
///
/// Returns [`SqlError::Parse`] when `sql` or `relation_sql` fails to parse.
pub fn replace_source(
    sql: &str,
    source: &str,
    relation_sql: &str,
    pins: &BTreeMap<String, SnapshotId>,
    exclude: &BTreeSet<String>,
) -> Result<String> {
    let mut query = walk::parse_single_query(sql)?;
    let bare = source.rsplit_once('.').map_or(source, |(_, t)| t);

    let mut replace_err: Option<SqlError> = None;
    let mut scope = Vec::new();
    walk::walk_query(&mut query, &mut scope, &mut |factor, ctes| {
        if replace_err.is_some() {
            return;
        }
        if let TableFactor::Table { name, alias, version, .. } = factor {
            let full = walk::object_name_string(name);
            if ctes.iter().any(|c| c == &full) {
                return;
            }
            if full == source {
                let alias_name = alias
                    .as_ref()
                    .map_or(bare, |a| a.name.value.as_str())
                    .to_string();
                match parse_table_factor(relation_sql, &alias_name) {
                    Ok(replacement) => *factor = replacement,
                    Err(e) => replace_err = Some(e),
                }
            } else if !exclude.contains(&full) {
                if let Some(snapshot) = pins.get(&full) {
                    *version = Some(TableVersion::ForSystemTimeAsOf(Expr::Value(
                        Value::Number(snapshot.to_string(), false),
                    )));
                }
            }
        }
    });
    if let Some(e) = replace_err {
        return Err(e);
    }
    Ok(query.to_string())
}

/// Derive the grouping-key projection query for one changed source: the
/// definition query with `source` replaced by its change-feed relation,
/// the remaining sources pinned, and the body reshaped to
/// `SELECT DISTINCT <grouping keys>` (aggregates, GROUP BY, HAVING, ORDER
/// BY, LIMIT dropped).
///
/// For a single-source definition this degenerates to projecting keys
/// straight from the feed; for joins it translates the changed source's
/// keys into target grouping keys through the other sources at their pins.
///
/// # Errors
///
/// Returns [`SqlError::Parse`] when the inputs fail to parse and
/// [`SqlError::Unsupported`] when the query has no outer GROUP BY to
/// derive keys from.
pub fn keys_query(
    sql: &str,
    source: &str,
    relation_sql: &str,
    pins: &BTreeMap<String, SnapshotId>,
    exclude: &BTreeSet<String>,
) -> Result<String> {
    let replaced = replace_source(sql, source, relation_sql, pins, exclude)?;
    let mut query = walk::parse_single_query(&replaced)?;
    let SetExpr::Select(select) = query.body.as_mut() else {
        return Err(SqlError::Unsupported(
            "cannot derive keys from a set-operation query".into(),
        ));
    };
    let GroupByExpr::Expressions(exprs, _) = &select.group_by else {
        return Err(SqlError::Unsupported(
            "definition query has no grouping keys".into(),
        ));
    };
    if exprs.is_empty() {
        return Err(SqlError::Unsupported(
            "definition query has no grouping keys".into(),
        ));
    }
    select.projection = exprs
        .iter()
        .map(|e| SelectItem::ExprWithAlias {
            expr: e.clone(),
            alias: Ident::new(crate::analyze::grouping_key_name(e)),
        })
        .collect();
    select.distinct = Some(Distinct::Distinct);
    select.group_by = GroupByExpr::Expressions(Vec::new(), Vec::new());
    select.having = None;
    query.order_by = None;
    query.limit = None;
    Ok(query.to_string())
}

/// Parse a FROM-able relation fragment (table, table function, or
/// parenthesized query) into a table factor carrying `alias`.
fn parse_table_factor(relation_sql: &str, alias: &str) -> Result<TableFactor> {
    let probe = format!("SELECT * FROM {relation_sql} AS {alias}");
    let mut query = walk::parse_single_query(&probe)?;
    let SetExpr::Select(select) = query.body.as_mut() else {
        return Err(SqlError::Parse(format!(
            "not a relation fragment: {relation_sql}"
        )));
    };
    let mut from = std::mem::take(&mut select.from);
    if from.len() != 1 || !from[0].joins.is_empty() {
        return Err(SqlError::Parse(format!(
            "not a single relation fragment: {relation_sql}"
        )));
    }
    Ok(from.remove(0).relation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins(entries: &[(&str, SnapshotId)]) -> BTreeMap<String, SnapshotId> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect()
    }

    #[test]
    fn pins_every_occurrence_including_self_joins() {
        let out = pin_snapshots(
            "SELECT a.customer_id FROM orders a JOIN orders b ON a.id = b.parent_id",
            &pins(&[("orders", 7)]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(out.matches("FOR SYSTEM_TIME AS OF 7").count(), 2, "got: {out}");
        // Aliases survive the rewrite.
        assert!(out.contains("AS a"), "got: {out}");
        assert!(out.contains("AS b"), "got: {out}");
    }

    #[test]
    fn pins_inside_nested_subqueries() {
        let out = pin_snapshots(
            "SELECT customer_id FROM orders WHERE amount > (SELECT AVG(amount) FROM orders)",
            &pins(&[("orders", 3)]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(out.matches("FOR SYSTEM_TIME AS OF 3").count(), 2, "got: {out}");
    }

    #[test]
    fn cte_names_are_not_pinned_but_their_bases_are() {
        let out = pin_snapshots(
            "WITH recent AS (SELECT * FROM orders) SELECT customer_id FROM recent",
            &pins(&[("orders", 4), ("recent", 99)]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(out.matches("FOR SYSTEM_TIME AS OF 4").count(), 1, "got: {out}");
        assert!(!out.contains("99"), "got: {out}");
    }

    #[test]
    fn excluded_sources_are_not_pinned() {
        let exclude: BTreeSet<String> = ["dynamic.daily_totals".to_string()].into();
        let out = pin_snapshots(
            "SELECT d.day, COUNT(*) FROM dynamic.daily_totals d \
             JOIN orders o ON d.day = o.day GROUP BY d.day",
            &pins(&[("orders", 5), ("dynamic.daily_totals", 6)]),
            &exclude,
        )
        .unwrap();
        assert_eq!(out.matches("FOR SYSTEM_TIME AS OF 5").count(), 1, "got: {out}");
        assert!(!out.contains("FOR SYSTEM_TIME AS OF 6"), "got: {out}");
    }

    #[test]
    fn schema_qualified_names_match_on_full_form() {
        let out = pin_snapshots(
            "SELECT * FROM sales.orders GROUP BY customer_id",
            &pins(&[("orders", 1), ("sales.orders", 2)]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert!(out.contains("FOR SYSTEM_TIME AS OF 2"), "got: {out}");
        assert!(!out.contains("FOR SYSTEM_TIME AS OF 1"), "got: {out}");
    }

    #[test]
    fn rewriter_is_deterministic() {
        let sql = "SELECT c.region, COUNT(*) FROM orders o \
                   JOIN customers c ON o.customer_id = c.id GROUP BY c.region";
        let p = pins(&[("orders", 10), ("customers", 11)]);
        let a = pin_snapshots(sql, &p, &BTreeSet::new()).unwrap();
        let b = pin_snapshots(sql, &p, &BTreeSet::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pinned_output_reparses() {
        let out = pin_snapshots(
            "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id",
            &pins(&[("orders", 12)]),
            &BTreeSet::new(),
        )
        .unwrap();
        // A second rewrite over already-pinned SQL must parse cleanly.
        let again = pin_snapshots(&out, &BTreeMap::new(), &BTreeSet::new()).unwrap();
        assert_eq!(out, again);
    }

    #[test]
    fn add_predicate_creates_where() {
        let out = add_predicate(
            "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id",
            "customer_id IN (SELECT customer_id FROM affected_keys)",
        )
        .unwrap();
        assert!(
            out.contains("WHERE customer_id IN (SELECT customer_id FROM affected_keys)"),
            "got: {out}"
        );
    }

    #[test]
    fn add_predicate_ands_with_existing_where() {
        let out = add_predicate(
            "SELECT customer_id, COUNT(*) FROM orders WHERE amount > 0 OR amount < -10 \
             GROUP BY customer_id",
            "customer_id IN (SELECT k FROM t)",
        )
        .unwrap();
        assert!(
            out.contains("WHERE (amount > 0 OR amount < -10) AND (customer_id IN (SELECT k FROM t))"),
            "got: {out}"
        );
    }

    #[test]
    fn add_predicate_rejects_set_operations() {
        let err = add_predicate("SELECT id FROM a UNION SELECT id FROM b", "id = 1").unwrap_err();
        assert!(matches!(err, SqlError::Unsupported(_)));
    }

    #[test]
    fn replace_source_splices_relation_and_pins_others() {
        let out = replace_source(
            "SELECT c.region, COUNT(*) FROM orders o \
             JOIN customers c ON o.customer_id = c.id GROUP BY c.region",
            "orders",
            "table_changes('orders', 3, 7)",
            &pins(&[("customers", 9)]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert!(
            out.contains("table_changes('orders', 3, 7) AS o"),
            "got: {out}"
        );
        assert!(out.contains("customers"), "got: {out}");
        assert!(out.contains("FOR SYSTEM_TIME AS OF 9"), "got: {out}");
        assert!(out.contains("AS c"), "got: {out}");
    }

    #[test]
    fn keys_query_projects_distinct_grouping_keys() {
        let out = keys_query(
            "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id",
            "orders",
            "table_changes('orders', 3, 7)",
            &BTreeMap::new(),
            &BTreeSet::new(),
        )
        .unwrap();
        assert!(
            out.starts_with("SELECT DISTINCT customer_id AS customer_id"),
            "got: {out}"
        );
        assert!(out.contains("table_changes('orders', 3, 7) AS orders"), "got: {out}");
        assert!(!out.contains("GROUP BY"), "got: {out}");
        assert!(!out.contains("COUNT"), "got: {out}");
    }

    #[test]
    fn keys_query_translates_through_joins() {
        let out = keys_query(
            "SELECT c.region, SUM(o.amount) FROM orders o \
             JOIN customers c ON o.customer_id = c.id \
             WHERE o.amount > 0 GROUP BY c.region",
            "orders",
            "table_changes('orders', 1, 2)",
            &pins(&[("customers", 5)]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert!(out.starts_with("SELECT DISTINCT c.region AS region"), "got: {out}");
        assert!(out.contains("table_changes('orders', 1, 2) AS o"), "got: {out}");
        assert!(out.contains("FOR SYSTEM_TIME AS OF 5"), "got: {out}");
        // The original row filter survives.
        assert!(out.contains("o.amount > 0"), "got: {out}");
    }

    #[test]
    fn keys_query_requires_grouping_keys() {
        let err = keys_query(
            "SELECT customer_id, amount FROM orders",
            "orders",
            "table_changes('orders', 1, 2)",
            &BTreeMap::new(),
            &BTreeSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SqlError::Unsupported(_)));
    }

    #[test]
    fn replace_source_aliases_bare_tables_to_their_name() {
        let out = replace_source(
            "SELECT customer_id FROM orders",
            "orders",
            "table_changes('orders', 1, 2)",
            &BTreeMap::new(),
            &BTreeSet::new(),
        )
        .unwrap();
        assert!(
            out.contains("table_changes('orders', 1, 2) AS orders"),
            "got: {out}"
        );
    }
}
