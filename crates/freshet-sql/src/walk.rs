//! Shared AST traversal for analysis and rewriting.
//!
//! Walks every table factor in a query, recursing into CTE bodies, derived
//! tables, nested joins, set operations, and subqueries in expressions.
//! The callback receives the factor plus the CTE names in scope, so callers
//! can tell a base-table reference from a CTE reference.

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, JoinConstraint, JoinOperator,
    ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::parser::Parser;

use crate::dialect::FreshetDialect;
use crate::error::{Result, SqlError};

/// Parse `sql` into exactly one `SELECT` query.
pub(crate) fn parse_single_query(sql: &str) -> Result<Query> {
    let mut stmts = Parser::parse_sql(&FreshetDialect::default(), sql)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.len() != 1 {
        return Err(SqlError::Parse(format!(
            "expected a single statement, found {}",
            stmts.len()
        )));
    }
    match stmts.remove(0) {
        Statement::Query(q) => Ok(*q),
        other => Err(SqlError::Parse(format!(
            "expected a SELECT query, found: {other}"
        ))),
    }
}

/// Parse a standalone scalar/boolean expression.
pub(crate) fn parse_expr(sql: &str) -> Result<Expr> {
    let dialect = FreshetDialect::default();
    Parser::new(&dialect)
        .try_with_sql(sql)
        .map_err(|e| SqlError::Parse(e.to_string()))?
        .parse_expr()
        .map_err(|e| SqlError::Parse(e.to_string()))
}

/// Fully qualified rendering of an object name (`schema.table` or `table`).
pub(crate) fn object_name_string(name: &ObjectName) -> String {
    name.to_string()
}

/// Walk every table factor in `query`. `ctes` is the stack of CTE names in
/// scope; callers start with an empty vec.
pub(crate) fn walk_query(
    query: &mut Query,
    ctes: &mut Vec<String>,
    f: &mut impl FnMut(&mut TableFactor, &[String]),
) {
    let depth = ctes.len();
    if let Some(with) = query.with.as_mut() {
        for cte in &with.cte_tables {
            ctes.push(cte.alias.name.value.clone());
        }
        for cte in with.cte_tables.iter_mut() {
            walk_query(&mut cte.query, ctes, f);
        }
    }
    walk_set_expr(query.body.as_mut(), ctes, f);
    ctes.truncate(depth);
}

fn walk_set_expr(
    set_expr: &mut SetExpr,
    ctes: &mut Vec<String>,
    f: &mut impl FnMut(&mut TableFactor, &[String]),
) {
    match set_expr {
        SetExpr::Select(select) => walk_select(select, ctes, f),
        SetExpr::Query(query) => walk_query(query, ctes, f),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, ctes, f);
            walk_set_expr(right, ctes, f);
        }
        _ => {}
    }
}

fn walk_select(
    select: &mut Select,
    ctes: &mut Vec<String>,
    f: &mut impl FnMut(&mut TableFactor, &[String]),
) {
    for twj in select.from.iter_mut() {
        walk_table_with_joins(twj, ctes, f);
    }
    for item in select.projection.iter_mut() {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                walk_expr(expr, ctes, f);
            }
            _ => {}
        }
    }
    if let Some(selection) = select.selection.as_mut() {
        walk_expr(selection, ctes, f);
    }
    if let Some(having) = select.having.as_mut() {
        walk_expr(having, ctes, f);
    }
}

fn walk_table_with_joins(
    twj: &mut TableWithJoins,
    ctes: &mut Vec<String>,
    f: &mut impl FnMut(&mut TableFactor, &[String]),
) {
    walk_table_factor(&mut twj.relation, ctes, f);
    for join in twj.joins.iter_mut() {
        walk_table_factor(&mut join.relation, ctes, f);
        if let Some(constraint) = join_constraint_mut(&mut join.join_operator) {
            if let JoinConstraint::On(expr) = constraint {
                walk_expr(expr, ctes, f);
            }
        }
    }
}

fn join_constraint_mut(op: &mut JoinOperator) -> Option<&mut JoinConstraint> {
    match op {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c) => Some(c),
        _ => None,
    }
}

fn walk_table_factor(
    factor: &mut TableFactor,
    ctes: &mut Vec<String>,
    f: &mut impl FnMut(&mut TableFactor, &[String]),
) {
    match factor {
        TableFactor::Table { .. } => f(factor, ctes),
        TableFactor::Derived { subquery, .. } => walk_query(subquery, ctes, f),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => walk_table_with_joins(table_with_joins, ctes, f),
        _ => {}
    }
}

fn walk_expr(expr: &mut Expr, ctes: &mut Vec<String>, f: &mut impl FnMut(&mut TableFactor, &[String])) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, ctes, f);
            walk_expr(right, ctes, f);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::Cast { expr, .. }
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsFalse(expr) => walk_expr(expr, ctes, f),
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, ctes, f);
            walk_expr(low, ctes, f);
            walk_expr(high, ctes, f);
        }
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, ctes, f);
            for item in list.iter_mut() {
                walk_expr(item, ctes, f);
            }
        }
        Expr::InSubquery { expr, subquery, .. } => {
            walk_expr(expr, ctes, f);
            walk_query(subquery, ctes, f);
        }
        Expr::Subquery(query) => walk_query(query, ctes, f),
        Expr::Exists { subquery, .. } => walk_query(subquery, ctes, f),
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                walk_expr(operand, ctes, f);
            }
            for c in conditions.iter_mut() {
                walk_expr(c, ctes, f);
            }
            for r in results.iter_mut() {
                walk_expr(r, ctes, f);
            }
            if let Some(e) = else_result {
                walk_expr(e, ctes, f);
            }
        }
        Expr::Tuple(items) => {
            for item in items.iter_mut() {
                walk_expr(item, ctes, f);
            }
        }
        Expr::Function(func) => match &mut func.args {
            FunctionArguments::Subquery(query) => walk_query(query, ctes, f),
            FunctionArguments::List(list) => {
                for arg in list.args.iter_mut() {
                    let (FunctionArg::Named { arg, .. } | FunctionArg::Unnamed(arg)) = arg;
                    if let FunctionArgExpr::Expr(expr) = arg {
                        walk_expr(expr, ctes, f);
                    }
                }
            }
            FunctionArguments::None => {}
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_tables(sql: &str) -> Vec<String> {
        let mut query = parse_single_query(sql).unwrap();
        let mut out = Vec::new();
        let mut scope = Vec::new();
        walk_query(&mut query, &mut scope, &mut |factor, ctes| {
            if let TableFactor::Table { name, .. } = factor {
                let full = object_name_string(name);
                if !ctes.iter().any(|c| c == &full) {
                    out.push(full);
                }
            }
        });
        out
    }

    #[test]
    fn finds_tables_in_joins_and_subqueries() {
        let tables = collect_tables(
            "SELECT o.customer_id FROM orders o \
             JOIN customers c ON o.customer_id = c.id \
             WHERE o.amount > (SELECT AVG(amount) FROM orders)",
        );
        assert_eq!(tables, vec!["orders", "customers", "orders"]);
    }

    #[test]
    fn cte_names_are_scoped_out() {
        let tables = collect_tables(
            "WITH recent AS (SELECT * FROM orders WHERE o_date > '2026-01-01') \
             SELECT * FROM recent JOIN customers ON recent.customer_id = customers.id",
        );
        assert_eq!(tables, vec!["orders", "customers"]);
    }

    #[test]
    fn nested_set_operations_are_walked() {
        let tables =
            collect_tables("SELECT id FROM a UNION ALL SELECT id FROM b UNION SELECT id FROM c");
        assert_eq!(tables, vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_non_query_statements() {
        assert!(matches!(
            parse_single_query("DELETE FROM orders"),
            Err(SqlError::Parse(_))
        ));
        assert!(matches!(
            parse_single_query("SELECT 1; SELECT 2"),
            Err(SqlError::Parse(_))
        ));
    }
}
