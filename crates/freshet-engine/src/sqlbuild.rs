//! SQL fragments the engine composes around the rewriter's output.
//!
//! Everything here is deterministic string building over already-validated
//! identifiers (grouping-key column names come from the parsed definition,
//! table names from the registry).

use freshet_types::{PartitionSpec, TableName};

/// `customer_id` or `(region, day)`.
pub(crate) fn key_tuple(keys: &[String]) -> String {
    if keys.len() == 1 {
        keys[0].clone()
    } else {
        format!("({})", keys.join(", "))
    }
}

/// Key tuple with every column qualified by an expression prefix taken
/// from the grouping-key expressions as written in the definition query.
pub(crate) fn expr_tuple(exprs: &[String]) -> String {
    if exprs.len() == 1 {
        exprs[0].clone()
    } else {
        format!("({})", exprs.join(", "))
    }
}

/// `<tuple> IN (SELECT <keys> FROM <keys_table> [WHERE <filter>])`.
pub(crate) fn keys_in_predicate(
    key_exprs: &[String],
    key_names: &[String],
    keys_table: &str,
    filter: Option<&str>,
) -> String {
    let select = match filter {
        Some(filter) => format!(
            "SELECT {} FROM {keys_table} WHERE {filter}",
            key_names.join(", ")
        ),
        None => format!("SELECT {} FROM {keys_table}", key_names.join(", ")),
    };
    format!("{} IN ({select})", expr_tuple(key_exprs))
}

/// Partition predicate over the affected-keys table, per subtask kind.
pub(crate) fn partition_predicate(spec: &PartitionSpec) -> String {
    match spec {
        PartitionSpec::HashRange {
            key_column,
            buckets,
            bucket,
        } => format!("hash({key_column}) % {buckets} = {bucket}"),
        PartitionSpec::Modulo {
            key_column,
            buckets,
            bucket,
        } => format!("{key_column} % {buckets} = {bucket}"),
        PartitionSpec::Partition { predicate } => predicate.clone(),
    }
}

/// Sanitized scratch-name stem for a table (`dynamic.counts` →
/// `dynamic_counts`).
pub(crate) fn name_stem(table: &TableName) -> String {
    table.as_str().replace('.', "_")
}

/// Session-scoped affected-keys temp table name.
pub(crate) fn keys_temp_name(table: &TableName) -> String {
    format!("__freshet_keys_{}", name_stem(table))
}

/// Named (cross-worker) affected-keys table for a parallel refresh.
pub(crate) fn keys_shared_name(table: &TableName) -> String {
    format!("__freshet_pkeys_{}", name_stem(table))
}

/// Temp table for the dedup path's candidate rows.
pub(crate) fn dedup_new_name(table: &TableName) -> String {
    format!("__freshet_new_{}", name_stem(table))
}

/// Temp table for the dedup path's differing-key set.
pub(crate) fn dedup_diff_name(table: &TableName) -> String {
    format!("__freshet_diff_{}", name_stem(table))
}

/// Shadow table for the swap variant of a full refresh. Lives in the
/// target's schema so the rename stays within it.
pub(crate) fn shadow_name(table: &TableName) -> String {
    match table.schema() {
        Some(schema) => format!("{schema}.__freshet_shadow_{}", table.table()),
        None => format!("__freshet_shadow_{}", table.table()),
    }
}

/// Subtask result location: `temp_<subtask_id>_<random>`.
pub(crate) fn subtask_result_name(subtask_id: i64) -> String {
    let suffix: u32 = rand::random();
    format!("temp_{subtask_id}_{suffix:08x}")
}

/// NULL-safe row diff of the candidate rows against the target restricted
/// to the affected keys, projected to grouping keys. `EXCEPT` compares
/// whole rows with set semantics, so NULLs compare equal.
pub(crate) fn dedup_diff_select(
    new_table: &str,
    target: &str,
    key_names: &[String],
    affected_pred_on_target: &str,
) -> String {
    format!(
        "SELECT DISTINCT {keys} FROM ( \
         (SELECT * FROM {new_table} EXCEPT SELECT * FROM {target} WHERE {pred}) \
         UNION ALL \
         (SELECT * FROM {target} WHERE {pred} EXCEPT SELECT * FROM {new_table}) \
         )",
        keys = key_names.join(", "),
        pred = affected_pred_on_target,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_tuples() {
        assert_eq!(key_tuple(&["customer_id".into()]), "customer_id");
        assert_eq!(
            key_tuple(&["region".into(), "day".into()]),
            "(region, day)"
        );
    }

    #[test]
    fn in_predicate_single_and_composite() {
        assert_eq!(
            keys_in_predicate(
                &["o.customer_id".into()],
                &["customer_id".into()],
                "__freshet_keys_t",
                None
            ),
            "o.customer_id IN (SELECT customer_id FROM __freshet_keys_t)"
        );
        assert_eq!(
            keys_in_predicate(
                &["c.region".into(), "o.day".into()],
                &["region".into(), "day".into()],
                "k",
                Some("hash(region) % 4 = 1")
            ),
            "(c.region, o.day) IN (SELECT region, day FROM k WHERE hash(region) % 4 = 1)"
        );
    }

    #[test]
    fn partition_predicates() {
        assert_eq!(
            partition_predicate(&PartitionSpec::HashRange {
                key_column: "customer_id".into(),
                buckets: 4,
                bucket: 2
            }),
            "hash(customer_id) % 4 = 2"
        );
        assert_eq!(
            partition_predicate(&PartitionSpec::Modulo {
                key_column: "customer_id".into(),
                buckets: 3,
                bucket: 0
            }),
            "customer_id % 3 = 0"
        );
        assert_eq!(
            partition_predicate(&PartitionSpec::Partition {
                predicate: "day >= '2026-01-01'".into()
            }),
            "day >= '2026-01-01'"
        );
    }

    #[test]
    fn scratch_names_are_sanitized() {
        let t = TableName::new("dynamic.customer_counts");
        assert_eq!(keys_temp_name(&t), "__freshet_keys_dynamic_customer_counts");
        assert_eq!(shadow_name(&t), "dynamic.__freshet_shadow_customer_counts");
        assert_eq!(shadow_name(&TableName::new("bare")), "__freshet_shadow_bare");
        assert!(subtask_result_name(7).starts_with("temp_7_"));
    }

    #[test]
    fn dedup_diff_is_symmetric() {
        let sql = dedup_diff_select(
            "__new",
            "dynamic.counts",
            &["customer_id".into()],
            "customer_id IN (SELECT customer_id FROM k)",
        );
        assert_eq!(sql.matches("EXCEPT").count(), 2);
        assert_eq!(sql.matches("__new").count(), 2);
        assert!(sql.starts_with("SELECT DISTINCT customer_id"));
    }
}
