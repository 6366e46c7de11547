//! End-to-end refresh semantics against the simulated lake.
//!
//! Every test drives the real executor/scheduler/coordinator over
//! `SqliteMetaStore` and the `SimLake` snapshot double.

mod support;

use std::sync::Arc;
use std::time::Duration;

use freshet_engine::executor::{self, RefreshReport};
use freshet_engine::registry;
use freshet_engine::scheduler;
use freshet_engine::subtask;
use freshet_engine::{EngineConfig, WorkerContext};
use freshet_meta::{MetaStore, SqliteMetaStore};
use freshet_types::{
    now_iso, HistoryEntry, PendingRefresh, RefreshOutcome, RefreshTrigger, SnapshotMap,
    StrategyKind, TableName, TableStatus, WorkerId,
};

use support::SimLake;

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(20),
        claim_timeout: Duration::from_secs(300),
        heartbeat_interval: Duration::from_millis(50),
        refresh_timeout: Duration::from_secs(60),
        coordinator_wait_timeout: Duration::from_secs(30),
        coordinator_poll_interval: Duration::from_millis(50),
        scheduler_interval: Duration::from_millis(20),
        max_retries: 2,
        subtask_retry_max: 3,
        ..EngineConfig::default()
    }
}

fn setup() -> (Arc<SqliteMetaStore>, Arc<SimLake>, WorkerContext) {
    let meta = Arc::new(SqliteMetaStore::in_memory().expect("meta"));
    let lake = Arc::new(SimLake::new());
    let ctx = WorkerContext::new(meta.clone(), lake.clone(), test_config());
    (meta, lake, ctx)
}

fn create(ctx: &WorkerContext, ddl: &str) -> freshet_types::DynamicTable {
    let def = freshet_sql::parse_create(ddl).expect("valid ddl");
    registry::create_table(ctx.meta.as_ref(), &def).expect("create")
}

/// Claim, execute, and finish one refresh the way the worker loop does,
/// then advance the target's lake version (a real lake commit creates a
/// snapshot).
async fn run_refresh(ctx: &WorkerContext, lake: &SimLake, name: &str) -> RefreshReport {
    let table_name = TableName::new(name);
    let pending = PendingRefresh {
        dynamic_table: table_name.clone(),
        due_at: now_iso(),
        priority: 0,
        trigger: RefreshTrigger::Manual,
        enqueued_at: now_iso(),
    };
    ctx.meta.enqueue_refresh(&pending, true).expect("enqueue");
    ctx.meta
        .try_claim(&table_name, &ctx.worker_id, 300)
        .expect("claim io")
        .expect("claim held elsewhere");
    let table = ctx.meta.get_table(&table_name).expect("io").expect("table");
    let result = executor::execute_refresh(ctx, &table, RefreshTrigger::Manual).await;
    ctx.meta.delete_pending(&table_name).expect("delete pending");
    ctx.meta
        .release_claim(&table_name, &ctx.worker_id)
        .expect("release");
    let report = result.expect("refresh");
    if report.outcome == RefreshOutcome::Success {
        lake.advance(name);
    }
    report
}

const COUNTS_DDL: &str = "
    CREATE DYNAMIC TABLE counts
    TARGET_LAG = '5 minutes'
    AS
    SELECT customer_id, COUNT(*) AS order_count
    FROM orders
    GROUP BY customer_id
";

fn seed_orders(lake: &SimLake) {
    lake.exec(
        "CREATE TABLE orders (order_id INTEGER, customer_id INTEGER, amount DECIMAL(10,2));",
    );
    lake.exec(
        "INSERT INTO orders VALUES \
         (1, 5, 10.00), (2, 5, 20.00), (3, 5, 30.00), (4, 7, 40.00), (5, 7, 50.00);",
    );
    // Background population of untouched keys, so small changes stay
    // under the cardinality threshold.
    lake.exec(
        "INSERT INTO orders SELECT 100 + range, 100 + range, 5.00 FROM range(10);",
    );
    lake.advance("orders");
}

/// Target contents for the hand-seeded keys (background keys filtered).
fn counts_pairs(lake: &SimLake) -> Vec<(i64, i64)> {
    lake.pairs(
        "SELECT customer_id, order_count FROM dynamic.counts \
         WHERE customer_id < 100 ORDER BY customer_id",
    )
}

#[tokio::test]
async fn fk_update_recomputes_exactly_the_affected_keys() {
    let (meta, lake, ctx) = setup();
    seed_orders(&lake);
    create(&ctx, COUNTS_DDL);

    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.strategy, StrategyKind::Bootstrap);
    assert_eq!(report.outcome, RefreshOutcome::Success);
    assert_eq!(counts_pairs(&lake), vec![(5, 3), (7, 2)]);

    // Move one order from customer 5 to customer 7.
    lake.exec("UPDATE orders SET customer_id = 7 WHERE order_id = 3;");
    lake.advance("orders");

    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.strategy, StrategyKind::AffectedKeys);
    assert_eq!(report.outcome, RefreshOutcome::Success);
    // Exactly the two touched keys were recomputed.
    assert_eq!(report.affected_keys, Some(2));
    assert_eq!(counts_pairs(&lake), vec![(5, 2), (7, 3)]);

    let history = meta.history(&TableName::new("dynamic.counts"), 10).unwrap();
    assert_eq!(history[0].strategy, StrategyKind::AffectedKeys);
    assert_eq!(history[0].affected_keys_count, Some(2));
}

#[tokio::test]
async fn delete_of_last_row_for_a_key_removes_the_target_row() {
    let (_meta, lake, ctx) = setup();
    seed_orders(&lake);
    create(&ctx, COUNTS_DDL);
    run_refresh(&ctx, &lake, "dynamic.counts").await;

    lake.exec("DELETE FROM orders WHERE customer_id = 7;");
    lake.advance("orders");

    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.strategy, StrategyKind::AffectedKeys);
    // Customer 7 disappears entirely instead of lingering at zero.
    assert_eq!(counts_pairs(&lake), vec![(5, 3)]);
}

#[tokio::test]
async fn noop_refresh_is_skipped_and_idempotent() {
    let (meta, lake, ctx) = setup();
    seed_orders(&lake);
    create(&ctx, COUNTS_DDL);
    run_refresh(&ctx, &lake, "dynamic.counts").await;
    let before = counts_pairs(&lake);
    let name = TableName::new("dynamic.counts");
    let snaps_before: SnapshotMap = meta
        .source_snapshots(&name)
        .unwrap()
        .into_iter()
        .map(|s| (s.source, s.last_snapshot))
        .collect();

    // No source advanced: the refresh must not touch the lake.
    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.outcome, RefreshOutcome::Skipped);
    assert_eq!(report.strategy, StrategyKind::Skipped);
    assert_eq!(counts_pairs(&lake), before);

    // Snapshot pointers did not move (monotonicity holds trivially).
    let snaps_after: SnapshotMap = meta
        .source_snapshots(&name)
        .unwrap()
        .into_iter()
        .map(|s| (s.source, s.last_snapshot))
        .collect();
    assert_eq!(snaps_before, snaps_after);

    let history = meta.history(&name, 10).unwrap();
    assert_eq!(history[0].outcome, RefreshOutcome::Skipped);
}

#[tokio::test]
async fn cardinality_flip_selects_full_refresh() {
    let (meta, lake, ctx) = setup();
    lake.exec("CREATE TABLE orders (order_id INTEGER, customer_id INTEGER, amount DECIMAL(10,2));");
    // Ten customers, one order each.
    lake.exec(
        "INSERT INTO orders SELECT range AS order_id, range AS customer_id, 1.00 \
         FROM range(10);",
    );
    lake.advance("orders");
    create(&ctx, COUNTS_DDL);
    run_refresh(&ctx, &lake, "dynamic.counts").await;

    // Touch 40% of the keys with a 30% threshold.
    lake.exec("INSERT INTO orders VALUES (100, 0, 2.00), (101, 1, 2.00), (102, 2, 2.00), (103, 3, 2.00);");
    lake.advance("orders");

    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.strategy, StrategyKind::Full);
    assert_eq!(report.outcome, RefreshOutcome::Success);

    let history = meta.history(&TableName::new("dynamic.counts"), 1).unwrap();
    assert_eq!(history[0].strategy, StrategyKind::Full);

    // Contents equal a from-scratch recomputation at current snapshots.
    let expected = lake.pairs(
        "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id ORDER BY customer_id",
    );
    assert_eq!(
        lake.pairs(
            "SELECT customer_id, order_count FROM dynamic.counts ORDER BY customer_id"
        ),
        expected
    );
}

#[tokio::test]
async fn deduplication_skips_when_recomputation_matches_target() {
    let (meta, lake, ctx) = setup();
    seed_orders(&lake);
    create(
        &ctx,
        "CREATE DYNAMIC TABLE counts
         TARGET_LAG = '5 minutes'
         DEDUPLICATE = true
         AS
         SELECT customer_id, COUNT(*) AS order_count
         FROM orders
         GROUP BY customer_id",
    );
    run_refresh(&ctx, &lake, "dynamic.counts").await;

    // An amount change leaves every COUNT(*) untouched.
    lake.exec("UPDATE orders SET amount = 99.00 WHERE order_id = 1;");
    lake.advance("orders");

    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.strategy, StrategyKind::AffectedKeys);
    assert_eq!(report.outcome, RefreshOutcome::Skipped);
    assert_eq!(counts_pairs(&lake), vec![(5, 3), (7, 2)]);

    // The skipped attempt still advanced the snapshot pointers, so the
    // next pass is a plain no-op.
    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.strategy, StrategyKind::Skipped);
    let _ = meta;
}

#[tokio::test]
async fn bootstrap_chain_populates_in_topological_order() {
    let (meta, lake, ctx) = setup();
    seed_orders(&lake);

    create(&ctx, COUNTS_DDL);
    create(
        &ctx,
        "CREATE DYNAMIC TABLE by_order_count
         TARGET_LAG = '5 minutes'
         AS
         SELECT order_count, COUNT(*) AS customers
         FROM dynamic.counts
         GROUP BY order_count",
    );
    create(
        &ctx,
        "CREATE DYNAMIC TABLE by_customers
         TARGET_LAG = '5 minutes'
         AS
         SELECT customers, COUNT(*) AS buckets
         FROM dynamic.by_order_count
         GROUP BY customers",
    );

    // One scheduling pass: drain the queue in priority order, exactly the
    // way the worker loop does.
    loop {
        let due = meta.due_refreshes(&now_iso()).unwrap();
        let Some(next) = due.first() else { break };
        let name = next.dynamic_table.as_str().to_string();
        meta.try_claim(&next.dynamic_table, &ctx.worker_id, 300)
            .unwrap()
            .expect("unclaimed");
        let table = meta.get_table(&next.dynamic_table).unwrap().unwrap();
        let report = executor::execute_refresh(&ctx, &table, next.trigger)
            .await
            .expect("refresh");
        assert_eq!(report.strategy, StrategyKind::Bootstrap, "table {name}");
        meta.delete_pending(&next.dynamic_table).unwrap();
        meta.release_claim(&next.dynamic_table, &ctx.worker_id).unwrap();
        lake.advance(&name);
    }

    // counts: {5:3, 7:2} plus ten single-order keys
    // → by_order_count: {1:10, 2:1, 3:1} → by_customers: {1:2, 10:1}
    assert_eq!(counts_pairs(&lake), vec![(5, 3), (7, 2)]);
    assert_eq!(
        lake.pairs("SELECT order_count, customers FROM dynamic.by_order_count ORDER BY 1"),
        vec![(1, 10), (2, 1), (3, 1)]
    );
    assert_eq!(
        lake.pairs("SELECT customers, buckets FROM dynamic.by_customers ORDER BY 1"),
        vec![(1, 2), (10, 1)]
    );

    // Every table recorded the snapshot of each source captured before
    // its query ran - including dynamic upstreams.
    let b_snaps = meta
        .source_snapshots(&TableName::new("dynamic.by_order_count"))
        .unwrap();
    assert_eq!(b_snaps.len(), 1);
    assert_eq!(b_snaps[0].source, "dynamic.counts");
    assert_eq!(b_snaps[0].last_snapshot, 1);
}

#[tokio::test]
async fn claim_recovery_lets_a_second_worker_finish() {
    let (meta, lake, ctx) = setup();
    seed_orders(&lake);
    create(&ctx, COUNTS_DDL);
    run_refresh(&ctx, &lake, "dynamic.counts").await;
    let name = TableName::new("dynamic.counts");
    let history_before = meta.history(&name, 50).unwrap().len();

    lake.exec("UPDATE orders SET customer_id = 7 WHERE order_id = 3;");
    lake.advance("orders");

    // Worker 1 claims with an immediate expiry and "crashes".
    let w1 = WorkerId::new("crashed-worker");
    meta.try_claim(&name, &w1, 0).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(5));

    // The sweeper frees the claim; worker 2 takes over and completes.
    let freed = meta.expire_claims(&now_iso()).unwrap();
    assert_eq!(freed, vec![name.clone()]);
    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.outcome, RefreshOutcome::Success);

    // Exactly one additional history row; the pointer advanced once.
    let history = meta.history(&name, 50).unwrap();
    assert_eq!(history.len(), history_before + 1);
    let snaps = meta.source_snapshots(&name).unwrap();
    assert_eq!(
        snaps.iter().find(|s| s.source == "orders").unwrap().last_snapshot,
        2
    );
}

#[tokio::test]
async fn failed_upstream_skips_downstream_for_the_pass() {
    let (meta, lake, ctx) = setup();
    seed_orders(&lake);
    create(&ctx, COUNTS_DDL);
    create(
        &ctx,
        "CREATE DYNAMIC TABLE by_order_count
         TARGET_LAG = '5 minutes'
         AS
         SELECT order_count, COUNT(*) AS customers
         FROM dynamic.counts
         GROUP BY order_count",
    );
    run_refresh(&ctx, &lake, "dynamic.counts").await;
    run_refresh(&ctx, &lake, "dynamic.by_order_count").await;

    meta.set_status(&TableName::new("dynamic.counts"), TableStatus::Failed)
        .unwrap();

    let report = run_refresh(&ctx, &lake, "dynamic.by_order_count").await;
    assert_eq!(report.outcome, RefreshOutcome::Skipped);
    let history = meta
        .history(&TableName::new("dynamic.by_order_count"), 1)
        .unwrap();
    assert_eq!(history[0].error_code.as_deref(), Some("UPSTREAM_FAILED"));
    // Not marked failed: it re-evaluates once the upstream is fixed.
    let table = meta
        .get_table(&TableName::new("dynamic.by_order_count"))
        .unwrap()
        .unwrap();
    assert_eq!(table.status, TableStatus::Active);
}

#[tokio::test]
async fn scheduler_skips_downstream_lag_tables_on_noop_ticks() {
    let (meta, lake, ctx) = setup();
    seed_orders(&lake);
    create(&ctx, COUNTS_DDL);
    create(
        &ctx,
        "CREATE DYNAMIC TABLE rollup
         TARGET_LAG = 'downstream'
         AS
         SELECT order_count, COUNT(*) AS customers
         FROM dynamic.counts
         GROUP BY order_count",
    );
    run_refresh(&ctx, &lake, "dynamic.counts").await;
    run_refresh(&ctx, &lake, "dynamic.rollup").await;

    // A no-op refresh of the upstream must not wake the downstream table.
    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.outcome, RefreshOutcome::Skipped);
    let tick = scheduler::run_tick(&ctx).await.unwrap();
    assert!(
        !tick.due.iter().any(|t| t.as_str() == "dynamic.rollup"),
        "skipped upstream refresh must not trigger downstream, got {:?}",
        tick.due
    );

    // A data change does wake it on the following tick.
    lake.exec("UPDATE orders SET customer_id = 7 WHERE order_id = 3;");
    lake.advance("orders");
    let report = run_refresh(&ctx, &lake, "dynamic.counts").await;
    assert_eq!(report.outcome, RefreshOutcome::Success);
    let tick = scheduler::run_tick(&ctx).await.unwrap();
    assert!(
        tick.due.iter().any(|t| t.as_str() == "dynamic.rollup"),
        "successful upstream refresh must trigger downstream, got {:?}",
        tick.due
    );
    let _ = meta;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_merge_matches_single_worker_contents() {
    let (meta, lake, ctx) = setup();
    lake.exec("CREATE TABLE orders (order_id INTEGER, customer_id INTEGER, amount DECIMAL(10,2));");
    lake.exec(
        "INSERT INTO orders SELECT range, range % 20, 1.00 FROM range(100);",
    );
    lake.advance("orders");
    create(
        &ctx,
        "CREATE DYNAMIC TABLE counts
         TARGET_LAG = '5 minutes'
         CARDINALITY_THRESHOLD = 0.9
         ALLOW_PARALLEL = true
         PARALLEL_THRESHOLD = 4
         MAX_PARALLELISM = 2
         AS
         SELECT customer_id, COUNT(*) AS order_count
         FROM orders
         GROUP BY customer_id",
    );
    run_refresh(&ctx, &lake, "dynamic.counts").await;

    // Make the fleet look idle: two other workers appear in recent
    // history without holding any claim.
    for helper in ["helper-1", "helper-2"] {
        meta.append_history(&HistoryEntry {
            dynamic_table: TableName::new("dynamic.counts"),
            worker_id: WorkerId::new(helper),
            started_at: now_iso(),
            completed_at: Some(now_iso()),
            outcome: RefreshOutcome::Success,
            strategy: StrategyKind::Full,
            rows_affected: Some(0),
            affected_keys_count: None,
            duration_ms: Some(1),
            error_code: None,
            error_message: None,
            snapshots: SnapshotMap::new(),
            trigger: RefreshTrigger::Manual,
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    // Touch 6 of the 20 keys.
    lake.exec("INSERT INTO orders SELECT 1000 + range, range % 6, 2.00 FROM range(6);");
    lake.advance("orders");

    // Two helper workers drain the subtask queue while the coordinator
    // waits.
    let mut helpers = Vec::new();
    for helper in ["helper-1", "helper-2"] {
        let helper_ctx = WorkerContext {
            worker_id: WorkerId::new(helper),
            ..ctx.clone()
        };
        helpers.push(tokio::spawn(async move {
            loop {
                match subtask::try_run_subtask(&helper_ctx).await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(Duration::from_millis(10)).await,
                    Err(e) => panic!("subtask worker failed: {e}"),
                }
            }
        }));
    }

    let report = tokio::time::timeout(
        Duration::from_secs(30),
        run_refresh(&ctx, &lake, "dynamic.counts"),
    )
    .await
    .expect("parallel refresh timed out");
    for helper in &helpers {
        helper.abort();
    }

    assert_eq!(report.strategy, StrategyKind::ParallelAffectedKeys);
    assert_eq!(report.outcome, RefreshOutcome::Success);
    assert_eq!(report.affected_keys, Some(6));

    // Merge-order determinism: contents equal a from-scratch
    // recomputation of the same snapshot pair.
    let expected = lake.pairs(
        "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id ORDER BY customer_id",
    );
    assert_eq!(
        lake.pairs(
            "SELECT customer_id, order_count FROM dynamic.counts ORDER BY customer_id"
        ),
        expected
    );

    // Subtask rows and scratch tables were cleaned up.
    assert!(meta
        .list_subtasks(&TableName::new("dynamic.counts"))
        .unwrap()
        .is_empty());

    let history = meta.history(&TableName::new("dynamic.counts"), 1).unwrap();
    assert_eq!(history[0].strategy, StrategyKind::ParallelAffectedKeys);
}

#[tokio::test]
async fn definitional_failure_surfaces_with_stable_code() {
    let (meta, lake, ctx) = setup();
    seed_orders(&lake);
    let table = create(&ctx, COUNTS_DDL);
    run_refresh(&ctx, &lake, "dynamic.counts").await;

    // Corrupt the stored definition behind the registry's back.
    let mut broken = table;
    broken.query_sql = "SELEKT nonsense".into();
    meta.update_table(&broken).unwrap();
    lake.exec("UPDATE orders SET amount = 1.00 WHERE order_id = 1;");
    lake.advance("orders");

    let name = TableName::new("dynamic.counts");
    meta.try_claim(&name, &ctx.worker_id, 300).unwrap().unwrap();
    let stored = meta.get_table(&name).unwrap().unwrap();
    let err = executor::execute_refresh(&ctx, &stored, RefreshTrigger::Scheduled)
        .await
        .expect_err("must fail");
    meta.release_claim(&name, &ctx.worker_id).unwrap();

    assert_eq!(err.code(), "INVALID_QUERY");
    let history = meta.history(&name, 1).unwrap();
    assert_eq!(history[0].outcome, RefreshOutcome::Failed);
    assert_eq!(history[0].error_code.as_deref(), Some("INVALID_QUERY"));
}
