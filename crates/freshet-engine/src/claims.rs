//! Claim manager: acquisition, heartbeating, release.
//!
//! Thin policy layer over the metadata store's claim table. The heartbeat
//! runs as its own task for the whole life of a refresh (including the
//! coordinator's wait loop); losing it cancels the refresh token, which
//! aborts the executor at its next suspension point.

use std::ops::ControlFlow;

use tokio_util::sync::CancellationToken;

use freshet_types::{Claim, TableName};

use freshet_meta::MetaStore as _;

use crate::context::WorkerContext;
use crate::errors::EngineError;

/// Try to acquire the table-level claim.
///
/// # Errors
///
/// Returns an error on metadata-store failure; `Ok(None)` means another
/// worker holds the claim.
pub fn try_claim(ctx: &WorkerContext, table: &TableName) -> Result<Option<Claim>, EngineError> {
    let claim = ctx
        .meta
        .try_claim(table, &ctx.worker_id, ctx.config.claim_timeout.as_secs())?;
    if claim.is_some() {
        tracing::debug!(table = %table, worker = %ctx.worker_id, "Claim acquired");
    }
    Ok(claim)
}

/// Release a held claim. Failures are logged; the claim will expire on
/// its own if the delete is lost.
pub fn release(ctx: &WorkerContext, table: &TableName) {
    if let Err(e) = ctx.meta.release_claim(table, &ctx.worker_id) {
        tracing::warn!(table = %table, "Failed to release claim (will expire): {e}");
    }
}

/// Spawn the heartbeat task for a held table claim. Cancels
/// `refresh_cancel` when the claim is lost or the heartbeat cannot be
/// written; either means this worker must stop touching the table.
pub fn spawn_heartbeat(
    ctx: &WorkerContext,
    table: TableName,
    refresh_cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let stop = refresh_cancel.clone();
        crate::ticker::every(ctx.config.heartbeat_interval, &stop, move || {
            let ctx = ctx.clone();
            let table = table.clone();
            let refresh_cancel = refresh_cancel.clone();
            async move {
                let timeout = ctx.config.claim_timeout.as_secs();
                match ctx.meta.heartbeat_claim(&table, &ctx.worker_id, timeout) {
                    Ok(true) => ControlFlow::Continue(()),
                    Ok(false) => {
                        tracing::warn!(table = %table, "Claim lost; aborting refresh");
                        refresh_cancel.cancel();
                        ControlFlow::Break(())
                    }
                    Err(e) => {
                        // A heartbeat we cannot write is a claim we cannot
                        // prove; treat as lost.
                        tracing::warn!(table = %table, "Heartbeat write failed; aborting refresh: {e}");
                        refresh_cancel.cancel();
                        ControlFlow::Break(())
                    }
                }
            }
        })
        .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use freshet_meta::{MetaStore, SqliteMetaStore};
    use freshet_types::{
        now_iso, DynamicTable, InitializeMode, RefreshStrategy, SourceRef, TableStatus, TargetLag,
    };

    use crate::config::EngineConfig;
    use crate::context::WorkerContext;

    struct NoLake;

    #[async_trait::async_trait]
    impl freshet_lake::Lake for NoLake {
        async fn execute(&self, _sql: &str) -> freshet_lake::error::Result<u64> {
            unimplemented!("claim tests never touch the lake")
        }
        async fn query_i64(&self, _sql: &str) -> freshet_lake::error::Result<i64> {
            unimplemented!()
        }
        async fn begin(&self) -> freshet_lake::error::Result<()> {
            unimplemented!()
        }
        async fn commit(&self) -> freshet_lake::error::Result<()> {
            unimplemented!()
        }
        async fn rollback(&self) -> freshet_lake::error::Result<()> {
            unimplemented!()
        }
        async fn current_snapshot(&self, _source: &str) -> freshet_lake::error::Result<i64> {
            unimplemented!()
        }
        fn changes_relation(&self, _source: &str, _from: i64, _to: i64) -> String {
            unimplemented!()
        }
        async fn table_exists(&self, _table: &str) -> freshet_lake::error::Result<bool> {
            unimplemented!()
        }
        async fn create_table_as(&self, _t: &str, _s: &str) -> freshet_lake::error::Result<()> {
            unimplemented!()
        }
        async fn create_temp_table_as(
            &self,
            _t: &str,
            _s: &str,
        ) -> freshet_lake::error::Result<i64> {
            unimplemented!()
        }
        async fn drop_table(&self, _t: &str) -> freshet_lake::error::Result<()> {
            unimplemented!()
        }
        async fn rename_table(&self, _f: &str, _t: &str) -> freshet_lake::error::Result<()> {
            unimplemented!()
        }
        async fn row_count(&self, _t: &str) -> freshet_lake::error::Result<i64> {
            unimplemented!()
        }
    }

    fn ctx() -> WorkerContext {
        let meta = Arc::new(SqliteMetaStore::in_memory().unwrap());
        let table = DynamicTable {
            name: TableName::new("dynamic.t"),
            query_sql: "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id".into(),
            grouping_keys: vec!["customer_id".into()],
            sources: vec![SourceRef { name: "orders".into(), is_dynamic: false }],
            target_lag: TargetLag::Duration(std::time::Duration::from_secs(60)),
            refresh_strategy: RefreshStrategy::Auto,
            deduplication: false,
            cardinality_threshold: 0.3,
            allow_parallel: false,
            parallel_threshold: 10_000_000,
            max_parallelism: 4,
            shadow: false,
            initialize: InitializeMode::OnCreate,
            status: TableStatus::Active,
            comment: None,
            created_at: now_iso(),
            updated_at: now_iso(),
        };
        meta.register_table(&table).unwrap();
        WorkerContext::new(meta, Arc::new(NoLake), EngineConfig::default())
    }

    #[tokio::test]
    async fn claim_acquire_and_release() {
        let ctx = ctx();
        let table = TableName::new("dynamic.t");
        let claim = try_claim(&ctx, &table).unwrap().unwrap();
        assert_eq!(claim.worker_id, ctx.worker_id);
        // Second acquisition by the same context fails (claim exists).
        assert!(try_claim(&ctx, &table).unwrap().is_none());
        release(&ctx, &table);
        assert!(try_claim(&ctx, &table).unwrap().is_some());
    }

    #[tokio::test]
    async fn heartbeat_on_foreign_claim_cancels_refresh() {
        let ctx = ctx();
        let table = TableName::new("dynamic.t");
        // No claim exists at all: first heartbeat reports a lost claim.
        let refresh_cancel = CancellationToken::new();
        let mut cfg = ctx.config.clone();
        cfg.heartbeat_interval = std::time::Duration::from_millis(10);
        let ctx = WorkerContext { config: cfg, ..ctx };
        let handle = spawn_heartbeat(&ctx, table, refresh_cancel.clone());
        tokio::time::timeout(std::time::Duration::from_secs(5), refresh_cancel.cancelled())
            .await
            .expect("refresh token should be cancelled");
        let _ = handle.await;
    }
}
