//! Per-worker context: handles, identity, configuration, cancellation.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use freshet_lake::Lake;
use freshet_meta::MetaStore;
use freshet_types::WorkerId;

use crate::config::EngineConfig;

/// Everything one worker process needs, passed into every operation. No
/// module-level state anywhere in the engine.
#[derive(Clone)]
pub struct WorkerContext {
    pub meta: Arc<dyn MetaStore>,
    pub lake: Arc<dyn Lake>,
    pub config: EngineConfig,
    pub worker_id: WorkerId,
    /// Process-wide shutdown token. Refresh-scoped tokens are children of
    /// this one.
    pub cancel: CancellationToken,
}

impl WorkerContext {
    /// Build a context with a generated worker identity.
    #[must_use]
    pub fn new(meta: Arc<dyn MetaStore>, lake: Arc<dyn Lake>, config: EngineConfig) -> Self {
        Self {
            meta,
            lake,
            config,
            worker_id: WorkerId::new(generate_worker_id()),
            cancel: CancellationToken::new(),
        }
    }
}

/// `<host>-<pid>-<suffix>`: stable enough to read in logs, unique enough
/// for claim ownership.
fn generate_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix: u16 = rand::random();
    format!("{host}-{}-{suffix:04x}", std::process::id())
}
