//! CLI command implementations.

pub mod alter;
pub mod control;
pub mod create;
pub mod describe;
pub mod drop;
pub mod history;
pub mod list;
pub mod refresh;
pub mod validate;
pub mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use freshet_engine::EngineConfig;
use freshet_lake::{DuckLakeClient, Lake};
use freshet_meta::{MetaStore, PostgresMetaStore, SqliteMetaStore};

/// Open the metadata store named by the config: `sqlite:<path>` or a
/// libpq-style connection string.
pub(crate) fn open_meta(config: &EngineConfig) -> Result<Arc<dyn MetaStore>> {
    if let Some(path) = config.metadata_url.strip_prefix("sqlite:") {
        let store = SqliteMetaStore::open(Path::new(path))
            .with_context(|| format!("opening sqlite metadata store at {path}"))?;
        Ok(Arc::new(store))
    } else {
        let store = PostgresMetaStore::open(&config.metadata_url)
            .context("connecting to postgres metadata store")?;
        Ok(Arc::new(store))
    }
}

/// Attach the lake catalog named by the config.
pub(crate) fn open_lake(config: &EngineConfig) -> Result<Arc<dyn Lake>> {
    let client = DuckLakeClient::open(&config.lake_url, config.lake_data_path.as_deref())
        .with_context(|| format!("attaching lake at {}", config.lake_url))?;
    Ok(Arc::new(client))
}

/// Read a DDL file.
pub(crate) fn read_ddl(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read DDL file: {}", path.display()))
}
