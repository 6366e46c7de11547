use anyhow::Result;

use freshet_engine::{registry, EngineConfig};
use freshet_types::TableName;

/// Execute the `refresh` command: enqueue a manual refresh.
pub fn execute(config: &EngineConfig, name: &str) -> Result<()> {
    let meta = super::open_meta(config)?;
    registry::manual_refresh(meta.as_ref(), &TableName::new(name))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("Refresh enqueued for '{name}' with elevated priority.");
    Ok(())
}
