use anyhow::Result;

use freshet_engine::{registry, EngineConfig};
use freshet_types::TableName;

/// Execute the `drop` command: remove metadata (cascading) and the lake
/// table.
pub async fn execute(config: &EngineConfig, name: &str) -> Result<()> {
    let meta = super::open_meta(config)?;
    let lake = super::open_lake(config)?;
    registry::drop_table(meta.as_ref(), lake.as_ref(), &TableName::new(name))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("Dropped '{name}'.");
    Ok(())
}
