use anyhow::Result;

use freshet_engine::{registry, EngineConfig};
use freshet_types::TableName;

/// Execute `suspend` / `resume`.
pub fn execute(config: &EngineConfig, name: &str, suspend: bool) -> Result<()> {
    let meta = super::open_meta(config)?;
    let table = TableName::new(name);
    if suspend {
        registry::suspend(meta.as_ref(), &table).map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("Suspended '{name}'.");
    } else {
        registry::resume(meta.as_ref(), &table).map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("Resumed '{name}'.");
    }
    Ok(())
}
