use anyhow::{bail, Result};

use freshet_engine::{registry, EngineConfig};
use freshet_types::TableName;

/// Execute the `alter` command: apply `--set KEY=VALUE` property updates.
pub fn execute(config: &EngineConfig, name: &str, sets: &[String]) -> Result<()> {
    let mut parsed = Vec::with_capacity(sets.len());
    for set in sets {
        let Some((key, value)) = set.split_once('=') else {
            bail!("--set expects KEY=VALUE, got '{set}'");
        };
        parsed.push((key.trim().to_string(), value.trim().to_string()));
    }

    let meta = super::open_meta(config)?;
    let table = registry::alter_table(meta.as_ref(), &TableName::new(name), &parsed)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    println!("Altered '{}' ({} change(s)).", table.name, parsed.len());
    Ok(())
}
