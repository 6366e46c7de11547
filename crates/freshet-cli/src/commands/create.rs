use std::path::Path;

use anyhow::{Context, Result};

use freshet_engine::{registry, EngineConfig};

/// Execute the `create` command: parse, validate, persist, and (by
/// default) enqueue the initial bootstrap.
pub fn execute(config: &EngineConfig, file: &Path) -> Result<()> {
    let ddl = super::read_ddl(file)?;
    let def = freshet_sql::parse_create(&ddl)
        .with_context(|| format!("Invalid DDL in {}", file.display()))?;

    let meta = super::open_meta(config)?;
    let table = registry::create_table(meta.as_ref(), &def)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("Failed to create dynamic table")?;

    println!("Created dynamic table '{}'.", table.name);
    println!("  Sources:      {}", join_sources(&table));
    if table.grouping_keys.is_empty() {
        println!("  Grouping:     (none - full refresh only)");
    } else {
        println!("  Grouping:     {}", table.grouping_keys.join(", "));
    }
    println!("  Target lag:   {}", table.target_lag);
    println!("  Strategy:     {}", table.refresh_strategy);
    if table.initialize == freshet_types::InitializeMode::OnCreate {
        println!("  Bootstrap enqueued; a worker will populate the table.");
    }
    Ok(())
}

fn join_sources(table: &freshet_types::DynamicTable) -> String {
    table
        .sources
        .iter()
        .map(|s| {
            if s.is_dynamic {
                format!("{} (dynamic)", s.name)
            } else {
                s.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
