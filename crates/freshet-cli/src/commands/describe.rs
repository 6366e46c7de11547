use anyhow::Result;

use freshet_engine::{registry, EngineConfig};
use freshet_types::TableName;

const HISTORY_SHOWN: u32 = 10;

/// Execute the `describe` command: full properties and recent history.
pub fn execute(config: &EngineConfig, name: &str) -> Result<()> {
    let meta = super::open_meta(config)?;
    let (table, history) =
        registry::describe(meta.as_ref(), &TableName::new(name), HISTORY_SHOWN)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

    println!("{}", table.name);
    println!("  Status:                {}", table.status);
    println!("  Target lag:            {}", table.target_lag);
    println!("  Refresh strategy:      {}", table.refresh_strategy);
    println!("  Deduplication:         {}", table.deduplication);
    println!("  Cardinality threshold: {}", table.cardinality_threshold);
    println!("  Allow parallel:        {}", table.allow_parallel);
    println!("  Parallel threshold:    {}", table.parallel_threshold);
    println!("  Max parallelism:       {}", table.max_parallelism);
    println!("  Shadow refresh:        {}", table.shadow);
    println!("  Initialize:            {}", table.initialize.as_str());
    if let Some(comment) = &table.comment {
        println!("  Comment:               {comment}");
    }
    println!("  Created:               {}", table.created_at);
    println!("  Updated:               {}", table.updated_at);
    println!("  Sources:");
    for s in &table.sources {
        let kind = if s.is_dynamic { "dynamic" } else { "base" };
        println!("    {} ({kind})", s.name);
    }
    if !table.grouping_keys.is_empty() {
        println!("  Grouping keys:         {}", table.grouping_keys.join(", "));
    }
    println!("  Definition:");
    println!("    {}", table.query_sql);

    if history.is_empty() {
        println!("  History: (no refreshes yet)");
    } else {
        println!("  History (most recent first):");
        for entry in history {
            let rows = entry.rows_affected.unwrap_or(0);
            let duration = entry.duration_ms.unwrap_or(0);
            let error = entry
                .error_code
                .map_or_else(String::new, |code| format!(" [{code}]"));
            println!(
                "    {} {:<8} {:<22} rows={rows} {}ms{error}",
                entry.started_at, entry.outcome, entry.strategy.as_str(), duration
            );
        }
    }
    Ok(())
}
