use anyhow::Result;

use freshet_engine::EngineConfig;
use freshet_meta::MetaStore as _;
use freshet_types::TableName;

/// Execute the `history` command: the refresh log for one table.
pub fn execute(config: &EngineConfig, name: &str, limit: u32) -> Result<()> {
    let meta = super::open_meta(config)?;
    let entries = meta.history(&TableName::new(name), limit)?;

    if entries.is_empty() {
        println!("No refresh history for '{name}'.");
        return Ok(());
    }

    println!(
        "{:<28} {:<8} {:<22} {:>12} {:>10} {:<8} {}",
        "STARTED", "OUTCOME", "STRATEGY", "ROWS", "DURATION", "TRIGGER", "ERROR"
    );
    for entry in entries {
        let rows = entry
            .rows_affected
            .map_or_else(|| "-".to_string(), |r| r.to_string());
        let duration = entry
            .duration_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
        let error = entry.error_code.unwrap_or_default();
        println!(
            "{:<28} {:<8} {:<22} {:>12} {:>10} {:<8} {}",
            entry.started_at,
            entry.outcome.as_str(),
            entry.strategy.as_str(),
            rows,
            duration,
            entry.trigger.as_str(),
            error,
        );
    }
    Ok(())
}
