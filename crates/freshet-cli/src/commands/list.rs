use anyhow::Result;

use freshet_engine::{registry, EngineConfig};

/// Execute the `list` command: tabular summary of every dynamic table.
pub fn execute(config: &EngineConfig) -> Result<()> {
    let meta = super::open_meta(config)?;
    let summaries = registry::list_summaries(meta.as_ref()).map_err(|e| anyhow::anyhow!("{e}"))?;

    if summaries.is_empty() {
        println!("No dynamic tables.");
        return Ok(());
    }

    println!(
        "{:<40} {:<10} {:<12} {:<28} {:<10} {}",
        "NAME", "STATUS", "TARGET_LAG", "LAST_REFRESH", "LAG", "STRATEGY"
    );
    for s in summaries {
        let lag = s
            .staleness_seconds
            .map_or_else(|| "-".to_string(), format_lag);
        let last = s.last_refresh.as_deref().unwrap_or("never");
        let status = match &s.last_error_code {
            Some(code) => format!("{} ({code})", s.status),
            None => s.status.to_string(),
        };
        println!(
            "{:<40} {:<10} {:<12} {:<28} {:<10} {}",
            s.name.as_str(),
            status,
            s.target_lag.to_string(),
            last,
            lag,
            s.strategy,
        );
    }
    Ok(())
}

fn format_lag(seconds: i64) -> String {
    if seconds >= 3_600 {
        format!("{}h{}m", seconds / 3_600, (seconds % 3_600) / 60)
    } else if seconds >= 60 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{seconds}s")
    }
}
