use std::path::Path;

use anyhow::Result;

use freshet_sql::RefreshCapability;

/// Execute the `validate` command: run the DDL checks without touching
/// any store. Exit code reflects validity.
pub fn execute(file: &Path, format: &str) -> Result<()> {
    let ddl = super::read_ddl(file)?;
    let parsed = freshet_sql::parse_create(&ddl);

    match format {
        "json" => {
            let body = match &parsed {
                Ok(def) => serde_json::json!({
                    "valid": true,
                    "name": def.name.as_str(),
                    "sources": def.shape.sources,
                    "grouping_keys": def.shape.grouping_keys,
                    "capability": match def.shape.capability {
                        RefreshCapability::AffectedKeys => "affected_keys",
                        RefreshCapability::FullOnly => "full_only",
                    },
                    "full_only_reasons": def.shape.full_only_reasons,
                }),
                Err(e) => serde_json::json!({
                    "valid": false,
                    "error": e.to_string(),
                }),
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        _ => match &parsed {
            Ok(def) => {
                println!("{}: valid", def.name);
                println!("  Sources:       {}", def.shape.sources.join(", "));
                if def.shape.grouping_keys.is_empty() {
                    println!("  Capability:    full refresh only");
                    for reason in &def.shape.full_only_reasons {
                        println!("    - {reason}");
                    }
                } else {
                    println!("  Grouping keys: {}", def.shape.grouping_keys.join(", "));
                }
            }
            Err(e) => println!("invalid: {e}"),
        },
    }

    match parsed {
        Ok(_) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("validation failed: {e}")),
    }
}
