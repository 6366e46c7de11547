mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use freshet_engine::EngineConfig;

#[derive(Parser)]
#[command(name = "freshet", version, about = "Dynamic tables over your lake")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a dynamic table from a CREATE DYNAMIC TABLE file
    Create {
        /// Path to the DDL file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Validate a DDL file without persisting anything
    Validate {
        /// Path to the DDL file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List dynamic tables with status and staleness
    List,
    /// Show full properties and recent history for one table
    Describe {
        /// Qualified table name
        name: String,
    },
    /// Update table properties
    Alter {
        /// Qualified table name
        name: String,
        /// KEY=VALUE property assignments
        #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
        sets: Vec<String>,
    },
    /// Pause scheduling for a table
    Suspend {
        /// Qualified table name
        name: String,
    },
    /// Resume scheduling (clears failed status)
    Resume {
        /// Qualified table name
        name: String,
    },
    /// Enqueue a manual refresh with elevated priority
    Refresh {
        /// Qualified table name
        name: String,
    },
    /// Drop a table, its metadata, and its lake data
    Drop {
        /// Qualified table name
        name: String,
    },
    /// Show the refresh log for a table
    History {
        /// Qualified table name
        name: String,
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Run the worker loop (optionally with the scheduler co-located)
    Worker {
        /// Also run scheduler ticks in this process
        #[arg(long)]
        scheduler: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);
    let config = EngineConfig::from_env()?;

    match cli.command {
        Commands::Create { file } => commands::create::execute(&config, &file),
        Commands::Validate { file, format } => commands::validate::execute(&file, &format),
        Commands::List => commands::list::execute(&config),
        Commands::Describe { name } => commands::describe::execute(&config, &name),
        Commands::Alter { name, sets } => commands::alter::execute(&config, &name, &sets),
        Commands::Suspend { name } => commands::control::execute(&config, &name, true),
        Commands::Resume { name } => commands::control::execute(&config, &name, false),
        Commands::Refresh { name } => commands::refresh::execute(&config, &name),
        Commands::Drop { name } => commands::drop::execute(&config, &name).await,
        Commands::History { name, limit } => commands::history::execute(&config, &name, limit),
        Commands::Worker { scheduler } => commands::worker::execute(config, scheduler).await,
    }
}
