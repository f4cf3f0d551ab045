// Management binary: inspect and edit the task catalog

mod commands;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use common::bootstrap;
use common::telemetry;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "manage", about = "Manage scheduled report tasks")]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every task in the catalog
    List,
    /// Print one task as JSON
    Show { task_id: String },
    /// Add a task from a JSON draft file
    Add { draft: PathBuf },
    /// Let the daemon fire a task again
    Enable { task_id: String },
    /// Stop the daemon from firing a task
    Disable { task_id: String },
    /// Remove a task; its id is never reused
    Delete { task_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = bootstrap::load_settings(&cli.config_dir)?;
    // Logging only; the daemon owns the metrics port
    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.log_format,
        None,
    )?;
    let store = bootstrap::init_task_store(&settings);

    match cli.command {
        Command::List => {
            for line in commands::list(store.as_ref()).await? {
                println!("{}", line);
            }
        }
        Command::Show { task_id } => println!("{}", commands::show(store.as_ref(), &task_id).await?),
        Command::Add { draft } => {
            let entry = commands::add_from_file(store.as_ref(), &draft, Utc::now()).await?;
            info!(task_id = %entry.id, next_run_at = ?entry.next_run_at, "Task added");
            println!("{}", entry.id);
        }
        Command::Enable { task_id } => {
            let entry = commands::set_active(store.as_ref(), &task_id, true).await?;
            info!(task_id = %entry.id, next_run_at = ?entry.next_run_at, "Task enabled");
        }
        Command::Disable { task_id } => {
            commands::set_active(store.as_ref(), &task_id, false).await?;
            info!(task_id = %task_id, "Task disabled");
        }
        Command::Delete { task_id } => {
            commands::delete(store.as_ref(), &task_id).await?;
            info!(task_id = %task_id, "Task deleted");
        }
    }

    // The daemon applies catalog edits on its next reconcile, or at once on SIGHUP
    Ok(())
}
