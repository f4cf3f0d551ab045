// Worker binary entry point: run catalog tasks immediately, outside the daemon

use anyhow::{Context, Result};
use clap::Parser;
use common::bootstrap;
use common::telemetry;
use common::worker::run_now;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "worker", about = "Run report tasks now")]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Run only this task; every active task otherwise
    #[arg(long)]
    task_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = bootstrap::load_settings(&cli.config_dir)?;
    bootstrap::init_telemetry(&settings)?;

    let store = bootstrap::init_task_store(&settings);
    let runner = bootstrap::init_execution_runner(&settings, store.clone());

    let result = run_now(store.as_ref(), &runner, cli.task_id.as_deref()).await;
    telemetry::shutdown_tracer();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, task_id = ?cli.task_id, "Could not load tasks");
            return Err(e).context("Failed to read the task catalog");
        }
    };

    for (task_id, reason) in &summary.failed {
        error!(task_id = %task_id, error = %reason, "Task failed");
    }
    info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        skipped = summary.skipped.len(),
        "Worker finished"
    );

    if summary.has_failures() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
