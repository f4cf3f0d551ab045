// Scheduler binary entry point

use anyhow::{Context, Result};
use clap::Parser;
use common::bootstrap;
use common::scheduler::{SchedulerEngine, SchedulerHandle};
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "scheduler", about = "Run the report scheduling daemon")]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, default_value = "config")]
    config_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = bootstrap::load_settings(&cli.config_dir)?;
    bootstrap::init_telemetry(&settings)?;

    info!(
        catalog = %settings.store.path.display(),
        missed_fire_policy = ?settings.scheduler.missed_fire_policy,
        "Starting report scheduler"
    );

    let store = bootstrap::init_task_store(&settings);
    let runner = Arc::new(bootstrap::init_execution_runner(&settings, store.clone()));
    let engine = SchedulerEngine::new(bootstrap::engine_config(&settings), store, runner)
        .with_lease(bootstrap::daemon_lease(&settings));

    spawn_signal_listener(engine.handle());

    let result = engine.run().await;
    telemetry::shutdown_tracer();

    match result {
        Ok(()) => {
            info!("Scheduler stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Scheduler failed");
            Err(e).context("Scheduler terminated with an error")
        }
    }
}

/// Ctrl-C and SIGTERM stop the daemon; SIGHUP reloads the catalog
fn spawn_signal_listener(handle: SchedulerHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut terminate, mut hangup) =
                match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                    (Ok(terminate), Ok(hangup)) => (terminate, hangup),
                    (Err(e), _) | (_, Err(e)) => {
                        error!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C signal, initiating graceful shutdown");
                        handle.shutdown();
                        break;
                    }
                    _ = terminate.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                        handle.shutdown();
                        break;
                    }
                    _ = hangup.recv() => {
                        info!("Received SIGHUP, reloading task catalog");
                        handle.reload();
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C signal, initiating graceful shutdown");
                    handle.shutdown();
                }
                Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
            }
        }
    });
}
