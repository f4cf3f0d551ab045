// Bootstrap utilities for binary initialization
// Shared by the scheduler daemon and the worker binary

use crate::config::Settings;
use crate::executor::{
    CsvExporter, DatabaseQuerySource, ExcelExporter, ExporterRegistry, Mailer, OutboxMailer,
};
use crate::scheduler::{DaemonLease, EngineConfig};
use crate::storage::{FileTaskStore, TaskStore};
use crate::telemetry;
use crate::worker::{ExecutionRunner, RunnerOptions};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Load and validate settings from `config_dir`
pub fn load_settings(config_dir: &str) -> Result<Settings> {
    let settings = Settings::load_from_path(config_dir)
        .with_context(|| format!("Failed to load configuration from {}", config_dir))?;
    settings
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid configuration: {}", reason))?;
    Ok(settings)
}

/// Initialize logging, tracing and metrics from the observability section
pub fn init_telemetry(settings: &Settings) -> Result<()> {
    let observability = &settings.observability;
    telemetry::init_logging(
        &observability.log_level,
        observability.log_format,
        observability.tracing_endpoint.as_deref(),
    )
    .context("Failed to initialize logging")?;

    if let Some(port) = observability.metrics_port {
        telemetry::init_metrics(port).context("Failed to initialize metrics")?;
    }
    Ok(())
}

/// Initialize the file-backed task catalog
#[tracing::instrument(skip(settings))]
pub fn init_task_store(settings: &Settings) -> Arc<dyn TaskStore> {
    let store = FileTaskStore::with_lock_timeouts(
        settings.store.path.clone(),
        Duration::from_millis(settings.store.lock_timeout_ms),
        Duration::from_secs(settings.store.lock_stale_seconds),
    );
    info!(path = %settings.store.path.display(), "Task store initialized");
    Arc::new(store)
}

/// Wire the runner with the built-in query source, exporters and outbox mailer
#[tracing::instrument(skip(settings, store))]
pub fn init_execution_runner(settings: &Settings, store: Arc<dyn TaskStore>) -> ExecutionRunner {
    let exporters = ExporterRegistry::new()
        .register(Arc::new(ExcelExporter::new()))
        .register(Arc::new(CsvExporter::new()));
    let mailer: Arc<dyn Mailer> = Arc::new(OutboxMailer::new(
        settings.mail.outbox_dir.clone(),
        settings.mail.from_address.clone(),
    ));

    info!(
        output_dir = %settings.export.output_dir.display(),
        outbox_dir = %settings.mail.outbox_dir.display(),
        formats = ?exporters.formats(),
        "Execution runner initialized"
    );

    ExecutionRunner::new(
        store,
        Arc::new(DatabaseQuerySource::new(
            settings.database.connect_timeout_seconds,
        )),
        exporters,
        Some(mailer),
        RunnerOptions {
            output_dir: settings.export.output_dir.clone(),
            execution_timeout: settings
                .runner
                .execution_timeout_seconds
                .map(Duration::from_secs),
        },
    )
}

pub fn engine_config(settings: &Settings) -> EngineConfig {
    EngineConfig {
        reconcile_interval: Duration::from_secs(settings.scheduler.reconcile_interval_seconds),
        shutdown_grace: Duration::from_secs(settings.scheduler.shutdown_grace_seconds),
        missed_fire_policy: settings.scheduler.missed_fire_policy,
    }
}

pub fn daemon_lease(settings: &Settings) -> DaemonLease {
    DaemonLease::for_catalog(
        &settings.store.path,
        Duration::from_secs(settings.scheduler.lease_ttl_seconds),
    )
}
