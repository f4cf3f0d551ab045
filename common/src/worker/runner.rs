// Execution runner - runs one task end to end and records the outcome
//
// query -> exports -> mail, stopping at the first failing step. At most one
// execution per task is in flight at any time; a concurrent fire for the same
// task is dropped, not queued.

use crate::errors::ExecutionError;
use crate::executor::{ExporterRegistry, Mailer, QuerySource};
use crate::models::{ExportArtifact, MailMessage, Outcome, ResultSet, TaskEntry};
use crate::storage::TaskStore;
use crate::telemetry;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Result of asking the runner to execute a fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Completed(Outcome),
    /// The task was already executing; this fire was dropped
    SkippedInFlight,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Directory for reports without an explicit path override
    pub output_dir: PathBuf,
    pub execution_timeout: Option<Duration>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            execution_timeout: None,
        }
    }
}

type InFlightSet = Arc<Mutex<HashSet<String>>>;

fn lock_set(set: &InFlightSet) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a task as executing until dropped
struct InFlightGuard {
    set: InFlightSet,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_set(&self.set).remove(&self.id);
    }
}

pub struct ExecutionRunner {
    store: Arc<dyn TaskStore>,
    query_source: Arc<dyn QuerySource>,
    exporters: ExporterRegistry,
    mailer: Option<Arc<dyn Mailer>>,
    options: RunnerOptions,
    in_flight: InFlightSet,
    cancelled: AtomicBool,
}

impl ExecutionRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        query_source: Arc<dyn QuerySource>,
        exporters: ExporterRegistry,
        mailer: Option<Arc<dyn Mailer>>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            store,
            query_source,
            exporters,
            mailer,
            options,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        lock_set(&self.in_flight).contains(task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        lock_set(&self.in_flight).len()
    }

    /// Ask running executions to stop at their next step boundary
    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn claim(&self, task_id: &str) -> Option<InFlightGuard> {
        let mut set = lock_set(&self.in_flight);
        if !set.insert(task_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: task_id.to_string(),
        })
    }

    /// Execute `entry` for the fire scheduled at `fired_at` and record the outcome
    #[instrument(skip(self, entry), fields(task_id = %entry.id, task_name = %entry.name, fired_at = %fired_at))]
    pub async fn run(&self, entry: &TaskEntry, fired_at: DateTime<Utc>) -> RunResult {
        let Some(_guard) = self.claim(&entry.id) else {
            warn!("Task still running from a previous fire, skipping this fire");
            telemetry::record_skipped_fire(&entry.id);
            return RunResult::SkippedInFlight;
        };

        info!("Executing task");
        let started = Instant::now();
        let outcome = self.execute_guarded(entry, fired_at).await;
        let elapsed = started.elapsed();

        telemetry::record_task_duration(&entry.id, &entry.name, elapsed.as_secs_f64());
        match &outcome {
            Outcome::Success { rows } => {
                telemetry::record_task_success(&entry.id, &entry.name);
                info!(rows = rows, duration_ms = elapsed.as_millis() as u64, "Task succeeded");
            }
            Outcome::Failure(reason) => {
                telemetry::record_task_failure(&entry.id, &entry.name);
                error!(error = %reason, duration_ms = elapsed.as_millis() as u64, "Task failed");
            }
        }

        // The entry may have been deleted meanwhile; the outcome is then dropped
        match self.store.record_run(&entry.id, fired_at, &outcome).await {
            Ok(updated) => info!(
                run_count = updated.run_count,
                error_count = updated.error_count,
                next_run_at = ?updated.next_run_at,
                "Run recorded"
            ),
            Err(e) => error!(error = %e, "Failed to record run outcome"),
        }

        RunResult::Completed(outcome)
    }

    /// Run the steps with timeout and panic containment
    async fn execute_guarded(&self, entry: &TaskEntry, fired_at: DateTime<Utc>) -> Outcome {
        let work = AssertUnwindSafe(self.execute(entry, fired_at)).catch_unwind();

        let result = match self.options.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    return Outcome::Failure(ExecutionError::Timeout(limit.as_secs()).to_string())
                }
            },
            None => work.await,
        };

        match result {
            Ok(Ok(rows)) => Outcome::Success { rows },
            Ok(Err(e)) => Outcome::Failure(e.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Outcome::Failure(ExecutionError::Panicked(message).to_string())
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.is_cancel_requested() {
            return Err(ExecutionError::Cancelled);
        }
        Ok(())
    }

    async fn execute(
        &self,
        entry: &TaskEntry,
        fired_at: DateTime<Utc>,
    ) -> Result<usize, ExecutionError> {
        self.check_cancelled()?;
        let data = self.query_source.fetch(&entry.query_spec).await?;
        if data.is_empty() {
            return Err(ExecutionError::EmptyResult);
        }

        let mut artifacts = Vec::new();
        for format in entry.notification_spec.requested_formats() {
            self.check_cancelled()?;
            let exporter = self
                .exporters
                .get(format)
                .ok_or_else(|| ExecutionError::ExporterUnavailable(format.to_string()))?;
            let destination = entry
                .notification_spec
                .path_override(format)
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    self.options
                        .output_dir
                        .join(format!("report_{}.{}", entry.id, format.extension()))
                });
            artifacts.push(exporter.export(&data, &destination).await?);
        }

        if !entry.notification_spec.recipients.is_empty() {
            self.check_cancelled()?;
            let mailer = self
                .mailer
                .as_ref()
                .ok_or(ExecutionError::MailerUnavailable)?;
            mailer
                .send(&build_message(entry, fired_at, &data, artifacts))
                .await?;
        }

        Ok(data.row_count())
    }
}

fn build_message(
    entry: &TaskEntry,
    fired_at: DateTime<Utc>,
    data: &ResultSet,
    attachments: Vec<ExportArtifact>,
) -> MailMessage {
    let mut body = format!(
        "Report \"{}\" ran at {}.\n",
        entry.name,
        fired_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if !entry.description.is_empty() {
        body.push_str(&entry.description);
        body.push('\n');
    }
    body.push_str(&format!(
        "\nRows: {}\nColumns: {}\n",
        data.row_count(),
        data.columns.join(", ")
    ));
    if !attachments.is_empty() {
        let names: Vec<&str> = attachments.iter().map(|a| a.file_name.as_str()).collect();
        body.push_str(&format!("Attachments: {}\n", names.join(", ")));
    }

    MailMessage {
        to: entry.notification_spec.recipients.clone(),
        cc: entry.notification_spec.cc_recipients.clone(),
        subject: entry.notification_spec.subject.clone(),
        body,
        attachments,
    }
}
