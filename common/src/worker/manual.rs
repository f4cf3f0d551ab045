// On-demand runs outside the daemon

use crate::errors::StoreError;
use crate::models::{Outcome, TaskEntry};
use crate::storage::TaskStore;
use crate::worker::{ExecutionRunner, RunResult};
use chrono::Utc;
use tracing::{info, instrument, warn};

/// What a manual run did, per task
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Inactive tasks or tasks already running
    pub skipped: Vec<String>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    fn absorb(&mut self, entry: &TaskEntry, result: RunResult) {
        match result {
            RunResult::Completed(Outcome::Success { .. }) => self.succeeded.push(entry.id.clone()),
            RunResult::Completed(Outcome::Failure(reason)) => {
                self.failed.push((entry.id.clone(), reason))
            }
            RunResult::SkippedInFlight => self.skipped.push(entry.id.clone()),
        }
    }
}

/// Run one task now, or every active task when `task_id` is `None`.
///
/// Runs use the current time as their fire instant. An unknown id is an
/// error; an inactive task is skipped with a warning.
#[instrument(skip(store, runner))]
pub async fn run_now(
    store: &dyn TaskStore,
    runner: &ExecutionRunner,
    task_id: Option<&str>,
) -> Result<RunSummary, StoreError> {
    let entries = match task_id {
        Some(id) => vec![store.get(id).await?],
        None => store.list().await?,
    };

    let mut summary = RunSummary::default();
    for entry in entries {
        if !entry.is_active {
            warn!(task_id = %entry.id, task_name = %entry.name, "Task is inactive, skipping");
            summary.skipped.push(entry.id.clone());
            continue;
        }
        let result = runner.run(&entry, Utc::now()).await;
        summary.absorb(&entry, result);
    }

    info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        skipped = summary.skipped.len(),
        "Manual run finished"
    );
    Ok(summary)
}
