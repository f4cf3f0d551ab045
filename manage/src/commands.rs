// Catalog management commands
//
// Every command goes through `TaskStore`, so edits made while the daemon runs
// are serialized with its own writes and show up on its next reconcile.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::models::{NewTask, TaskEntry};
use common::storage::TaskStore;
use std::path::Path;

/// Validate a JSON draft and add it to the catalog
pub async fn add_from_file(
    store: &dyn TaskStore,
    draft_path: &Path,
    now: DateTime<Utc>,
) -> Result<TaskEntry> {
    let raw = std::fs::read_to_string(draft_path)
        .with_context(|| format!("Failed to read task draft {}", draft_path.display()))?;
    let draft: NewTask = serde_json::from_str(&raw)
        .with_context(|| format!("Task draft {} is not valid JSON", draft_path.display()))?;
    let entry = TaskEntry::create(draft, now).context("Task draft rejected")?;
    Ok(store.add(entry).await?)
}

pub async fn set_active(store: &dyn TaskStore, task_id: &str, active: bool) -> Result<TaskEntry> {
    Ok(store.set_active(task_id, active).await?)
}

pub async fn delete(store: &dyn TaskStore, task_id: &str) -> Result<()> {
    Ok(store.delete(task_id).await?)
}

pub async fn show(store: &dyn TaskStore, task_id: &str) -> Result<String> {
    let entry = store.get(task_id).await?;
    Ok(serde_json::to_string_pretty(&entry)?)
}

/// One line per task, in catalog order
pub async fn list(store: &dyn TaskStore) -> Result<Vec<String>> {
    let entries = store.list().await?;
    Ok(entries.iter().map(summary_line).collect())
}

fn summary_line(entry: &TaskEntry) -> String {
    let next = entry
        .next_run_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<8}  {:<8}  next={}  runs={} errors={}  {}",
        entry.id,
        entry.schedule_type,
        if entry.is_active { "active" } else { "disabled" },
        next,
        entry.run_count,
        entry.error_count,
        entry.name
    )
}
