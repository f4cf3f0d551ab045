// Task catalog persistence
//
// `TaskStore` is the only way anything reads or writes the catalog. The file
// implementation is shared by the daemon, the run-now worker and management
// tooling.

pub mod file;

pub use file::{write_atomic, FileTaskStore};

use crate::errors::StoreError;
use crate::models::{Outcome, TaskEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// In-place edit applied to one entry while the catalog lock is held
pub type TaskMutation = Box<dyn FnOnce(&mut TaskEntry) + Send>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new entry; fails with `DuplicateId` if the id was ever used
    async fn add(&self, entry: TaskEntry) -> Result<TaskEntry, StoreError>;

    async fn get(&self, id: &str) -> Result<TaskEntry, StoreError>;

    /// All entries in insertion order
    async fn list(&self) -> Result<Vec<TaskEntry>, StoreError>;

    /// Replace the stored entry with the same id, field for field
    async fn update(&self, entry: TaskEntry) -> Result<TaskEntry, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Read-modify-write of a single entry under the catalog lock
    async fn modify(&self, id: &str, mutation: TaskMutation) -> Result<TaskEntry, StoreError>;

    /// Bulk read used to rehydrate the daemon
    async fn load_all(&self) -> Result<Vec<TaskEntry>, StoreError> {
        self.list().await
    }

    /// Record a completed attempt and derive the following fire time
    async fn record_run(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
        outcome: &Outcome,
    ) -> Result<TaskEntry, StoreError> {
        let outcome = outcome.clone();
        self.modify(
            id,
            Box::new(move |entry| entry.apply_outcome(fired_at, &outcome)),
        )
        .await
    }

    /// Enable or disable an entry. Enabling re-derives `next_run_at`.
    async fn set_active(&self, id: &str, active: bool) -> Result<TaskEntry, StoreError> {
        self.modify(
            id,
            Box::new(move |entry| {
                entry.is_active = active;
                if active {
                    entry.recompute_next_run();
                }
            }),
        )
        .await
    }
}
