// JSON file task store
//
// The catalog is a single JSON array rewritten whole on each mutation. Writers
// hold `CatalogLock` for the whole read-modify-write cycle and publish the
// new catalog with an atomic rename, so lock-free readers always see a
// complete document.

use super::{TaskMutation, TaskStore};
use crate::errors::StoreError;
use crate::lock::CatalogLock;
use crate::models::TaskEntry;
use async_trait::async_trait;
use std::collections::HashSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Write `bytes` to `path` through a synced temp file and a rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog".to_string());
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// File-backed task store
#[derive(Clone)]
pub struct FileTaskStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    lock: CatalogLock,
    // Ids deleted through this store; never handed out again
    retired: Mutex<HashSet<String>>,
}

impl FileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = CatalogLock::for_catalog(&path);
        Self::with_lock(path, lock)
    }

    pub fn with_lock_timeouts(
        path: impl Into<PathBuf>,
        timeout: Duration,
        stale_after: Duration,
    ) -> Self {
        let path = path.into();
        let lock = CatalogLock::for_catalog(&path).with_timeouts(timeout, stale_after);
        Self::with_lock(path, lock)
    }

    fn with_lock(path: PathBuf, lock: CatalogLock) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                lock,
                retired: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Io(format!("catalog task failed: {}", e)))?
    }
}

impl Inner {
    fn corruption(&self, reason: impl Into<String>) -> StoreError {
        StoreError::StorageCorruption {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    fn read_catalog(&self) -> Result<Vec<TaskEntry>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(self.corruption(format!("not valid UTF-8: {}", e)))
            }
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<TaskEntry> =
            serde_json::from_str(&raw).map_err(|e| self.corruption(e.to_string()))?;

        let mut seen = HashSet::with_capacity(entries.len());
        if let Some(dup) = entries.iter().find(|entry| !seen.insert(entry.id.as_str())) {
            return Err(self.corruption(format!("duplicate task id {}", dup.id)));
        }
        Ok(entries)
    }

    fn write_catalog(&self, entries: &[TaskEntry]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }

    /// Run one read-modify-write cycle under the catalog lock
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Vec<TaskEntry>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.acquire()?;
        let mut entries = self.read_catalog()?;
        let result = change(&mut entries)?;
        self.write_catalog(&entries)?;
        Ok(result)
    }

    fn is_retired(&self, id: &str) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }

    fn retire(&self, id: &str) {
        self.retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string());
    }
}

fn position(entries: &[TaskEntry], id: &str) -> Result<usize, StoreError> {
    entries
        .iter()
        .position(|entry| entry.id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

#[async_trait]
impl TaskStore for FileTaskStore {
    #[instrument(skip(self, entry), fields(task_id = %entry.id, task_name = %entry.name))]
    async fn add(&self, entry: TaskEntry) -> Result<TaskEntry, StoreError> {
        entry.schedule()?;
        let added = self
            .blocking(move |inner| {
                if inner.is_retired(&entry.id) {
                    return Err(StoreError::DuplicateId(entry.id));
                }
                inner.mutate(|entries| {
                    if entries.iter().any(|existing| existing.id == entry.id) {
                        return Err(StoreError::DuplicateId(entry.id.clone()));
                    }
                    entries.push(entry.clone());
                    Ok(entry)
                })
            })
            .await?;

        info!(next_run_at = ?added.next_run_at, "Task added to catalog");
        Ok(added)
    }

    async fn get(&self, id: &str) -> Result<TaskEntry, StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| {
            let entries = inner.read_catalog()?;
            entries
                .into_iter()
                .find(|entry| entry.id == id)
                .ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<TaskEntry>, StoreError> {
        self.blocking(|inner| inner.read_catalog()).await
    }

    #[instrument(skip(self, entry), fields(task_id = %entry.id))]
    async fn update(&self, entry: TaskEntry) -> Result<TaskEntry, StoreError> {
        entry.schedule()?;
        self.blocking(move |inner| {
            inner.mutate(|entries| {
                let index = position(entries, &entry.id)?;
                entries[index] = entry.clone();
                Ok(entry)
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| {
            inner.mutate(|entries| {
                let index = position(entries, &id)?;
                entries.remove(index);
                Ok(())
            })?;
            inner.retire(&id);
            Ok(())
        })
        .await?;

        info!("Task deleted from catalog");
        Ok(())
    }

    #[instrument(skip(self, mutation))]
    async fn modify(&self, id: &str, mutation: TaskMutation) -> Result<TaskEntry, StoreError> {
        let id = id.to_string();
        let updated = self
            .blocking(move |inner| {
                inner.mutate(|entries| {
                    let index = position(entries, &id)?;
                    let entry = &mut entries[index];
                    let before = entry.clone();
                    mutation(entry);
                    // The id is the catalog key
                    entry.id = before.id.clone();
                    let rescheduled = entry.schedule_type != before.schedule_type
                        || entry.schedule_config != before.schedule_config;
                    if rescheduled {
                        // Nothing is written when the new schedule is unusable
                        entry.schedule()?;
                    }
                    Ok(entry.clone())
                })
            })
            .await?;

        debug!(
            run_count = updated.run_count,
            next_run_at = ?updated.next_run_at,
            "Task modified"
        );
        Ok(updated)
    }
}
