// Fire registry - the daemon's in-memory view of upcoming fires

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

/// Ordered set of `(fire_time, task_id)` with one slot per task.
///
/// Registering a task again replaces its previous fire time. Only the daemon
/// loop touches the registry.
#[derive(Debug, Default)]
pub struct FireRegistry {
    queue: BTreeSet<(DateTime<Utc>, String)>,
    by_id: HashMap<String, DateTime<Utc>>,
}

impl FireRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_id: &str, fire_at: DateTime<Utc>) {
        if let Some(previous) = self.by_id.insert(task_id.to_string(), fire_at) {
            self.queue.remove(&(previous, task_id.to_string()));
        }
        self.queue.insert((fire_at, task_id.to_string()));
    }

    pub fn remove(&mut self, task_id: &str) -> Option<DateTime<Utc>> {
        let previous = self.by_id.remove(task_id)?;
        self.queue.remove(&(previous, task_id.to_string()));
        Some(previous)
    }

    pub fn fire_time(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.by_id.get(task_id).copied()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.by_id.contains_key(task_id)
    }

    /// Earliest registered fire
    pub fn peek(&self) -> Option<(DateTime<Utc>, &str)> {
        self.queue
            .first()
            .map(|(fire_at, id)| (*fire_at, id.as_str()))
    }

    /// Remove and return every fire due at or before `now`, earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, String)> {
        let mut due = Vec::new();
        while let Some((fire_at, _)) = self.queue.first() {
            if *fire_at > now {
                break;
            }
            if let Some((fire_at, id)) = self.queue.pop_first() {
                self.by_id.remove(&id);
                due.push((fire_at, id));
            }
        }
        due
    }

    /// Empty the registry, handing back every task's registered fire time
    pub fn take_all(&mut self) -> HashMap<String, DateTime<Utc>> {
        self.queue.clear();
        std::mem::take(&mut self.by_id)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
