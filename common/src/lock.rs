// Exclusive lock file guarding catalog mutations across processes

use crate::errors::StoreError;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

/// CatalogLock serializes read-modify-write cycles on one catalog file.
///
/// The lock is a sibling file created with `create_new`, so it works between
/// unrelated processes. Each holder stamps the file with a unique token and
/// only ever removes a file carrying its own token. A lock file older than
/// `stale_after` is assumed to belong to a crashed writer and is evicted.
#[derive(Debug, Clone)]
pub struct CatalogLock {
    path: PathBuf,
    timeout: Duration,
    stale_after: Duration,
    retry_delay: Duration,
}

impl CatalogLock {
    /// Lock for the catalog at `catalog_path` (the lock lives at `<catalog>.lock`)
    pub fn for_catalog(catalog_path: &Path) -> Self {
        let mut name = catalog_path.as_os_str().to_owned();
        name.push(".lock");
        Self {
            path: PathBuf::from(name),
            timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
            retry_delay: Duration::from_millis(5),
        }
    }

    pub fn with_timeouts(mut self, timeout: Duration, stale_after: Duration) -> Self {
        self.timeout = timeout;
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held or the timeout elapses
    pub fn acquire(&self) -> Result<CatalogLockGuard, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let token = Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let stamp = format!(
                        "{} {} {}",
                        std::process::id(),
                        chrono::Utc::now().to_rfc3339(),
                        token
                    );
                    if let Err(e) = file.write_all(stamp.as_bytes()).and_then(|_| file.sync_all()) {
                        // Without a stamp the lock could never be released as ours
                        drop(file);
                        let _ = std::fs::remove_file(&self.path);
                        return Err(e.into());
                    }
                    debug!(lock = %self.path.display(), "Catalog lock acquired");
                    return Ok(CatalogLockGuard {
                        path: self.path.clone(),
                        stamp,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    self.evict_stale_lock();
                    if started.elapsed() > self.timeout {
                        return Err(StoreError::LockTimeout {
                            path: self.path.display().to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(self.retry_delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Evict the lock file if it is older than `stale_after`
    fn evict_stale_lock(&self) {
        let age = std::fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        let Some(age) = age.filter(|age| *age > self.stale_after) else {
            return;
        };
        let Ok(stale_stamp) = std::fs::read(&self.path) else {
            return;
        };
        if self.evict_if_stamped(&stale_stamp) {
            warn!(
                lock = %self.path.display(),
                age_seconds = age.as_secs(),
                "Evicted stale catalog lock"
            );
        }
    }

    /// Move the lock file aside, putting it back unless it carries `stale_stamp`.
    ///
    /// The rename is atomic, so of several waiters only one moves a given
    /// file. A stamp mismatch means another waiter already replaced the stale
    /// lock and the moved file belongs to a live holder; it is linked back.
    fn evict_if_stamped(&self, stale_stamp: &[u8]) -> bool {
        let mut aside = self.path.as_os_str().to_owned();
        aside.push(format!(".stale.{}", Uuid::new_v4().simple()));
        let aside = PathBuf::from(aside);
        if std::fs::rename(&self.path, &aside).is_err() {
            // Someone else moved or released it first
            return false;
        }

        let evicted = std::fs::read(&aside).ok().as_deref() == Some(stale_stamp);
        if !evicted {
            if let Err(e) = std::fs::hard_link(&aside, &self.path) {
                warn!(lock = %self.path.display(), error = %e, "Could not restore live catalog lock moved during eviction");
            }
        }
        let _ = std::fs::remove_file(&aside);
        evicted
    }
}

/// Lock guard that removes the lock file when dropped, if it is still ours
#[derive(Debug)]
pub struct CatalogLockGuard {
    path: PathBuf,
    stamp: String,
}

impl Drop for CatalogLockGuard {
    fn drop(&mut self) {
        match std::fs::read(&self.path) {
            Ok(current) if current == self.stamp.as_bytes() => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(lock = %self.path.display(), error = %e, "Failed to release catalog lock");
                }
            }
            Ok(_) => warn!(
                lock = %self.path.display(),
                "Catalog lock was taken over while held, leaving the new owner's lock"
            ),
            Err(e) => warn!(lock = %self.path.display(), error = %e, "Catalog lock vanished while held"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let lock = CatalogLock::for_catalog(&dir.path().join("tasks.json"))
            .with_timeouts(Duration::from_millis(50), Duration::from_secs(60));

        let guard = lock.acquire().unwrap();
        assert!(lock.path().exists());
        assert!(matches!(
            lock.acquire(),
            Err(StoreError::LockTimeout { .. })
        ));

        drop(guard);
        assert!(!lock.path().exists());
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_stale_lock_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let lock = CatalogLock::for_catalog(&dir.path().join("tasks.json"))
            .with_timeouts(Duration::from_secs(2), Duration::from_millis(10));

        std::fs::write(lock.path(), "99999 crashed").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_guard_leaves_foreign_lock_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let lock = CatalogLock::for_catalog(&dir.path().join("tasks.json"))
            .with_timeouts(Duration::from_millis(50), Duration::from_secs(60));

        let guard = lock.acquire().unwrap();
        // Another writer evicted us and now holds the lock
        std::fs::write(lock.path(), "4242 2024-01-01T00:00:00Z other-token").unwrap();
        drop(guard);

        assert_eq!(
            std::fs::read_to_string(lock.path()).unwrap(),
            "4242 2024-01-01T00:00:00Z other-token"
        );
    }

    #[test]
    fn test_fresh_lock_survives_eviction_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let lock = CatalogLock::for_catalog(&dir.path().join("tasks.json"))
            .with_timeouts(Duration::from_millis(100), Duration::from_secs(60));

        let holder = lock.acquire().unwrap();
        let live_stamp = std::fs::read(lock.path()).unwrap();

        // A waiter that judged an older lock stale moves the live one by mistake
        assert!(!lock.evict_if_stamped(b"99999 2024-01-01T00:00:00Z crashed-token"));
        assert_eq!(std::fs::read(lock.path()).unwrap(), live_stamp);
        assert!(matches!(lock.acquire(), Err(StoreError::LockTimeout { .. })));

        drop(holder);
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_stale_eviction_leaves_no_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let lock = CatalogLock::for_catalog(&dir.path().join("tasks.json"))
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(60));

        std::fs::write(lock.path(), "99999 crashed").unwrap();
        std::fs::File::options()
            .write(true)
            .open(lock.path())
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        // Several waiters race to evict the same stale lock; one wins at a time
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    let guard = lock.acquire().unwrap();
                    let stamp = std::fs::read_to_string(lock.path()).unwrap();
                    std::thread::sleep(Duration::from_millis(5));
                    // Nobody replaced our lock while we held it
                    assert_eq!(std::fs::read_to_string(lock.path()).unwrap(), stamp);
                    drop(guard);
                })
            })
            .collect();
        for waiter in waiters {
            waiter.join().unwrap();
        }

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
    }

    #[test]
    fn test_lock_path_sits_next_to_catalog() {
        let lock = CatalogLock::for_catalog(Path::new("/var/lib/reports/tasks.json"));
        assert_eq!(lock.path(), Path::new("/var/lib/reports/tasks.json.lock"));
    }
}
