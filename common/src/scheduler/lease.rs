// Single-authority lease for the daemon
//
// Only one daemon may drive a catalog. The lease is a small JSON record next
// to the catalog; it is renewed on every reconcile tick and expires on its own
// if the holder dies.

use crate::errors::SchedulerError;
use crate::lock::CatalogLock;
use crate::storage::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub instance_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

/// File-backed lease held by one daemon instance
#[derive(Debug, Clone)]
pub struct DaemonLease {
    instance_id: String,
    pid: u32,
    path: PathBuf,
    ttl: Duration,
}

impl DaemonLease {
    /// Lease for the catalog at `catalog_path`, stored at `<catalog>.daemon.lease`
    pub fn for_catalog(catalog_path: &Path, ttl: Duration) -> Self {
        let mut name = catalog_path.as_os_str().to_owned();
        name.push(".daemon.lease");
        Self {
            instance_id: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            path: PathBuf::from(name),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn acquire_or_renew(&self) -> Result<LeaseRecord, SchedulerError> {
        self.acquire_or_renew_at(Utc::now())
    }

    /// `acquire_or_renew` on the blocking pool, for callers on the async loop
    pub async fn heartbeat(&self) -> Result<LeaseRecord, SchedulerError> {
        self.blocking(|lease| lease.acquire_or_renew()).await
    }

    /// `release` on the blocking pool
    pub async fn surrender(&self) -> Result<(), SchedulerError> {
        self.blocking(|lease| lease.release()).await
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(&DaemonLease) -> Result<T, SchedulerError> + Send + 'static,
    {
        let lease = self.clone();
        tokio::task::spawn_blocking(move || op(&lease))
            .await
            .map_err(|e| SchedulerError::Lease(format!("lease task failed: {}", e)))?
    }

    /// Take the lease if it is free, ours, or expired; renew it if ours.
    pub fn acquire_or_renew_at(&self, now: DateTime<Utc>) -> Result<LeaseRecord, SchedulerError> {
        let _guard = CatalogLock::for_catalog(&self.path).acquire()?;

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| SchedulerError::Lease(format!("invalid lease ttl: {}", e)))?;
        let expires_at = now + ttl;

        let record = match read_record(&self.path)? {
            Some(existing) if existing.instance_id == self.instance_id => LeaseRecord {
                heartbeat_at: now,
                lease_expires_at: expires_at,
                ..existing
            },
            Some(existing) if existing.lease_expires_at > now => {
                return Err(SchedulerError::LeaseHeld {
                    holder: existing.instance_id,
                    pid: existing.pid,
                    expires_at: existing.lease_expires_at.to_rfc3339(),
                });
            }
            previous => {
                if let Some(expired) = &previous {
                    warn!(
                        previous_holder = %expired.instance_id,
                        previous_pid = expired.pid,
                        "Taking over expired scheduler lease"
                    );
                }
                info!(instance_id = %self.instance_id, lease = %self.path.display(), "Scheduler lease acquired");
                LeaseRecord {
                    instance_id: self.instance_id.clone(),
                    pid: self.pid,
                    started_at: now,
                    heartbeat_at: now,
                    lease_expires_at: expires_at,
                }
            }
        };

        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| SchedulerError::Lease(format!("failed to encode lease: {}", e)))?;
        write_atomic(&self.path, &json)
            .map_err(|e| SchedulerError::Lease(format!("failed to write lease: {}", e)))?;

        debug!(expires_at = %record.lease_expires_at, "Scheduler lease renewed");
        Ok(record)
    }

    /// Remove the lease if this instance still holds it
    pub fn release(&self) -> Result<(), SchedulerError> {
        let _guard = CatalogLock::for_catalog(&self.path).acquire()?;
        match read_record(&self.path)? {
            Some(record) if record.instance_id == self.instance_id => {
                std::fs::remove_file(&self.path)
                    .map_err(|e| SchedulerError::Lease(format!("failed to remove lease: {}", e)))?;
                info!(instance_id = %self.instance_id, "Scheduler lease released");
            }
            _ => debug!("Lease not held by this instance, nothing to release"),
        }
        Ok(())
    }
}

/// Read the current lease; a missing or unreadable record counts as no lease
pub fn read_record(path: &Path) -> Result<Option<LeaseRecord>, SchedulerError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SchedulerError::Lease(format!("failed to read lease: {}", e))),
    };

    match serde_json::from_slice::<LeaseRecord>(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(lease = %path.display(), error = %e, "Ignoring malformed scheduler lease");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_second_live_daemon_refused() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("tasks.json");
        let first = DaemonLease::for_catalog(&catalog, Duration::from_secs(45));
        let second = DaemonLease::for_catalog(&catalog, Duration::from_secs(45));

        first.acquire_or_renew_at(at("2024-01-01T00:00:00Z")).unwrap();
        let err = second
            .acquire_or_renew_at(at("2024-01-01T00:00:30Z"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::LeaseHeld { ref holder, .. } if holder == first.instance_id()));
    }

    #[test]
    fn test_renew_keeps_start_and_extends_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let lease = DaemonLease::for_catalog(&dir.path().join("tasks.json"), Duration::from_secs(45));

        let acquired = lease.acquire_or_renew_at(at("2024-01-01T00:00:00Z")).unwrap();
        let renewed = lease.acquire_or_renew_at(at("2024-01-01T00:00:10Z")).unwrap();
        assert_eq!(renewed.started_at, acquired.started_at);
        assert_eq!(renewed.lease_expires_at, at("2024-01-01T00:00:55Z"));
        assert!(lease.path().ends_with("tasks.json.daemon.lease"));
    }

    #[test]
    fn test_expired_lease_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("tasks.json");
        let crashed = DaemonLease::for_catalog(&catalog, Duration::from_secs(45));
        let successor = DaemonLease::for_catalog(&catalog, Duration::from_secs(45));

        crashed.acquire_or_renew_at(at("2024-01-01T00:00:00Z")).unwrap();
        let record = successor
            .acquire_or_renew_at(at("2024-01-01T00:01:00Z"))
            .unwrap();
        assert_eq!(record.instance_id, successor.instance_id());
    }

    #[test]
    fn test_release_only_removes_own_lease() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("tasks.json");
        let holder = DaemonLease::for_catalog(&catalog, Duration::from_secs(45));
        let other = DaemonLease::for_catalog(&catalog, Duration::from_secs(45));

        holder.acquire_or_renew().unwrap();
        other.release().unwrap();
        assert!(holder.path().exists());

        holder.release().unwrap();
        assert!(!holder.path().exists());
        assert!(read_record(holder.path()).unwrap().is_none());
    }

    #[test]
    fn test_malformed_lease_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let lease = DaemonLease::for_catalog(&dir.path().join("tasks.json"), Duration::from_secs(45));
        std::fs::write(lease.path(), b"not json").unwrap();

        assert!(lease.acquire_or_renew().is_ok());
    }

    #[tokio::test]
    async fn test_async_heartbeat_and_surrender() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("tasks.json");
        let lease = DaemonLease::for_catalog(&catalog, Duration::from_secs(45));
        let rival = DaemonLease::for_catalog(&catalog, Duration::from_secs(45));

        let record = lease.heartbeat().await.unwrap();
        assert_eq!(record.instance_id, lease.instance_id());
        assert!(matches!(
            rival.heartbeat().await,
            Err(SchedulerError::LeaseHeld { .. })
        ));

        lease.surrender().await.unwrap();
        assert!(rival.heartbeat().await.is_ok());
    }
}
