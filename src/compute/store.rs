// Shared on-disk store of deployed services
//
// Every process that opens the same state directory sees the same
// `services.json`. Writers hold an advisory lock on `services.lock` for the
// whole read-modify-write; readers rely on the atomic rename of the file.

use super::model::TrainedModel;
use crate::error::{ChurnlineError, Result};
use crate::types::DeploymentKey;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// File inside the state directory holding deployed services.
pub const SERVICES_FILE: &str = "services.json";

/// Advisory lock file guarding writes to [`SERVICES_FILE`].
pub const LOCK_FILE: &str = "services.lock";

/// Claim on the running slot of a service.
///
/// Only the registry instance named by `holder` may run an endpoint for the
/// key. Holders renew the lease while serving; a lease older than the
/// registry's TTL can be taken over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Registry instance holding the slot
    pub holder: Uuid,
    /// Process id of the holder
    pub pid: u32,
    /// Where the holder serves requests, if it runs a prediction server
    pub address: Option<String>,
    /// Last renewal
    pub renewed_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.renewed_at);
        age.to_std().map_or(true, |age| age < ttl)
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.pid)?;
        if let Some(address) = &self.address {
            write!(f, " at {}", address)?;
        }
        Ok(())
    }
}

/// On-disk form of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredService {
    pub key: DeploymentKey,
    pub version: u32,
    pub deployed_at: DateTime<Utc>,
    pub workers: usize,
    pub model: TrainedModel,
    #[serde(default)]
    pub lease: Option<Lease>,
}

/// Snapshot of `services.json`, keyed by deployment key.
pub type ServiceMap = HashMap<DeploymentKey, StoredService>;

/// Exclusive hold on the store. Dropping it releases the lock.
pub struct StoreGuard {
    file: File,
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "Failed to release services lock");
        }
    }
}

/// Services file plus its lock, rooted at a state directory.
#[derive(Debug, Clone)]
pub struct ServiceStore {
    dir: PathBuf,
}

impl ServiceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SERVICES_FILE)
    }

    /// Blocks until the store lock is held.
    pub fn lock(&self) -> Result<StoreGuard> {
        let file = self.open_lock_file()?;
        file.lock_exclusive()?;
        Ok(StoreGuard { file })
    }

    /// Takes the store lock if nobody else holds it.
    pub fn try_lock(&self) -> Result<Option<StoreGuard>> {
        let file = self.open_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(StoreGuard { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads every stored service. A missing file is an empty store.
    pub fn load(&self) -> Result<ServiceMap> {
        let path = self.path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ServiceMap::new()),
            Err(e) => return Err(e.into()),
        };

        let services: Vec<StoredService> = serde_json::from_slice(&bytes).map_err(|e| {
            error!(path = %path.display(), error = %e, "Unreadable services file");
            ChurnlineError::Serialization(format!("{}: {}", path.display(), e))
        })?;
        Ok(services.into_iter().map(|s| (s.key.clone(), s)).collect())
    }

    /// Replaces the services file. Callers hold the lock.
    pub fn save(&self, _guard: &StoreGuard, services: &ServiceMap) -> Result<()> {
        let mut stored: Vec<&StoredService> = services.values().collect();
        stored.sort_by(|a, b| a.key.cmp(&b.key));

        let path = self.path();
        let tmp = self.dir.join(format!("{}.tmp", SERVICES_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&stored)?)?;
        std::fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), services = stored.len(), "Persisted services");
        Ok(())
    }

    /// Async form of [`lock`](Self::lock); waits on the blocking pool.
    pub async fn lock_async(&self) -> Result<StoreGuard> {
        let store = self.clone();
        blocking(move || store.lock()).await
    }

    /// Async form of [`load`](Self::load).
    pub async fn load_async(&self) -> Result<ServiceMap> {
        let store = self.clone();
        blocking(move || store.load()).await
    }

    /// Async form of [`save`](Self::save). Returns the guard once written.
    pub async fn save_async(&self, guard: StoreGuard, services: ServiceMap) -> Result<StoreGuard> {
        let store = self.clone();
        blocking(move || {
            store.save(&guard, &services)?;
            Ok(guard)
        })
        .await
    }

    fn open_lock_file(&self) -> Result<File> {
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        Ok(file)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChurnlineError::Internal(format!("store task failed: {}", e)))?
}
