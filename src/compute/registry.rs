// Service registry for deployed prediction endpoints
//
// With a state directory the registry is a view over the shared service
// store: every lifecycle change is a locked read-modify-write of
// `services.json`, and each call re-reads the store before acting on a key.
// The running slot of a key is a lease naming one registry instance; a
// registry whose lease is gone stops its endpoint the next time it looks.

use super::model::TrainedModel;
use super::serving::{EndpointConfig, EndpointState, ModelEndpoint};
use super::store::{Lease, ServiceMap, ServiceStore, StoreGuard, StoredService};
use crate::error::{ChurnlineError, Result};
use crate::resilience::{poll_until, BackoffPolicy, PollOutcome, Probe};
use crate::types::DeploymentKey;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Where `services.json` lives. None keeps services in memory only.
    pub state_dir: Option<PathBuf>,
    /// Warm-up applied to every endpoint the registry creates
    pub warmup: Duration,
    /// Health polling while an endpoint starts
    pub backoff: BackoffPolicy,
    /// How long a running slot stays claimed without renewal
    pub lease_ttl: Duration,
    /// Address recorded in the leases this registry takes
    pub address: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            warmup: Duration::ZERO,
            backoff: BackoffPolicy::default(),
            lease_ttl: Duration::from_secs(30),
            address: None,
        }
    }
}

/// Settings for a single deployment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeployOptions {
    /// Concurrent prediction workers
    pub workers: usize,
    /// How long to wait for the new endpoint to become healthy
    pub timeout: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            timeout: Duration::from_secs(60),
        }
    }
}

/// What a deploy call did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DeployOutcome {
    /// A new endpoint replaced whatever was serving before
    Deployed { version: u32 },
    /// The trigger rejected the model; the existing service is untouched
    Skipped,
}

/// A deployed service
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Service identity
    pub key: DeploymentKey,
    /// Incremented on every deployment under this key
    pub version: u32,
    /// Whether this registry's endpoint was started and reported healthy
    pub running: bool,
    /// When this version was deployed
    pub deployed_at: DateTime<Utc>,
    /// Claim on the running slot, as last read from the store
    pub lease: Option<Lease>,
    /// Endpoint handle
    pub endpoint: Arc<ModelEndpoint>,
}

/// Point-in-time view of a service, as printed by `churnline status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub key: DeploymentKey,
    pub version: u32,
    pub running: bool,
    /// Live claim on the running slot, possibly held by another process
    pub served_by: Option<Lease>,
    pub deployed_at: DateTime<Utc>,
    pub model: String,
    pub workers: usize,
    pub predictions_served: u64,
}

/// Registry statistics
#[derive(Default)]
pub struct RegistryStats {
    /// Deploy calls that replaced a service
    pub deployments: AtomicU64,
    /// Deploy calls rejected by the trigger
    pub skipped: AtomicU64,
    /// Successful starts
    pub starts: AtomicU64,
    /// Starts that timed out or failed
    pub start_failures: AtomicU64,
    /// Stops
    pub stops: AtomicU64,
    /// Endpoints stopped because another registry took the running slot
    pub evictions: AtomicU64,
}

/// Statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatsSnapshot {
    pub deployments: u64,
    pub skipped: u64,
    pub starts: u64,
    pub start_failures: u64,
    pub stops: u64,
    pub evictions: u64,
}

/// Store lock together with the snapshot read under it
struct Held {
    guard: StoreGuard,
    services: ServiceMap,
}

/// Holds at most one service per deployment key.
///
/// `deploy`, `start` and `stop` on the same key are serialized, within the
/// process by a per-key lock and across processes by the store lock.
pub struct ServiceRegistry {
    /// Configuration
    config: RegistryConfig,
    /// Shared store, when a state directory is configured
    store: Option<ServiceStore>,
    /// Identity written into leases
    instance: Uuid,
    /// Services by key
    services: Arc<RwLock<HashMap<DeploymentKey, ServiceRecord>>>,
    /// Per-key operation locks
    locks: parking_lot::Mutex<HashMap<DeploymentKey, Arc<Mutex<()>>>>,
    /// Statistics
    stats: Arc<RegistryStats>,
}

impl ServiceRegistry {
    /// Creates a registry. Services in the state directory are read lazily.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            store: config.state_dir.clone().map(ServiceStore::new),
            config,
            instance: Uuid::new_v4(),
            services: Arc::new(RwLock::new(HashMap::new())),
            locks: parking_lot::Mutex::new(HashMap::new()),
            stats: Arc::new(RegistryStats::default()),
        }
    }

    /// Creates a registry and loads the services saved in the state directory.
    ///
    /// Loaded services are stopped in this registry; start them before predicting.
    pub fn open(config: RegistryConfig) -> Result<Self> {
        let mut registry = Self::new(config);

        if let Some(store) = registry.store.clone() {
            let stored = store.load()?;
            let mut services = HashMap::with_capacity(stored.len());
            for service in stored.values() {
                let record = record_from_stored(&registry.config, service)?;
                services.insert(service.key.clone(), record);
            }
            info!(
                path = %store.path().display(),
                services = services.len(),
                "Loaded deployed services"
            );
            registry.services = Arc::new(RwLock::new(services));
        }

        Ok(registry)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Identity this registry writes into the leases it takes
    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    fn key_lock(&self, key: &DeploymentKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Returns the service under `key`. With `running` set, only a service
    /// whose endpoint runs in this registry matches; otherwise the service is
    /// returned whatever its state.
    pub async fn find(&self, key: &DeploymentKey, running: bool) -> Option<ServiceRecord> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if let Err(e) = self.refresh(key).await {
            warn!(key = %key, error = %e, "Could not refresh service from state directory");
        }

        let services = self.services.read().await;
        services.get(key).filter(|r| r.running || !running).cloned()
    }

    /// Like [`find`](Self::find), but a missing service is an error.
    pub async fn lookup(&self, key: &DeploymentKey, running: bool) -> Result<ServiceRecord> {
        match self.find(key, running).await {
            Some(record) => Ok(record),
            None => {
                error!(key = %key, running, "No prediction service found");
                Err(ChurnlineError::ServiceNotFound(key.to_string()))
            }
        }
    }

    /// Replaces the service under `key` with an endpoint serving `model`.
    ///
    /// With `decision == false` nothing changes. Otherwise the new version is
    /// written to the store first; only then is the existing endpoint stopped
    /// and the new one started, so at most one endpoint per key is ever
    /// running. If the new endpoint does not become healthy within
    /// `options.timeout` it stays registered but stopped.
    pub async fn deploy(
        &self,
        decision: bool,
        model: TrainedModel,
        key: &DeploymentKey,
        options: DeployOptions,
    ) -> Result<DeployOutcome> {
        if !decision {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            info!(key = %key, "Deployment trigger rejected model; keeping current service");
            return Ok(DeployOutcome::Skipped);
        }

        let endpoint = ModelEndpoint::new(
            key.clone(),
            model,
            EndpointConfig {
                workers: options.workers,
                warmup: self.config.warmup,
            },
        )?;

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let mut held = self.hold().await?;

        let local_version = self.services.read().await.get(key).map(|r| r.version);
        let stored_version = held
            .as_ref()
            .and_then(|h| h.services.get(key))
            .map(|s| s.version);
        let version = local_version.max(stored_version).map_or(1, |v| v + 1);
        let deployed_at = Utc::now();

        if let Some(mut h) = held.take() {
            let previous = h.services.get(key).and_then(|s| s.lease.as_ref());
            if let Some(lease) = previous.filter(|l| l.holder != self.instance) {
                info!(
                    key = %key,
                    holder = %lease,
                    "Taking over running slot from another registry"
                );
            }
            h.services.insert(
                key.clone(),
                StoredService {
                    key: key.clone(),
                    version,
                    deployed_at,
                    workers: options.workers,
                    model: (*endpoint.model()).clone(),
                    lease: None,
                },
            );
            held = Some(self.commit(h).await?);
        }

        {
            let mut services = self.services.write().await;
            let replaced = services.insert(
                key.clone(),
                ServiceRecord {
                    key: key.clone(),
                    version,
                    running: false,
                    deployed_at,
                    lease: None,
                    endpoint: Arc::new(endpoint),
                },
            );
            if let Some(previous) = replaced {
                info!(
                    key = %key,
                    version = previous.version,
                    "Stopping previous prediction service"
                );
                previous.endpoint.stop().await;
            }
            self.update_running_gauge(&services);
        }

        self.stats.deployments.fetch_add(1, Ordering::Relaxed);
        counter!("churnline_deployments_total").increment(1);
        info!(key = %key, version, workers = options.workers, "Deployed prediction service");

        self.start_held(key, options.timeout, held).await?;
        Ok(DeployOutcome::Deployed { version })
    }

    /// Starts the service behind `record` and waits for it to become healthy.
    ///
    /// Fails with `ServiceBusy` while another registry holds a live lease on
    /// the running slot.
    pub async fn start(&self, record: &ServiceRecord, timeout: Duration) -> Result<ServiceRecord> {
        let lock = self.key_lock(&record.key);
        let _guard = lock.lock().await;
        let held = self.hold().await?;
        self.start_held(&record.key, timeout, held).await
    }

    async fn start_held(
        &self,
        key: &DeploymentKey,
        timeout: Duration,
        held: Option<Held>,
    ) -> Result<ServiceRecord> {
        if let Some(h) = &held {
            let stored = h.services.get(key);
            self.reconcile(key, stored).await?;

            if let Some(lease) = stored.and_then(|s| s.lease.as_ref()) {
                let live = lease.is_live(self.config.lease_ttl, Utc::now());
                if lease.holder != self.instance && live {
                    warn!(key = %key, holder = %lease, "Running slot held by another registry");
                    return Err(ChurnlineError::ServiceBusy {
                        key: key.to_string(),
                        holder: lease.to_string(),
                    });
                }
            }
        }

        let record = self
            .services
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ChurnlineError::ServiceNotFound(key.to_string()))?;

        if record.running && record.endpoint.is_running().await {
            debug!(key = %key, "Prediction service already running");
            return Ok(record);
        }

        record.endpoint.start().await?;

        let endpoint = Arc::clone(&record.endpoint);
        let outcome = poll_until(timeout, &self.config.backoff, || {
            let endpoint = Arc::clone(&endpoint);
            async move {
                match endpoint.state().await {
                    EndpointState::Running => Probe::Ready,
                    EndpointState::Failed(reason) => Probe::Failed(reason),
                    EndpointState::Starting | EndpointState::Stopped => Probe::Pending,
                }
            }
        })
        .await;

        match outcome {
            PollOutcome::Ready { attempts } => {
                let lease = match held {
                    Some(h) => match self.claim(key, h).await {
                        Ok(lease) => lease,
                        Err(e) => {
                            record.endpoint.stop().await;
                            self.stats.start_failures.fetch_add(1, Ordering::Relaxed);
                            error!(key = %key, error = %e, "Could not record running slot");
                            return Err(e);
                        }
                    },
                    None => None,
                };

                let mut services = self.services.write().await;
                let current = services
                    .get_mut(key)
                    .ok_or_else(|| ChurnlineError::ServiceNotFound(key.to_string()))?;
                current.running = true;
                current.lease = lease;
                let started = current.clone();
                self.update_running_gauge(&services);

                self.stats.starts.fetch_add(1, Ordering::Relaxed);
                info!(
                    key = %key,
                    version = started.version,
                    attempts,
                    "Prediction service healthy"
                );
                Ok(started)
            }
            PollOutcome::TimedOut { attempts } => {
                record.endpoint.stop().await;
                self.stats.start_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    key = %key,
                    attempts,
                    timeout_ms = timeout.as_millis() as u64,
                    "Prediction service did not become healthy"
                );
                Err(ChurnlineError::ServiceStartTimeout {
                    key: key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            PollOutcome::Failed { reason } => {
                record.endpoint.stop().await;
                self.stats.start_failures.fetch_add(1, Ordering::Relaxed);
                error!(key = %key, reason = %reason, "Prediction service failed to start");
                Err(ChurnlineError::ServiceStartTimeout {
                    key: key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Writes this registry's lease on `key` into the store.
    async fn claim(&self, key: &DeploymentKey, mut held: Held) -> Result<Option<Lease>> {
        let Some(stored) = held.services.get_mut(key) else {
            return Ok(None);
        };
        let lease = Lease {
            holder: self.instance,
            pid: std::process::id(),
            address: self.config.address.clone(),
            renewed_at: Utc::now(),
        };
        stored.lease = Some(lease.clone());
        self.commit(held).await?;
        Ok(Some(lease))
    }

    /// Stops the service under `key` and clears its running slot, whichever
    /// registry holds it. Returns the lease that was cleared.
    ///
    /// A registry that loses its lease this way stops its endpoint on its
    /// next call for the key or its next [`renew_leases`](Self::renew_leases).
    pub async fn stop(&self, key: &DeploymentKey) -> Result<Option<Lease>> {
        self.stop_key(key, true).await
    }

    async fn stop_key(&self, key: &DeploymentKey, revoke_others: bool) -> Result<Option<Lease>> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut cleared = None;
        if let Some(mut h) = self.hold().await? {
            self.reconcile(key, h.services.get(key)).await?;
            if let Some(stored) = h.services.get_mut(key) {
                let clear = stored
                    .lease
                    .as_ref()
                    .is_some_and(|l| revoke_others || l.holder == self.instance);
                if clear {
                    cleared = stored.lease.take();
                }
            }
            if cleared.is_some() {
                self.commit(h).await?;
            }
        }

        let mut services = self.services.write().await;
        let record = services.get_mut(key).ok_or_else(|| {
            warn!(key = %key, "Stop requested for unknown service");
            ChurnlineError::ServiceNotFound(key.to_string())
        })?;

        record.endpoint.stop().await;
        record.running = false;
        record.lease = None;
        self.update_running_gauge(&services);
        self.stats.stops.fetch_add(1, Ordering::Relaxed);

        match &cleared {
            Some(lease) if lease.holder != self.instance => {
                info!(key = %key, holder = %lease, "Revoked running slot held by another registry");
            }
            _ => info!(key = %key, "Stopped prediction service"),
        }
        Ok(cleared)
    }

    /// Stops every endpoint this registry runs and gives up its running slots.
    pub async fn shutdown(&self) -> Result<()> {
        let running: Vec<DeploymentKey> = self
            .services
            .read()
            .await
            .values()
            .filter(|r| r.running)
            .map(|r| r.key.clone())
            .collect();

        for key in running {
            self.stop_key(&key, false).await?;
        }
        Ok(())
    }

    /// Renews the leases of endpoints running here and stops the endpoints
    /// whose slot was taken or revoked. Serving processes call this on a timer.
    pub async fn renew_leases(&self) -> Result<()> {
        let Some(mut held) = self.hold().await? else {
            return Ok(());
        };

        let running: Vec<DeploymentKey> = self
            .services
            .read()
            .await
            .values()
            .filter(|r| r.running)
            .map(|r| r.key.clone())
            .collect();

        let now = Utc::now();
        let mut changed = 0;
        for (key, stored) in held.services.iter_mut() {
            if !stored.lease.as_ref().is_some_and(|l| l.holder == self.instance) {
                continue;
            }
            match stored.lease.as_mut() {
                Some(lease) if running.contains(key) => lease.renewed_at = now,
                _ => stored.lease = None,
            }
            changed += 1;
        }

        let keys: Vec<DeploymentKey> = held.services.keys().cloned().collect();
        for key in &keys {
            self.reconcile(key, held.services.get(key)).await?;
        }

        if changed > 0 {
            self.commit(held).await?;
        }
        debug!(leases = changed, "Renewed running slots");
        Ok(())
    }

    /// Summaries of every registered service, ordered by key.
    pub async fn list(&self) -> Vec<ServiceSummary> {
        if let Some(store) = &self.store {
            match store.load_async().await {
                Ok(stored) => {
                    for (key, service) in &stored {
                        if let Err(e) = self.reconcile(key, Some(service)).await {
                            warn!(key = %key, error = %e, "Could not refresh service");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Could not read state directory"),
            }
        }

        let now = Utc::now();
        let services = self.services.read().await;
        let mut summaries: Vec<ServiceSummary> = services
            .values()
            .map(|r| ServiceSummary {
                key: r.key.clone(),
                version: r.version,
                running: r.running,
                served_by: r
                    .lease
                    .clone()
                    .filter(|l| l.is_live(self.config.lease_ttl, now)),
                deployed_at: r.deployed_at,
                model: r.endpoint.model().kind.name().to_string(),
                workers: r.endpoint.config().workers,
                predictions_served: r.endpoint.predictions_served(),
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Gets statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            deployments: self.stats.deployments.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            starts: self.stats.starts.load(Ordering::Relaxed),
            start_failures: self.stats.start_failures.load(Ordering::Relaxed),
            stops: self.stats.stops.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Takes the store lock and reads the services under it.
    async fn hold(&self) -> Result<Option<Held>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let guard = store.lock_async().await?;
        let services = store.load_async().await?;
        Ok(Some(Held { guard, services }))
    }

    /// Writes the held snapshot back; the lock stays held.
    async fn commit(&self, held: Held) -> Result<Held> {
        let Some(store) = &self.store else {
            return Ok(held);
        };
        let Held { guard, services } = held;
        let guard = store.save_async(guard, services.clone()).await?;
        Ok(Held { guard, services })
    }

    /// Re-reads `key` from the store, if there is one.
    async fn refresh(&self, key: &DeploymentKey) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let stored = store.load_async().await?;
        self.reconcile(key, stored.get(key)).await
    }

    /// Brings the local record for `key` in line with its stored form.
    async fn reconcile(&self, key: &DeploymentKey, stored: Option<&StoredService>) -> Result<()> {
        let Some(stored) = stored else {
            return Ok(());
        };

        let mut services = self.services.write().await;
        match services.get_mut(key) {
            Some(local)
                if local.version == stored.version && local.deployed_at == stored.deployed_at =>
            {
                local.lease = stored.lease.clone();
                let holds_slot = stored
                    .lease
                    .as_ref()
                    .is_some_and(|l| l.holder == self.instance);
                if local.running && !holds_slot {
                    warn!(
                        key = %key,
                        version = local.version,
                        "Running slot lost; stopping endpoint"
                    );
                    local.endpoint.stop().await;
                    local.running = false;
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                let record = record_from_stored(&self.config, stored)?;
                info!(
                    key = %key,
                    version = record.version,
                    "Loaded service version from state directory"
                );
                if let Some(previous) = services.insert(key.clone(), record) {
                    if previous.running {
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    previous.endpoint.stop().await;
                }
            }
        }
        self.update_running_gauge(&services);
        Ok(())
    }

    fn update_running_gauge(&self, services: &HashMap<DeploymentKey, ServiceRecord>) {
        let running = services.values().filter(|r| r.running).count();
        gauge!("churnline_services_running").set(running as f64);
    }
}

fn record_from_stored(config: &RegistryConfig, stored: &StoredService) -> Result<ServiceRecord> {
    let endpoint = ModelEndpoint::new(
        stored.key.clone(),
        stored.model.clone(),
        EndpointConfig {
            workers: stored.workers,
            warmup: config.warmup,
        },
    )?;
    Ok(ServiceRecord {
        key: stored.key.clone(),
        version: stored.version,
        running: false,
        deployed_at: stored.deployed_at,
        lease: stored.lease.clone(),
        endpoint: Arc::new(endpoint),
    })
}
