//! Per-request capacity broker.
//!
//! The activator hands out short-lived leases against running sandboxes,
//! blocks callers until a sandbox is available, drives pools to scale up on
//! demand, and retires idle sandboxes. All of its state is in memory,
//! rebuilt from the store on startup; the store stays authoritative for
//! pools and sandboxes.
//!
//! Locking: one mutex over the four maps. No store RPC is ever issued while
//! holding it — long operations snapshot under the lock, act, and re-acquire
//! to publish.

mod capacity;
mod loops;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::entity::EntityId;
use crate::model::{
    kind, AppVersion, DecodeError, Sandbox, SandboxPool, SandboxStatus, ServiceConcurrency,
    DEFAULT_PORT,
};
use crate::store::{EntityStore, StoreError};
use crate::strategy::{SlotTracker, Strategy};

/// Errors surfaced by lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error(
        "no pool serves version {version} service {service}; pools are created by the deployment launcher"
    )]
    PoolNotFound { version: EntityId, service: String },

    #[error("pool {pool} is at its maximum size of {max}")]
    PoolMaxed { pool: EntityId, max: i64 },

    #[error("all candidate sandboxes for version {version} service {service} died before serving")]
    SandboxDiedEarly { version: EntityId, service: String },

    #[error("deadline exceeded waiting for a sandbox")]
    DeadlineExceeded,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An outstanding claim on one sandbox. In-memory only; leases die with the
/// process and recovery grants survivors a fresh grace period instead.
#[derive(Debug, Clone)]
pub struct Lease {
    pub version: EntityId,
    pub sandbox: EntityId,
    pub service: String,
    pub size: u32,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ActivatorConfig {
    /// Upper bound on any pool's desired instance count.
    pub max_pool_size: i64,
    pub retire_interval: Duration,
    pub fixed_check_interval: Duration,
    /// Bound on each retirement status write.
    pub retire_write_timeout: Duration,
}

impl Default for ActivatorConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 20,
            retire_interval: Duration::from_secs(20),
            fixed_check_interval: Duration::from_secs(30),
            retire_write_timeout: Duration::from_secs(5),
        }
    }
}

/// (version id, service name).
pub(crate) type Key = (EntityId, String);

pub(crate) struct TrackedSandbox {
    pub(crate) id: EntityId,
    /// Store revision under which the current status was observed.
    pub(crate) revision: u64,
    pub(crate) status: SandboxStatus,
    /// Empty until the sandbox is running with a usable address.
    pub(crate) url: String,
    pub(crate) last_renewal: Instant,
    pub(crate) tracker: SlotTracker,
}

/// Live view of one pool's sandboxes.
pub(crate) struct PoolEntry {
    pub(crate) key: Key,
    pub(crate) strategy: Strategy,
    pub(crate) sandboxes: Vec<TrackedSandbox>,
}

/// Which pool serves a (version, service), plus the decoded version.
pub(crate) struct VersionEntry {
    pub(crate) version: AppVersion,
    pub(crate) pool_id: EntityId,
    pub(crate) strategy: Strategy,
}

/// Cached pool state used for optimistic concurrency.
#[derive(Default)]
pub(crate) struct PoolCacheEntry {
    pub(crate) cached: Option<SandboxPool>,
    /// An increment is in flight; duplicate callers park on `done` and share
    /// its outcome through `cached` instead of doubling the write.
    pub(crate) in_progress: bool,
    pub(crate) done: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) versions: HashMap<Key, VersionEntry>,
    pub(crate) pool_sandboxes: HashMap<EntityId, PoolEntry>,
    pub(crate) pools: HashMap<Key, PoolCacheEntry>,
    pub(crate) waiters: HashMap<Key, Vec<oneshot::Sender<()>>>,
}

pub struct Activator {
    pub(crate) store: Arc<dyn EntityStore>,
    pub(crate) config: ActivatorConfig,
    pub(crate) state: Mutex<State>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Counters for one tracked pool, for status reporting.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub pool: EntityId,
    pub version: EntityId,
    pub service: String,
    pub desired_instances: Option<i64>,
    pub running: usize,
    pub starting: usize,
    pub terminal: usize,
    pub slots_used: u32,
    pub slots_max: u32,
}

enum Plan {
    Lease(Lease),
    Wait(oneshot::Receiver<()>),
    Demand,
    Dead,
}

impl Activator {
    /// Build an activator and rebuild its in-memory view from the store.
    pub async fn new(
        store: Arc<dyn EntityStore>,
        config: ActivatorConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let activator = Arc::new(Self {
            store,
            config,
            state: Mutex::new(State::default()),
            tasks: Mutex::new(Vec::new()),
        });
        activator.recover().await?;
        Ok(activator)
    }

    /// Start the background loops: sandbox watcher, retirement ticker,
    /// fixed-instance ticker.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Arc::clone(self).watch_sandboxes()));
        tasks.push(tokio::spawn(Arc::clone(self).retire_idle()));
        tasks.push(tokio::spawn(Arc::clone(self).keep_fixed_instances()));
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Rebuild the pool index and the serving set from the store.
    async fn recover(&self) -> anyhow::Result<()> {
        let pools = self.store.list(kind::SANDBOX_POOL).await?;
        for entity in &pools {
            let pool = match SandboxPool::decode(entity) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable pool");
                    continue;
                }
            };
            let Some(version_id) = pool.spec.version.clone() else {
                debug!(pool = %pool.id, "pool has no version reference");
                continue;
            };
            let service = pool.service.clone();
            let mut st = self.state.lock().unwrap();
            st.pools
                .entry((version_id, service))
                .or_default()
                .cached = Some(pool);
        }

        let mut recovered = 0usize;
        for entity in self.store.list(kind::SANDBOX).await? {
            let sandbox = match Sandbox::decode(&entity) {
                Ok(sandbox) => sandbox,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable sandbox");
                    continue;
                }
            };
            if sandbox.status != SandboxStatus::Running {
                debug!(sandbox = %sandbox.id, status = sandbox.status.as_str(), "not running, skipped");
                continue;
            }
            let Some(version_id) = sandbox.spec.version.clone() else {
                debug!(sandbox = %sandbox.id, "no version reference, skipped");
                continue;
            };
            let Some(pool_id) = sandbox.pool() else {
                debug!(sandbox = %sandbox.id, "no pool label, skipped");
                continue;
            };
            if sandbox.network.is_empty() {
                debug!(sandbox = %sandbox.id, "no addresses, skipped");
                continue;
            }
            let key = (version_id, sandbox.service().to_string());
            if let Err(e) = self.ensure_entries(&key, &pool_id).await {
                debug!(sandbox = %sandbox.id, error = %e, "version unavailable, skipped");
                continue;
            }
            if self.track_running(&key, &pool_id, &sandbox) {
                recovered += 1;
            }
        }
        info!(sandboxes = recovered, "activator recovery complete");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lease operations
    // -----------------------------------------------------------------------

    /// Acquire a lease on a running sandbox for (version, service), creating
    /// pool capacity on demand. Blocks until capacity exists; bound it with
    /// [`Self::acquire_lease_with_timeout`] or an outer timeout.
    pub async fn acquire_lease(
        &self,
        version: &EntityId,
        service: &str,
    ) -> Result<Lease, LeaseError> {
        let key: Key = (version.clone(), service.to_string());
        loop {
            let plan = {
                let mut st = self.state.lock().unwrap();
                self.plan_acquire(&mut st, &key)
            };
            match plan {
                Plan::Lease(lease) => {
                    debug!(sandbox = %lease.sandbox, size = lease.size, "lease acquired");
                    return Ok(lease);
                }
                Plan::Dead => {
                    return Err(LeaseError::SandboxDiedEarly {
                        version: key.0,
                        service: key.1,
                    });
                }
                Plan::Wait(rx) => {
                    // A dropped sender counts as a wakeup; the next plan pass
                    // sorts out what actually happened.
                    let _ = rx.await;
                }
                Plan::Demand => {
                    let pool = self.request_pool_capacity(&key).await?;
                    // A reused pool serves several versions; bind this one to
                    // it so the fast path and the waiter wakeups see it.
                    self.ensure_entries(&key, &pool.id).await?;
                    let wait = {
                        let mut st = self.state.lock().unwrap();
                        // The sandbox may have raced ahead of our registration.
                        match self.plan_acquire(&mut st, &key) {
                            Plan::Lease(lease) => return Ok(lease),
                            Plan::Dead => None,
                            Plan::Wait(rx) => Some(rx),
                            Plan::Demand => Some(Self::register_waiter(&mut st, &key)),
                        }
                    };
                    match wait {
                        Some(rx) => {
                            let _ = rx.await;
                        }
                        None => {
                            return Err(LeaseError::SandboxDiedEarly {
                                version: key.0,
                                service: key.1,
                            });
                        }
                    }
                }
            }
        }
    }

    /// [`Self::acquire_lease`] bounded by a deadline.
    pub async fn acquire_lease_with_timeout(
        &self,
        version: &EntityId,
        service: &str,
        timeout: Duration,
    ) -> Result<Lease, LeaseError> {
        tokio::time::timeout(timeout, self.acquire_lease(version, service))
            .await
            .map_err(|_| LeaseError::DeadlineExceeded)?
    }

    /// Return a lease's slots. Succeeds even when the sandbox died under the
    /// lease.
    pub fn release_lease(&self, lease: &Lease) {
        let mut st = self.state.lock().unwrap();
        let key: Key = (lease.version.clone(), lease.service.clone());
        let Some(ventry) = st.versions.get(&key) else {
            return;
        };
        let pool_id = ventry.pool_id.clone();
        let Some(pentry) = st.pool_sandboxes.get_mut(&pool_id) else {
            return;
        };
        if let Some(sb) = pentry.sandboxes.iter_mut().find(|s| s.id == lease.sandbox) {
            sb.tracker.release_lease(lease.size);
        }
    }

    /// Record activity on a leased sandbox. Never touches capacity, never
    /// blocks.
    pub fn renew_lease(&self, lease: &Lease) {
        let mut st = self.state.lock().unwrap();
        let key: Key = (lease.version.clone(), lease.service.clone());
        let Some(ventry) = st.versions.get(&key) else {
            return;
        };
        let pool_id = ventry.pool_id.clone();
        let Some(pentry) = st.pool_sandboxes.get_mut(&pool_id) else {
            return;
        };
        if let Some(sb) = pentry.sandboxes.iter_mut().find(|s| s.id == lease.sandbox) {
            sb.last_renewal = Instant::now();
        }
    }

    /// Per-pool counters for the status RPC.
    pub fn status(&self) -> Vec<PoolStatus> {
        let st = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (pool_id, pentry) in &st.pool_sandboxes {
            let desired = st
                .pools
                .get(&pentry.key)
                .and_then(|p| p.cached.as_ref())
                .map(|p| p.desired_instances);
            out.push(PoolStatus {
                pool: pool_id.clone(),
                version: pentry.key.0.clone(),
                service: pentry.key.1.clone(),
                desired_instances: desired,
                running: pentry
                    .sandboxes
                    .iter()
                    .filter(|s| s.status == SandboxStatus::Running)
                    .count(),
                starting: pentry
                    .sandboxes
                    .iter()
                    .filter(|s| s.status.is_starting())
                    .count(),
                terminal: pentry
                    .sandboxes
                    .iter()
                    .filter(|s| s.status.is_terminal())
                    .count(),
                slots_used: pentry.sandboxes.iter().map(|s| s.tracker.used()).sum(),
                slots_max: pentry.sandboxes.iter().map(|s| s.tracker.max()).sum(),
            });
        }
        out.sort_by(|a, b| a.pool.cmp(&b.pool));
        out
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn plan_acquire(&self, st: &mut State, key: &Key) -> Plan {
        enum Scan {
            Lease(Lease),
            Starting,
            AllDead,
            NoCapacity,
        }

        let pool_id = st.versions.get(key).map(|v| v.pool_id.clone());
        let pentry = match &pool_id {
            Some(id) => st.pool_sandboxes.get_mut(id),
            None => None,
        };
        let scan = match pentry {
            Some(pentry) => {
                // Fast path: any running sandbox with a free slot, scanned
                // from a random offset so load spreads.
                let n = pentry.sandboxes.len();
                let offset = if n > 0 {
                    rand::thread_rng().gen_range(0..n)
                } else {
                    0
                };
                let mut leased = None;
                for i in 0..n {
                    let sb = &mut pentry.sandboxes[(offset + i) % n];
                    if sb.status == SandboxStatus::Running
                        && !sb.url.is_empty()
                        && sb.tracker.has_capacity()
                    {
                        let size = sb.tracker.acquire_lease();
                        sb.last_renewal = Instant::now();
                        leased = Some(Lease {
                            version: key.0.clone(),
                            sandbox: sb.id.clone(),
                            service: key.1.clone(),
                            size,
                            url: sb.url.clone(),
                        });
                        break;
                    }
                }
                match leased {
                    Some(lease) => Scan::Lease(lease),
                    // A starting sandbox means capacity is already on the
                    // way; requesting more would over-provision the cold
                    // start.
                    None if pentry.sandboxes.iter().any(|s| s.status.is_starting()) => {
                        Scan::Starting
                    }
                    None if !pentry.sandboxes.is_empty()
                        && pentry.sandboxes.iter().all(|s| s.status.is_terminal()) =>
                    {
                        Scan::AllDead
                    }
                    None => Scan::NoCapacity,
                }
            }
            None => Scan::NoCapacity,
        };

        let in_progress = st.pools.get(key).is_some_and(|p| p.in_progress);
        match scan {
            Scan::Lease(lease) => Plan::Lease(lease),
            Scan::Starting => Plan::Wait(Self::register_waiter(st, key)),
            Scan::AllDead if in_progress => Plan::Wait(Self::register_waiter(st, key)),
            Scan::AllDead => Plan::Dead,
            Scan::NoCapacity if in_progress => Plan::Wait(Self::register_waiter(st, key)),
            Scan::NoCapacity => Plan::Demand,
        }
    }

    pub(crate) fn register_waiter(st: &mut State, key: &Key) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        st.waiters.entry(key.clone()).or_default().push(tx);
        rx
    }

    /// Wake everything blocked on (version, service). Called on any change to
    /// the key's serving set so blocked acquires re-evaluate promptly.
    pub(crate) fn signal_waiters(st: &mut State, key: &Key) {
        if let Some(waiters) = st.waiters.remove(key) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    /// Wake waiters on every (version, service) served by `pool_id`. A reused
    /// pool serves several versions; a sandbox event on it concerns them all.
    pub(crate) fn signal_pool_waiters(st: &mut State, pool_id: &EntityId, observed: &Key) {
        let mut keys: Vec<Key> = st
            .versions
            .iter()
            .filter(|(_, v)| v.pool_id == *pool_id)
            .map(|(k, _)| k.clone())
            .collect();
        if !keys.contains(observed) {
            keys.push(observed.clone());
        }
        for key in keys {
            Self::signal_waiters(st, &key);
        }
    }

    /// Make sure the version and pool entries for `key` exist, fetching and
    /// decoding the app version if needed.
    pub(crate) async fn ensure_entries(
        &self,
        key: &Key,
        pool_id: &EntityId,
    ) -> Result<(), LeaseError> {
        {
            let st = self.state.lock().unwrap();
            if st.versions.contains_key(key) && st.pool_sandboxes.contains_key(pool_id) {
                return Ok(());
            }
        }
        let entity = self.store.get(&key.0).await?;
        let version = AppVersion::decode(&entity)?;
        let strategy = strategy_for(&version, &key.1);

        let mut st = self.state.lock().unwrap();
        st.pool_sandboxes
            .entry(pool_id.clone())
            .or_insert_with(|| PoolEntry {
                key: key.clone(),
                strategy: strategy.clone(),
                sandboxes: Vec::new(),
            });
        st.versions.entry(key.clone()).or_insert(VersionEntry {
            version,
            pool_id: pool_id.clone(),
            strategy,
        });
        Ok(())
    }

    /// Add or refresh a running sandbox in its pool's serving set. Returns
    /// false when the sandbox is rejected (unusable address).
    pub(crate) fn track_running(&self, key: &Key, pool_id: &EntityId, sandbox: &Sandbox) -> bool {
        let mut st = self.state.lock().unwrap();
        let port = st
            .versions
            .get(key)
            .map(|v| v.version.config.port())
            .unwrap_or(DEFAULT_PORT);
        let Some(url) = sandbox.network.first().and_then(|a| sandbox_url(a, port)) else {
            warn!(sandbox = %sandbox.id, "rejecting sandbox with unusable address");
            return false;
        };
        let Some(pentry) = st.pool_sandboxes.get_mut(pool_id) else {
            return false;
        };
        match pentry.sandboxes.iter_mut().find(|s| s.id == sandbox.id) {
            Some(sb) => {
                sb.status = SandboxStatus::Running;
                sb.revision = sandbox.revision;
                sb.url = url;
            }
            None => {
                let tracker = pentry.strategy.new_tracker();
                pentry.sandboxes.push(TrackedSandbox {
                    id: sandbox.id.clone(),
                    revision: sandbox.revision,
                    status: SandboxStatus::Running,
                    url,
                    last_renewal: Instant::now(),
                    tracker,
                });
            }
        }
        Self::signal_pool_waiters(&mut st, pool_id, key);
        true
    }
}

/// Strategy for a version's service, or the auto default when the service is
/// not declared.
pub(crate) fn strategy_for(version: &AppVersion, service: &str) -> Strategy {
    version
        .service(service)
        .map(|s| Strategy::for_service(&s.concurrency))
        .unwrap_or_else(|| Strategy::for_service(&ServiceConcurrency::default()))
}

/// Reachable URL for a sandbox address. Accepts a bare IP or an IP-CIDR
/// prefix; anything else rejects the sandbox. IPv6 hosts are bracketed.
pub fn sandbox_url(addr: &str, port: u16) -> Option<String> {
    let host = addr.split_once('/').map(|(ip, _)| ip).unwrap_or(addr);
    match host.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(format!("http://{}:{}", v4, port)),
        IpAddr::V6(v6) => Some(format!("http://[{}]:{}", v6, port)),
    }
}
