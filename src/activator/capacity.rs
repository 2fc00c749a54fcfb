//! Pool capacity increments under optimistic concurrency.
//!
//! The single most delicate algorithm here. The pool's `desiredInstances` is
//! bumped by exactly one per demand, with full tolerance for concurrent
//! writers: in-process duplicates collapse onto one in-flight increment, and
//! cross-process races resolve through revision conflicts — a loser that
//! refreshes to a pool already at or past its target treats the demand as
//! satisfied instead of stacking another increment on top.

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Activator, Key, LeaseError};
use crate::entity::Attr;
use crate::model::{kind, SandboxPool};
use crate::store::StoreError;

impl Activator {
    /// Raise the pool serving `key` by one desired instance.
    ///
    /// The activator never creates pools; a missing pool is the launcher's
    /// business and is surfaced as [`LeaseError::PoolNotFound`].
    pub(crate) async fn request_pool_capacity(&self, key: &Key) -> Result<SandboxPool, LeaseError> {
        // Singleflight per (pool, process): one task drives the store dance,
        // duplicates park until it finishes and read the shared cache.
        let cached = loop {
            enum Claim {
                Drive(Option<SandboxPool>),
                Park(oneshot::Receiver<()>),
            }
            let claim = {
                let mut st = self.state.lock().unwrap();
                let entry = st.pools.entry(key.clone()).or_default();
                if entry.in_progress {
                    let (tx, rx) = oneshot::channel();
                    entry.done.push(tx);
                    Claim::Park(rx)
                } else {
                    entry.in_progress = true;
                    Claim::Drive(entry.cached.clone())
                }
            };
            match claim {
                Claim::Drive(cached) => break cached,
                Claim::Park(rx) => {
                    let _ = rx.await;
                    let shared = {
                        let st = self.state.lock().unwrap();
                        st.pools.get(key).and_then(|e| e.cached.clone())
                    };
                    match shared {
                        Some(pool) => return Ok(pool),
                        // The driver failed and dropped the cache; take our
                        // own turn at the increment.
                        None => continue,
                    }
                }
            }
        };

        let result = self.drive_increment(key, cached).await;

        let parked = {
            let mut st = self.state.lock().unwrap();
            match st.pools.get_mut(key) {
                Some(entry) => {
                    entry.in_progress = false;
                    std::mem::take(&mut entry.done)
                }
                None => Vec::new(),
            }
        };
        for tx in parked {
            let _ = tx.send(());
        }

        if result.is_err() {
            // Lease waiters parked behind this increment would otherwise
            // sleep to their deadlines; wake them so the failure surfaces.
            let mut st = self.state.lock().unwrap();
            Self::signal_waiters(&mut st, key);
        }
        result
    }

    async fn drive_increment(
        &self,
        key: &Key,
        cached: Option<SandboxPool>,
    ) -> Result<SandboxPool, LeaseError> {
        let mut pool = match cached {
            Some(pool) => pool,
            None => self.find_pool(key).await?,
        };

        // At the cap, the cache may simply be stale; confirm against the
        // store before refusing.
        if pool.desired_instances >= self.config.max_pool_size {
            match self.refresh_pool(&pool).await {
                Ok(fresh) => {
                    self.cache_pool(key, fresh.clone());
                    if fresh.desired_instances >= self.config.max_pool_size {
                        warn!(pool = %fresh.id, desired = fresh.desired_instances, "pool at max size");
                        return Err(LeaseError::PoolMaxed {
                            pool: fresh.id,
                            max: self.config.max_pool_size,
                        });
                    }
                    pool = fresh;
                }
                Err(e) if e.is_not_found() => {
                    self.clear_cached_pool(key);
                    return Err(self.pool_not_found(key));
                }
                Err(e) => return Err(e.into()),
            }
        }

        // One increment per call: the target never moves, even across
        // conflict retries. Recomputing it would turn every lost race into
        // an extra instance.
        let target = pool.desired_instances + 1;

        loop {
            let write = self
                .store
                .patch(
                    &pool.id,
                    vec![Attr::int("desiredInstances", target)],
                    pool.revision,
                )
                .await;
            match write {
                Ok(revision) => {
                    pool.desired_instances = target;
                    pool.revision = revision;
                    self.cache_pool(key, pool.clone());
                    debug!(pool = %pool.id, desired = target, "pool capacity incremented");
                    return Ok(pool);
                }
                Err(StoreError::RevisionConflict { .. }) => match self.refresh_pool(&pool).await {
                    Ok(fresh) => {
                        self.cache_pool(key, fresh.clone());
                        if fresh.desired_instances >= target {
                            // A concurrent writer already met our demand.
                            debug!(pool = %fresh.id, desired = fresh.desired_instances, "increment satisfied by peer");
                            return Ok(fresh);
                        }
                        pool = fresh;
                    }
                    Err(e) if e.is_not_found() => {
                        self.clear_cached_pool(key);
                        return Err(self.pool_not_found(key));
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(e) if e.is_not_found() => {
                    self.clear_cached_pool(key);
                    return Err(self.pool_not_found(key));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Store lookup for the pool serving (version, service): either the pool
    /// built for the version, or one the version reuses.
    async fn find_pool(&self, key: &Key) -> Result<SandboxPool, LeaseError> {
        let entities = self.store.list(kind::SANDBOX_POOL).await?;
        for entity in &entities {
            let Ok(pool) = SandboxPool::decode(entity) else {
                continue;
            };
            if pool.service != key.1 {
                continue;
            }
            if pool.spec.version.as_ref() == Some(&key.0) || pool.references_version(&key.0) {
                return Ok(pool);
            }
        }
        Err(self.pool_not_found(key))
    }

    async fn refresh_pool(&self, pool: &SandboxPool) -> Result<SandboxPool, StoreError> {
        let entity = self.store.get(&pool.id).await?;
        SandboxPool::decode(&entity).map_err(|e| StoreError::Transient(e.to_string()))
    }

    fn cache_pool(&self, key: &Key, pool: SandboxPool) {
        let mut st = self.state.lock().unwrap();
        st.pools.entry(key.clone()).or_default().cached = Some(pool);
    }

    fn clear_cached_pool(&self, key: &Key) {
        let mut st = self.state.lock().unwrap();
        if let Some(entry) = st.pools.get_mut(key) {
            entry.cached = None;
        }
    }

    fn pool_not_found(&self, key: &Key) -> LeaseError {
        LeaseError::PoolNotFound {
            version: key.0.clone(),
            service: key.1.clone(),
        }
    }
}
