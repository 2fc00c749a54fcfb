//! Background loops.
//!
//! Three tasks run for the activator's lifetime: the sandbox watcher feeding
//! the serving set, the retirement ticker stopping idle auto-mode sandboxes,
//! and the fixed-instance ticker topping up always-on services.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Activator, Key, TrackedSandbox};
use crate::entity::{Attr, EntityId};
use crate::model::{kind, Sandbox, SandboxStatus};
use crate::reconciler::WATCH_RESTART_BACKOFF;
use crate::store::{WatchEvent, WatchOp};

impl Activator {
    pub(crate) async fn watch_sandboxes(self: Arc<Self>) {
        loop {
            match self.store.watch_index(kind::SANDBOX).await {
                Ok(mut watch) => {
                    // Refresh the serving set once per subscription: running
                    // sandboxes that changed while no watch was open would
                    // otherwise be invisible until their next write.
                    match self.store.list(kind::SANDBOX).await {
                        Ok(entities) => {
                            for entity in entities {
                                let Ok(sandbox) = Sandbox::decode(&entity) else {
                                    continue;
                                };
                                if sandbox.status == SandboxStatus::Running {
                                    self.observe_sandbox(sandbox).await;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "sandbox list failed"),
                    }
                    while let Some(event) = watch.recv().await {
                        self.handle_sandbox_event(event).await;
                    }
                    warn!("sandbox watch ended, restarting");
                }
                Err(e) => {
                    warn!(error = %e, "sandbox watch failed, restarting");
                }
            }
            tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
        }
    }

    pub(crate) async fn handle_sandbox_event(&self, event: WatchEvent) {
        match event.op {
            WatchOp::Delete => self.forget_sandbox(&event.id),
            WatchOp::Create | WatchOp::Update => {
                let Some(entity) = event.entity else {
                    return;
                };
                let sandbox = match Sandbox::decode(&entity) {
                    Ok(sandbox) => sandbox,
                    Err(e) => {
                        warn!(error = %e, "skipping undecodable sandbox");
                        return;
                    }
                };
                self.observe_sandbox(sandbox).await;
            }
        }
    }

    async fn observe_sandbox(&self, sandbox: Sandbox) {
        let Some(pool_id) = sandbox.pool() else {
            debug!(sandbox = %sandbox.id, "no pool label, ignored");
            return;
        };
        let Some(version_id) = sandbox.spec.version.clone() else {
            debug!(sandbox = %sandbox.id, "no version reference, ignored");
            return;
        };
        let key: Key = (version_id, sandbox.service().to_string());
        if let Err(e) = self.ensure_entries(&key, &pool_id).await {
            debug!(sandbox = %sandbox.id, error = %e, "version unavailable, ignored");
            return;
        }

        match sandbox.status {
            SandboxStatus::Running => {
                self.track_running(&key, &pool_id, &sandbox);
            }
            status if status.is_starting() => {
                // Starting sandboxes are tracked (acquires wait on them) but
                // serving capacity is unchanged, so nobody is woken.
                let mut st = self.state.lock().unwrap();
                let Some(pentry) = st.pool_sandboxes.get_mut(&pool_id) else {
                    return;
                };
                match pentry.sandboxes.iter_mut().find(|s| s.id == sandbox.id) {
                    Some(sb) => {
                        sb.status = status;
                        sb.revision = sandbox.revision;
                    }
                    None => {
                        let tracker = pentry.strategy.new_tracker();
                        pentry.sandboxes.push(TrackedSandbox {
                            id: sandbox.id.clone(),
                            revision: sandbox.revision,
                            status,
                            url: String::new(),
                            last_renewal: std::time::Instant::now(),
                            tracker,
                        });
                    }
                }
            }
            status => {
                // Terminal. Keep the entry (fail-fast needs it) and record
                // the revision under which the failure was observed.
                let mut st = self.state.lock().unwrap();
                let Some(pentry) = st.pool_sandboxes.get_mut(&pool_id) else {
                    return;
                };
                match pentry.sandboxes.iter_mut().find(|s| s.id == sandbox.id) {
                    Some(sb) => {
                        sb.status = status;
                        sb.revision = sandbox.revision;
                    }
                    None => {
                        let tracker = pentry.strategy.new_tracker();
                        pentry.sandboxes.push(TrackedSandbox {
                            id: sandbox.id.clone(),
                            revision: sandbox.revision,
                            status,
                            url: String::new(),
                            last_renewal: std::time::Instant::now(),
                            tracker,
                        });
                    }
                }
                debug!(sandbox = %sandbox.id, status = status.as_str(), "sandbox left the serving set");
                Self::signal_pool_waiters(&mut st, &pool_id, &key);
            }
        }
    }

    /// Drop a deleted sandbox everywhere; a pool with nothing tracked and no
    /// increment in flight leaves the index.
    fn forget_sandbox(&self, id: &EntityId) {
        let mut st = self.state.lock().unwrap();
        let mut affected: Vec<(EntityId, Key)> = Vec::new();
        let mut emptied: Vec<(EntityId, Key)> = Vec::new();
        for (pool_id, pentry) in st.pool_sandboxes.iter_mut() {
            let before = pentry.sandboxes.len();
            pentry.sandboxes.retain(|s| s.id != *id);
            if pentry.sandboxes.len() != before {
                affected.push((pool_id.clone(), pentry.key.clone()));
                if pentry.sandboxes.is_empty() {
                    emptied.push((pool_id.clone(), pentry.key.clone()));
                }
            }
        }
        for (pool_id, key) in &affected {
            Self::signal_pool_waiters(&mut st, pool_id, key);
        }
        for (pool_id, key) in emptied {
            let in_progress = st.pools.get(&key).is_some_and(|p| p.in_progress);
            if !in_progress {
                st.pool_sandboxes.remove(&pool_id);
            }
        }
    }

    pub(crate) async fn retire_idle(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.retire_interval);
        loop {
            interval.tick().await;
            self.retire_pass().await;
        }
    }

    /// Stop auto-mode sandboxes that have idled past their pool's scale-down
    /// delay. Fixed-mode pools are never retired.
    pub(crate) async fn retire_pass(&self) {
        let writes: Vec<(EntityId, u64)> = {
            let mut st = self.state.lock().unwrap();
            let mut writes = Vec::new();
            for pentry in st.pool_sandboxes.values_mut() {
                let Some(delay) = pentry.strategy.scale_down_delay() else {
                    continue;
                };
                for sb in pentry.sandboxes.iter_mut() {
                    if sb.status == SandboxStatus::Running
                        && sb.tracker.is_idle()
                        && sb.last_renewal.elapsed() >= delay
                    {
                        sb.status = SandboxStatus::Stopped;
                        writes.push((sb.id.clone(), sb.revision));
                    }
                }
            }
            writes
        };

        for (id, revision) in writes {
            let write = tokio::time::timeout(
                self.config.retire_write_timeout,
                self.store.patch(
                    &id,
                    vec![Attr::str("status", SandboxStatus::Stopped.as_str())],
                    revision,
                ),
            )
            .await;
            match write {
                Ok(Ok(_)) => info!(sandbox = %id, "retired idle sandbox"),
                Ok(Err(e)) => debug!(sandbox = %id, error = %e, "retirement write lost"),
                Err(_) => warn!(sandbox = %id, "retirement write timed out"),
            }
        }
    }

    pub(crate) async fn keep_fixed_instances(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.fixed_check_interval);
        loop {
            interval.tick().await;
            self.fixed_instance_pass().await;
        }
    }

    /// Top up fixed-mode services whose running+starting count fell below
    /// the declared instance count.
    pub(crate) async fn fixed_instance_pass(&self) {
        let shortfalls: Vec<(Key, u32)> = {
            let st = self.state.lock().unwrap();
            st.versions
                .iter()
                .filter_map(|(key, ventry)| {
                    let want = ventry.strategy.fixed_instances() as usize;
                    if want == 0 {
                        return None;
                    }
                    let have = st
                        .pool_sandboxes
                        .get(&ventry.pool_id)
                        .map(|p| {
                            p.sandboxes
                                .iter()
                                .filter(|s| {
                                    s.status == SandboxStatus::Running || s.status.is_starting()
                                })
                                .count()
                        })
                        .unwrap_or(0);
                    match want.saturating_sub(have) {
                        0 => None,
                        short => Some((key.clone(), short as u32)),
                    }
                })
                .collect()
        };

        for (key, short) in shortfalls {
            info!(version = %key.0, service = %key.1, shortfall = short, "topping up fixed service");
            for _ in 0..short {
                if let Err(e) = self.request_pool_capacity(&key).await {
                    warn!(version = %key.0, service = %key.1, error = %e, "fixed top-up failed");
                    break;
                }
            }
        }
    }
}
