//! Per-entity reconciler framework.
//!
//! A reconciler is a handler for one entity kind. The framework runs one
//! supervisor task per (kind, handler): it reconciles the existing population
//! once, then tails the kind's watch and dispatches every create/update.
//! Handler errors are logged and the entity is retried on its next
//! notification; a dead watch stream is restarted after a backoff. Events are
//! dispatched sequentially, so reconciliations of the same entity never race
//! each other in-process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::entity::{Attr, Entity, EntityId};
use crate::store::{EntityStore, StoreError, WatchOp};

/// Minimum pause before a dead watch stream is reopened.
pub const WATCH_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Access to out-of-band state during a reconcile: the store itself, plus
/// helpers for side attributes that live next to (not inside) the typed
/// entity, like the schedule key.
pub struct ReconcileCtx {
    store: Arc<dyn EntityStore>,
}

impl ReconcileCtx {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub async fn get(&self, id: &EntityId) -> Result<Entity, StoreError> {
        self.store.get(id).await
    }

    /// Append out-of-band attributes to an entity, guarded by its revision.
    pub async fn update(
        &self,
        id: &EntityId,
        attrs: Vec<Attr>,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        self.store.patch(id, attrs, expected_revision).await
    }
}

/// Handler for one entity kind.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, entity: Entity, ctx: &ReconcileCtx) -> anyhow::Result<()>;

    /// Invoked for delete operations, which carry the id only.
    async fn deleted(&self, _id: EntityId, _ctx: &ReconcileCtx) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Run a reconciler until the returned handle is aborted.
pub fn spawn(store: Arc<dyn EntityStore>, handler: Arc<dyn Reconciler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(store, handler).await;
    })
}

async fn run(store: Arc<dyn EntityStore>, handler: Arc<dyn Reconciler>) {
    let ctx = ReconcileCtx::new(Arc::clone(&store));
    let kind = handler.kind();
    loop {
        match store.watch_index(kind).await {
            Ok(mut watch) => {
                // Reconcile what already exists before tailing changes, so a
                // restart never strands entities written while we were down.
                match store.list(kind).await {
                    Ok(entities) => {
                        for entity in entities {
                            dispatch(&*handler, entity, &ctx).await;
                        }
                    }
                    Err(e) => {
                        warn!(kind, error = %e, "initial list failed");
                    }
                }

                while let Some(event) = watch.recv().await {
                    match event.op {
                        WatchOp::Create | WatchOp::Update => {
                            if let Some(entity) = event.entity {
                                dispatch(&*handler, entity, &ctx).await;
                            }
                        }
                        WatchOp::Delete => {
                            if let Err(e) = handler.deleted(event.id.clone(), &ctx).await {
                                warn!(kind, id = %event.id, error = %e, "delete handler failed");
                            }
                        }
                    }
                }
                warn!(kind, "watch stream ended, restarting");
            }
            Err(e) => {
                warn!(kind, error = %e, "watch failed, restarting");
            }
        }
        tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
    }
}

async fn dispatch(handler: &dyn Reconciler, entity: Entity, ctx: &ReconcileCtx) {
    let id = entity.id.clone();
    debug!(kind = handler.kind(), id = %id, "reconciling");
    if let Err(e) = handler.reconcile(entity, ctx).await {
        warn!(kind = handler.kind(), id = %id, error = %e, "reconcile failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    struct Recorder {
        kind: &'static str,
        seen: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Reconciler for Recorder {
        fn kind(&self) -> &'static str {
            self.kind
        }

        async fn reconcile(&self, entity: Entity, _ctx: &ReconcileCtx) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(entity.id.to_string());
            Ok(())
        }

        async fn deleted(&self, id: EntityId, _ctx: &ReconcileCtx) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reconciles_existing_then_watched() {
        let store = Arc::new(MemoryStore::new());
        let (existing, _) = store.put(None, "node", vec![]).await.unwrap();

        let handler = Arc::new(Recorder {
            kind: "node",
            seen: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        });
        let task = spawn(store.clone() as Arc<dyn EntityStore>, handler.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (created, _) = store.put(None, "node", vec![]).await.unwrap();
        store.delete(&created).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = handler.seen.lock().unwrap().clone();
        assert!(seen.contains(&existing.to_string()));
        assert!(seen.contains(&created.to_string()));
        let deleted = handler.deleted.lock().unwrap().clone();
        assert_eq!(deleted, vec![created.to_string()]);

        task.abort();
    }

    #[tokio::test]
    async fn test_other_kinds_are_not_dispatched() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(Recorder {
            kind: "node",
            seen: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        });
        let task = spawn(store.clone() as Arc<dyn EntityStore>, handler.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.put(None, "sandbox", vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handler.seen.lock().unwrap().is_empty());
        task.abort();
    }
}
