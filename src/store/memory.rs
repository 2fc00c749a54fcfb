//! In-memory entity store.
//!
//! Process-local implementation of the [`EntityStore`] contract: a single
//! mutex-guarded map, a store-wide monotonic revision counter, and watch
//! fan-out over unbounded channels. Events are published while the map lock
//! is held, which preserves per-id revision order on every stream.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{EntityStore, StoreError, WatchEvent, WatchOp, WatchStream};
use crate::entity::{merge_attrs, Attr, Entity, EntityId};

#[derive(Default)]
struct Inner {
    entities: HashMap<EntityId, Entity>,
    revision: u64,
    id_watchers: Vec<(EntityId, mpsc::UnboundedSender<WatchEvent>)>,
    kind_watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn publish(&mut self, event: WatchEvent) {
        self.id_watchers
            .retain(|(id, tx)| *id != event.id || tx.send(event.clone()).is_ok());
        self.kind_watchers
            .retain(|(kind, tx)| kind != event.id.kind() || tx.send(event.clone()).is_ok());
    }
}

/// Development and test store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, id: &EntityId) -> Result<Entity, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn put(
        &self,
        id: Option<EntityId>,
        kind: &str,
        attrs: Vec<Attr>,
    ) -> Result<(EntityId, u64), StoreError> {
        let id = id.unwrap_or_else(|| EntityId::random(kind));
        let mut inner = self.inner.lock().unwrap();
        let revision = inner.next_revision();
        let op = if inner.entities.contains_key(&id) {
            WatchOp::Update
        } else {
            WatchOp::Create
        };
        let entity = Entity {
            id: id.clone(),
            revision,
            attrs,
        };
        inner.entities.insert(id.clone(), entity.clone());
        inner.publish(WatchEvent {
            op,
            id: id.clone(),
            entity: Some(entity),
        });
        Ok((id, revision))
    }

    async fn patch(
        &self,
        id: &EntityId,
        attrs: Vec<Attr>,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if current.revision != expected_revision {
            return Err(StoreError::RevisionConflict {
                id: id.clone(),
                expected: expected_revision,
                current: current.revision,
            });
        }
        let merged = merge_attrs(&current.attrs, &attrs);
        let revision = inner.next_revision();
        let entity = Entity {
            id: id.clone(),
            revision,
            attrs: merged,
        };
        inner.entities.insert(id.clone(), entity.clone());
        inner.publish(WatchEvent {
            op: WatchOp::Update,
            id: id.clone(),
            entity: Some(entity),
        });
        Ok(revision)
    }

    async fn replace(
        &self,
        id: &EntityId,
        attrs: Vec<Attr>,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if current.revision != expected_revision {
            return Err(StoreError::RevisionConflict {
                id: id.clone(),
                expected: expected_revision,
                current: current.revision,
            });
        }
        let revision = inner.next_revision();
        let entity = Entity {
            id: id.clone(),
            revision,
            attrs,
        };
        inner.entities.insert(id.clone(), entity.clone());
        inner.publish(WatchEvent {
            op: WatchOp::Update,
            id: id.clone(),
            entity: Some(entity),
        });
        Ok(revision)
    }

    async fn delete(&self, id: &EntityId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entities.remove(id).is_some() {
            inner.publish(WatchEvent {
                op: WatchOp::Delete,
                id: id.clone(),
                entity: None,
            });
        }
        Ok(())
    }

    async fn list(&self, kind: &str) -> Result<Vec<Entity>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut entities: Vec<Entity> = inner
            .entities
            .values()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    async fn watch(&self, id: &EntityId) -> Result<WatchStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.id_watchers.push((id.clone(), tx));
        Ok(rx)
    }

    async fn watch_index(&self, kind: &str) -> Result<WatchStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.kind_watchers.push((kind.to_string(), tx));
        Ok(rx)
    }
}
