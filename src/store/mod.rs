//! Entity store contract.
//!
//! The orchestrator's single source of truth. Every write returns the new
//! revision; compare-and-swap writes fail with a revision conflict when the
//! expected revision is stale. Watches deliver create/update/delete
//! operations in per-id revision order; across ids there is no ordering
//! guarantee.
//!
//! The production store is an external service; [`memory::MemoryStore`] is
//! the in-process implementation used for development and tests.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::entity::{Attr, Entity, EntityId};

/// Operation carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    Create,
    Update,
    Delete,
}

/// One observed change. Deletes carry the id only.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub op: WatchOp,
    pub id: EntityId,
    pub entity: Option<Entity>,
}

/// Receiver half of a watch. The watch ends when the receiver is dropped or
/// the store goes away; a closed stream is not an error by itself.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(EntityId),

    #[error("revision conflict on {id}: expected {expected}, current {current}")]
    RevisionConflict {
        id: EntityId,
        expected: u64,
        current: u64,
    },

    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::RevisionConflict { .. })
    }
}

/// Uniform facade over the entity store.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch one entity with its current revision.
    async fn get(&self, id: &EntityId) -> Result<Entity, StoreError>;

    /// Create (or overwrite without a revision check) an entity. When `id` is
    /// `None` a fresh id of the given kind is minted. Returns id + revision.
    async fn put(
        &self,
        id: Option<EntityId>,
        kind: &str,
        attrs: Vec<Attr>,
    ) -> Result<(EntityId, u64), StoreError>;

    /// Merge attributes into an entity iff its revision still matches.
    async fn patch(
        &self,
        id: &EntityId,
        attrs: Vec<Attr>,
        expected_revision: u64,
    ) -> Result<u64, StoreError>;

    /// Swap the entire attribute list iff the revision still matches. Missing
    /// attributes clear the corresponding stored value.
    async fn replace(
        &self,
        id: &EntityId,
        attrs: Vec<Attr>,
        expected_revision: u64,
    ) -> Result<u64, StoreError>;

    /// Remove an entity. Removing an absent entity is not an error.
    async fn delete(&self, id: &EntityId) -> Result<(), StoreError>;

    /// Snapshot of all entities of one kind.
    async fn list(&self, kind: &str) -> Result<Vec<Entity>, StoreError>;

    /// Observe changes to a single entity.
    async fn watch(&self, id: &EntityId) -> Result<WatchStream, StoreError>;

    /// Observe changes to every entity of a kind.
    async fn watch_index(&self, kind: &str) -> Result<WatchStream, StoreError>;
}
