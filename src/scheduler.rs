//! Sandbox-to-node binding.
//!
//! The scheduler watches sandboxes and gives every new one a schedule key
//! naming the node it runs on. Nodes are held in memory: loaded once at
//! startup and kept current by a second reconciler tailing the node kind.
//! Placement is uniform random over ready nodes; the fleet is assumed close
//! to homogeneous.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::entity::{Entity, EntityId};
use crate::model::{kind, Node, NodeStatus, Sandbox, Schedule};
use crate::reconciler::{ReconcileCtx, Reconciler};
use crate::store::EntityStore;

type NodeMap = Arc<Mutex<HashMap<EntityId, Node>>>;

pub struct Scheduler {
    nodes: NodeMap,
}

impl Scheduler {
    /// Load the current fleet. A lost node list is treated as "no nodes":
    /// scheduling defers until the node watch repopulates the map.
    pub async fn new(store: &Arc<dyn EntityStore>) -> Self {
        let mut nodes = HashMap::new();
        match store.list(kind::NODE).await {
            Ok(entities) => {
                for entity in entities {
                    match Node::decode(&entity) {
                        Ok(node) => {
                            nodes.insert(node.id.clone(), node);
                        }
                        Err(e) => warn!(error = %e, "skipping undecodable node"),
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "node list unavailable, starting with an empty fleet");
            }
        }
        info!(nodes = nodes.len(), "scheduler initialized");
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }

    /// The companion reconciler that keeps the node map current.
    pub fn node_tracker(&self) -> NodeTracker {
        NodeTracker {
            nodes: Arc::clone(&self.nodes),
        }
    }

    fn pick_ready_node(&self) -> Option<EntityId> {
        let nodes = self.nodes.lock().unwrap();
        let ready: Vec<&EntityId> = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Ready)
            .map(|n| &n.id)
            .collect();
        ready.choose(&mut rand::thread_rng()).map(|id| (*id).clone())
    }
}

#[async_trait]
impl Reconciler for Scheduler {
    fn kind(&self) -> &'static str {
        kind::SANDBOX
    }

    async fn reconcile(&self, entity: Entity, ctx: &ReconcileCtx) -> anyhow::Result<()> {
        if Schedule::decode(&entity).is_some() {
            return Ok(());
        }
        let sandbox = match Sandbox::decode(&entity) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(error = %e, "skipping undecodable sandbox");
                return Ok(());
            }
        };
        if sandbox.status.is_terminal() {
            return Ok(());
        }

        let Some(node) = self.pick_ready_node() else {
            warn!(sandbox = %sandbox.id, "no ready nodes, deferring");
            return Ok(());
        };

        let schedule = Schedule::for_node(node.clone());
        match ctx
            .update(&sandbox.id, vec![schedule.encode()], entity.revision)
            .await
        {
            Ok(_) => {
                info!(sandbox = %sandbox.id, node = %node, "sandbox scheduled");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                // Someone moved the sandbox under us; the conflicting write's
                // own notification re-runs this reconcile.
                debug!(sandbox = %sandbox.id, "revision conflict, deferring");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps the scheduler's node view in sync with the store.
pub struct NodeTracker {
    nodes: NodeMap,
}

#[async_trait]
impl Reconciler for NodeTracker {
    fn kind(&self) -> &'static str {
        kind::NODE
    }

    async fn reconcile(&self, entity: Entity, _ctx: &ReconcileCtx) -> anyhow::Result<()> {
        match Node::decode(&entity) {
            Ok(node) => {
                self.nodes.lock().unwrap().insert(node.id.clone(), node);
            }
            Err(e) => warn!(error = %e, "skipping undecodable node"),
        }
        Ok(())
    }

    async fn deleted(&self, id: EntityId, _ctx: &ReconcileCtx) -> anyhow::Result<()> {
        self.nodes.lock().unwrap().remove(&id);
        Ok(())
    }
}
