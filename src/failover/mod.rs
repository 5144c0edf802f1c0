/// Failover request channel and executor
///
/// Any session task or health worker can queue a node operation on
/// the registry's request ring; the single coordinator task drains
/// the ring, routes each request through the configured arbiter (the
/// watchdog consensus engine when one is running, a pass-through
/// otherwise), and executes the resulting transition.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::pool::ConnectionPool;
use crate::registry::{ClusterRegistry, NodeOpKind, NodeOpRequest, NodeRole, NodeStatus};

/// What the arbiter decided about a node operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterVerdict {
    /// Execute now
    Proceed,
    /// Vote recorded; waiting for more peers
    BuildingConsensus,
    /// Quorum absent; the request cannot currently succeed
    NoQuorum,
    /// Duplicate vote from the same reporter; consensus may never
    /// complete
    ConsensusMayFail,
    /// The cluster coordinator executes this request; the local node
    /// only waits for the resulting state broadcast
    WillBeDone,
}

/// Decides whether a node operation may execute. The watchdog
/// consensus engine implements this; without a watchdog every request
/// proceeds immediately.
#[async_trait]
pub trait FailoverArbiter: Send + Sync {
    async fn submit(&self, request: &NodeOpRequest) -> ArbiterVerdict;

    /// Called after a Proceed verdict was executed locally
    async fn completed(&self, _request: &NodeOpRequest) {}
}

/// Pass-through arbiter for watchdog-less deployments
pub struct LocalArbiter;

#[async_trait]
impl FailoverArbiter for LocalArbiter {
    async fn submit(&self, _request: &NodeOpRequest) -> ArbiterVerdict {
        ArbiterVerdict::Proceed
    }
}

/// Drains the request ring and applies node transitions
pub struct FailoverCoordinator {
    registry: Arc<ClusterRegistry>,
    pool: Arc<Mutex<ConnectionPool>>,
    arbiter: Arc<dyn FailoverArbiter>,
}

impl FailoverCoordinator {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        pool: Arc<Mutex<ConnectionPool>>,
        arbiter: Arc<dyn FailoverArbiter>,
    ) -> Self {
        Self {
            registry,
            pool,
            arbiter,
        }
    }

    /// Consumer loop; runs until the task is dropped
    pub async fn run(&self) {
        loop {
            self.registry.wait_for_requests().await;
            self.drain().await;
        }
    }

    /// Handle everything currently queued
    pub async fn drain(&self) {
        for request in self.registry.take_requests() {
            self.handle(request).await;
        }
    }

    pub async fn handle(&self, request: NodeOpRequest) {
        if request.flags.update_only {
            // Status rewrite only, no failover machinery
            self.apply_statuses(&request);
            return;
        }

        match self.arbiter.submit(&request).await {
            ArbiterVerdict::Proceed => {
                self.execute(&request).await;
                self.arbiter.completed(&request).await;
            }
            ArbiterVerdict::WillBeDone => {
                // The coordinator runs the failover; our registry is
                // updated by its end-of-failover state broadcast
                info!(nodes = ?request.nodes, "failover delegated to cluster coordinator");
            }
            ArbiterVerdict::BuildingConsensus | ArbiterVerdict::NoQuorum => {
                // A failure report that cannot yet execute quarantines
                // the node: out of routing, still registered
                if request.kind == NodeOpKind::Down {
                    info!(
                        nodes = ?request.nodes,
                        "failover lacks consensus, quarantining instead"
                    );
                    for node in &request.nodes {
                        self.registry.set_status(*node, NodeStatus::Quarantined);
                    }
                    self.discard_pooled(&request.nodes).await;
                }
            }
            ArbiterVerdict::ConsensusMayFail => {
                warn!(
                    nodes = ?request.nodes,
                    "duplicate failover vote ignored; consensus may not complete"
                );
            }
        }
    }

    fn apply_statuses(&self, request: &NodeOpRequest) {
        let status = match request.kind {
            NodeOpKind::Up | NodeOpKind::Recovery => NodeStatus::Up,
            NodeOpKind::Down => NodeStatus::Down,
            NodeOpKind::Quarantine => NodeStatus::Quarantined,
            NodeOpKind::Promote | NodeOpKind::CloseIdle => return,
        };
        for node in &request.nodes {
            self.registry.set_status(*node, status);
        }
    }

    /// Apply an approved node transition
    pub async fn execute(&self, request: &NodeOpRequest) {
        info!(kind = ?request.kind, nodes = ?request.nodes, "executing node operation");
        self.registry.set_switching(true);

        match request.kind {
            NodeOpKind::Down => {
                for node in &request.nodes {
                    self.registry.set_status(*node, NodeStatus::Down);
                }
                self.discard_pooled(&request.nodes).await;
            }
            NodeOpKind::Quarantine => {
                for node in &request.nodes {
                    self.registry.set_status(*node, NodeStatus::Quarantined);
                }
                self.discard_pooled(&request.nodes).await;
            }
            NodeOpKind::Up => {
                for node in &request.nodes {
                    self.registry.set_status(*node, NodeStatus::ConnectWait);
                }
            }
            NodeOpKind::Recovery => {
                for node in &request.nodes {
                    self.registry.set_status(*node, NodeStatus::Up);
                }
            }
            NodeOpKind::Promote => {
                for node in 0..self.registry.node_count() {
                    let role = if request.nodes.contains(&node) {
                        NodeRole::Primary
                    } else {
                        NodeRole::Standby
                    };
                    self.registry.set_role(node, role);
                }
                // A promoted standby must serve fresh sessions
                for node in &request.nodes {
                    if self.registry.status_of(*node) == Some(NodeStatus::Quarantined) {
                        self.registry.set_status(*node, NodeStatus::Up);
                    }
                }
            }
            NodeOpKind::CloseIdle => {
                let drained = {
                    let mut pool = self.pool.lock().await;
                    pool.drain_all()
                };
                for mut entry in drained {
                    entry.terminate_all().await;
                }
            }
        }

        self.registry.set_switching(false);
        info!(kind = ?request.kind, nodes = ?request.nodes, "node operation complete");
    }

    async fn discard_pooled(&self, nodes: &[usize]) {
        let mut discarded = Vec::new();
        {
            let mut pool = self.pool.lock().await;
            for node in nodes {
                discarded.extend(pool.discard_node(*node));
            }
        }
        for mut entry in discarded {
            entry.terminate_all().await;
        }
    }
}
