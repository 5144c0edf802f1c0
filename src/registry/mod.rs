/// Shared cluster registry
///
/// Process-wide state every session task and background service can
/// see: the backend descriptor table, the bounded node-operation
/// request queue, the frontend connection counter, and the cancel-key
/// routing map. Status transitions are persisted to the status file
/// before they become visible to readers.
pub mod status_file;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::RwLock;

use fnv::FnvHashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::protocol::CancelKey;

/// Replication role of a backend node
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NodeRole {
    Primary,
    Standby,
    Unknown,
}

/// Availability status of a backend node
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NodeStatus {
    /// Serving traffic
    Up,
    /// Configured but not yet connected to
    ConnectWait,
    /// Failed over
    Down,
    /// Excluded from routing, awaiting consensus to go Down
    Quarantined,
}

impl NodeStatus {
    /// Nodes that may carry sessions. Quarantined stays in the
    /// registry but never receives traffic.
    pub fn is_alive(&self) -> bool {
        matches!(self, NodeStatus::Up | NodeStatus::ConnectWait)
    }
}

/// One configured backend node
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    pub id: usize,
    pub host: String,
    pub port: u16,
    pub weight: f64,
    pub role: NodeRole,
    pub status: NodeStatus,
}

impl BackendDescriptor {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Kinds of node operations flowing through the request queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeOpKind {
    Up,
    Down,
    Recovery,
    CloseIdle,
    Promote,
    Quarantine,
}

/// Request qualifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeOpFlags {
    /// Planned switchover rather than a failure reaction
    pub switchover: bool,
    /// Originated from a watchdog peer, not a local observation
    pub from_watchdog: bool,
    /// Pre-confirmed; consensus building is skipped
    pub confirmed: bool,
    /// Only rewrite statuses, no failover machinery
    pub update_only: bool,
}

/// A node state change request
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeOpRequest {
    pub kind: NodeOpKind,
    pub nodes: Vec<usize>,
    pub flags: NodeOpFlags,
}

impl NodeOpRequest {
    pub fn new(kind: NodeOpKind, nodes: Vec<usize>) -> Self {
        Self {
            kind,
            nodes,
            flags: NodeOpFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: NodeOpFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Node list sorted for request identity comparison
    pub fn sorted_nodes(&self) -> Vec<usize> {
        let mut nodes = self.nodes.clone();
        nodes.sort_unstable();
        nodes
    }
}

/// Cancel-routing record for one live session: the key handed to the
/// frontend plus the per-node keys of every slot in its pool entry
#[derive(Debug, Clone)]
pub struct SessionCancelInfo {
    pub user: String,
    pub database: String,
    /// (node id, that backend's own cancel key)
    pub backend_keys: Vec<(usize, CancelKey)>,
}

const REQUEST_QUEUE_CAPACITY: usize = 128;

/// Process-wide shared state
pub struct ClusterRegistry {
    descriptors: RwLock<Vec<BackendDescriptor>>,
    request_queue: std::sync::Mutex<VecDeque<NodeOpRequest>>,
    request_notify: Notify,
    conn_counter: AtomicUsize,
    master_node_id: AtomicI32,
    primary_node_id: AtomicI32,
    switching: AtomicBool,
    cancel_map: RwLock<FnvHashMap<(i32, i32), SessionCancelInfo>>,
    status_path: Option<PathBuf>,
}

impl ClusterRegistry {
    pub fn new(mut descriptors: Vec<BackendDescriptor>, status_path: Option<PathBuf>) -> Self {
        // Seed statuses from the status file when one exists
        if let Some(path) = &status_path {
            if let Ok(saved) = status_file::load(path) {
                for (desc, status) in descriptors.iter_mut().zip(saved) {
                    if let Some(status) = status {
                        desc.status = status;
                    }
                }
            }
        }

        let registry = Self {
            descriptors: RwLock::new(descriptors),
            request_queue: std::sync::Mutex::new(VecDeque::new()),
            request_notify: Notify::new(),
            conn_counter: AtomicUsize::new(0),
            master_node_id: AtomicI32::new(-1),
            primary_node_id: AtomicI32::new(-1),
            switching: AtomicBool::new(false),
            cancel_map: RwLock::new(FnvHashMap::default()),
            status_path,
        };
        registry.recompute_node_ids();
        registry
    }

    /// Snapshot of the descriptor table. Sessions take one at start
    /// and work from the copy until told the table changed.
    pub fn snapshot(&self) -> Vec<BackendDescriptor> {
        self.descriptors.read().expect("descriptor lock").clone()
    }

    pub fn node_count(&self) -> usize {
        self.descriptors.read().expect("descriptor lock").len()
    }

    pub fn status_of(&self, node_id: usize) -> Option<NodeStatus> {
        self.descriptors
            .read()
            .expect("descriptor lock")
            .get(node_id)
            .map(|d| d.status)
    }

    /// Apply a status transition; persists before publishing
    pub fn set_status(&self, node_id: usize, status: NodeStatus) {
        {
            let mut descriptors = self.descriptors.write().expect("descriptor lock");
            let Some(desc) = descriptors.get_mut(node_id) else {
                warn!(node_id, "status change for unknown backend ignored");
                return;
            };
            if desc.status == status {
                return;
            }
            debug!(node_id, ?status, "backend status transition");
            desc.status = status;
            if let Some(path) = &self.status_path {
                if let Err(e) = status_file::save(path, &descriptors) {
                    warn!(error = %e, "failed to rewrite backend status file");
                }
            }
        }
        self.recompute_node_ids();
    }

    pub fn set_role(&self, node_id: usize, role: NodeRole) {
        {
            let mut descriptors = self.descriptors.write().expect("descriptor lock");
            if let Some(desc) = descriptors.get_mut(node_id) {
                desc.role = role;
            }
        }
        self.recompute_node_ids();
    }

    /// Lowest-indexed alive node, or -1
    pub fn master_node_id(&self) -> i32 {
        self.master_node_id.load(Ordering::Acquire)
    }

    /// Current primary in streaming-replication terms, or -1
    pub fn primary_node_id(&self) -> i32 {
        self.primary_node_id.load(Ordering::Acquire)
    }

    fn recompute_node_ids(&self) {
        let descriptors = self.descriptors.read().expect("descriptor lock");
        let master = descriptors
            .iter()
            .find(|d| d.status.is_alive())
            .map(|d| d.id as i32)
            .unwrap_or(-1);
        let primary = descriptors
            .iter()
            .find(|d| d.status.is_alive() && d.role == NodeRole::Primary)
            .map(|d| d.id as i32)
            .unwrap_or(-1);
        self.master_node_id.store(master, Ordering::Release);
        self.primary_node_id.store(primary, Ordering::Release);
    }

    pub fn alive_node_count(&self) -> usize {
        self.descriptors
            .read()
            .expect("descriptor lock")
            .iter()
            .filter(|d| d.status.is_alive())
            .count()
    }

    // -- frontend connection accounting ------------------------------

    /// Count a newly accepted frontend; returns the new total
    pub fn connection_up(&self) -> usize {
        self.conn_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn connection_down(&self) {
        let prev = self.conn_counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "connection counter underflow");
    }

    pub fn connection_count(&self) -> usize {
        self.conn_counter.load(Ordering::Acquire)
    }

    // -- failover-in-progress flag -----------------------------------

    pub fn set_switching(&self, value: bool) {
        self.switching.store(value, Ordering::Release);
    }

    pub fn is_switching(&self) -> bool {
        self.switching.load(Ordering::Acquire)
    }

    // -- node operation request queue --------------------------------

    /// Queue a node operation. Returns false when the ring is full.
    pub fn submit_request(&self, request: NodeOpRequest) -> bool {
        {
            let mut queue = self.request_queue.lock().expect("request queue lock");
            if queue.len() >= REQUEST_QUEUE_CAPACITY {
                warn!(?request, "node operation queue full, request dropped");
                return false;
            }
            queue.push_back(request);
        }
        self.request_notify.notify_one();
        true
    }

    /// Drain all pending requests, coalescing identical ones
    pub fn take_requests(&self) -> Vec<NodeOpRequest> {
        let mut queue = self.request_queue.lock().expect("request queue lock");
        let mut out: Vec<NodeOpRequest> = Vec::with_capacity(queue.len());
        while let Some(req) = queue.pop_front() {
            let duplicate = out
                .iter()
                .any(|seen| seen.kind == req.kind && seen.sorted_nodes() == req.sorted_nodes());
            if !duplicate {
                out.push(req);
            }
        }
        out
    }

    pub fn pending_request_count(&self) -> usize {
        self.request_queue.lock().expect("request queue lock").len()
    }

    /// Wait until a request is queued
    pub async fn wait_for_requests(&self) {
        self.request_notify.notified().await;
    }

    // -- cancel-key routing ------------------------------------------

    /// Register the cancel keys of a session. `frontend_key` is what
    /// the client was handed; the info carries each backend's own key.
    pub fn register_cancel_keys(&self, frontend_key: CancelKey, info: SessionCancelInfo) {
        self.cancel_map
            .write()
            .expect("cancel map lock")
            .insert((frontend_key.pid, frontend_key.key), info);
    }

    pub fn unregister_cancel_keys(&self, frontend_key: CancelKey) {
        self.cancel_map
            .write()
            .expect("cancel map lock")
            .remove(&(frontend_key.pid, frontend_key.key));
    }

    pub fn lookup_cancel_keys(&self, key: CancelKey) -> Option<SessionCancelInfo> {
        self.cancel_map
            .read()
            .expect("cancel map lock")
            .get(&(key.pid, key.key))
            .cloned()
    }
}

#[cfg(test)]
pub(crate) fn test_descriptors(n: usize) -> Vec<BackendDescriptor> {
    (0..n)
        .map(|id| BackendDescriptor {
            id,
            host: "127.0.0.1".to_string(),
            port: 15432 + id as u16,
            weight: 1.0,
            role: if id == 0 {
                NodeRole::Primary
            } else {
                NodeRole::Standby
            },
            status: NodeStatus::Up,
        })
        .collect()
}
