/// Backend connection pool
///
/// Holds idle pool entries: sets of authenticated backend connections
/// sharing one startup packet, one slot per backend node. A session
/// takes ownership of an entry for its lifetime and either returns it
/// (idle, reusable) or discards it. Reuse requires the canonical
/// startup bytes to match exactly and a live slot for every alive
/// node.
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::protocol::message;
use crate::protocol::startup::StartupPacket;
use crate::protocol::stream::PacketStream;
use crate::protocol::{CancelKey, ParameterSet, TransactionState};

/// Socket trait object the pool stores; concrete sockets are erased
/// so tests can feed in-memory pipes.
pub trait PoolIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PoolIo for T {}

pub type BackendIo = Box<dyn PoolIo>;

/// One authenticated backend connection inside an entry
pub struct BackendSlot {
    pub node_id: usize,
    pub stream: PacketStream<BackendIo>,
    pub cancel_key: CancelKey,
    /// ParameterStatus pairs replayed to the frontend on reuse
    pub parameters: ParameterSet,
    pub tstate: TransactionState,
    /// None while a session is using the slot
    pub close_time: Option<Instant>,
}

impl BackendSlot {
    pub fn new(
        node_id: usize,
        stream: PacketStream<BackendIo>,
        cancel_key: CancelKey,
        parameters: ParameterSet,
        tstate: TransactionState,
    ) -> Self {
        Self {
            node_id,
            stream,
            cancel_key,
            parameters,
            tstate,
            close_time: None,
        }
    }

    /// Best-effort Terminate; the socket closes on drop regardless
    pub async fn terminate(&mut self) {
        let _ = self
            .stream
            .write_and_flush(&message::terminate().encode())
            .await;
    }
}

/// A set of backend slots sharing one startup packet
pub struct PoolEntry {
    pub startup: StartupPacket,
    slots: Vec<Option<BackendSlot>>,
}

impl PoolEntry {
    pub fn new(startup: StartupPacket, node_count: usize) -> Self {
        let mut slots = Vec::with_capacity(node_count);
        slots.resize_with(node_count, || None);
        Self { startup, slots }
    }

    pub fn install_slot(&mut self, slot: BackendSlot) {
        let node_id = slot.node_id;
        self.slots[node_id] = Some(slot);
    }

    pub fn slot(&self, node_id: usize) -> Option<&BackendSlot> {
        self.slots.get(node_id).and_then(|s| s.as_ref())
    }

    pub fn slot_mut(&mut self, node_id: usize) -> Option<&mut BackendSlot> {
        self.slots.get_mut(node_id).and_then(|s| s.as_mut())
    }

    pub fn take_slot(&mut self, node_id: usize) -> Option<BackendSlot> {
        self.slots.get_mut(node_id).and_then(|s| s.take())
    }

    pub fn slot_node_ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|slot| slot.node_id))
            .collect()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut BackendSlot> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    /// The slot decisions key on: lowest-indexed populated slot
    pub fn master_slot(&self) -> Option<&BackendSlot> {
        self.slots.iter().find_map(|s| s.as_ref())
    }

    pub fn master_slot_mut(&mut self) -> Option<&mut BackendSlot> {
        self.slots.iter_mut().find_map(|s| s.as_mut())
    }

    pub fn is_idle(&self) -> bool {
        self.master_slot()
            .map(|slot| slot.close_time.is_some())
            .unwrap_or(false)
    }

    fn idle_since(&self) -> Option<Instant> {
        self.master_slot().and_then(|slot| slot.close_time)
    }

    pub fn mark_idle(&mut self, now: Instant) {
        for slot in self.slots_mut() {
            slot.close_time = Some(now);
        }
    }

    pub fn mark_in_use(&mut self) {
        for slot in self.slots_mut() {
            slot.close_time = None;
        }
    }

    /// True when every node in `alive_nodes` has a populated slot
    pub fn covers_nodes(&self, alive_nodes: &[usize]) -> bool {
        alive_nodes
            .iter()
            .all(|id| self.slots.get(*id).map(|s| s.is_some()).unwrap_or(false))
    }

    /// Send Terminate to every slot
    pub async fn terminate_all(&mut self) {
        for slot in self.slots_mut() {
            slot.terminate().await;
        }
    }
}

/// Fixed-capacity cache of idle pool entries
pub struct ConnectionPool {
    max_pool: usize,
    entries: Vec<Option<PoolEntry>>,
}

impl ConnectionPool {
    pub fn new(max_pool: usize) -> Self {
        let mut entries = Vec::with_capacity(max_pool);
        entries.resize_with(max_pool, || None);
        Self { max_pool, entries }
    }

    pub fn idle_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Take a matching idle entry out of the pool. A match is an
    /// entry whose canonical startup bytes equal the new packet's and
    /// which still covers every alive node.
    pub fn acquire(&mut self, startup: &StartupPacket, alive_nodes: &[usize]) -> Option<PoolEntry> {
        let index = self.entries.iter().position(|slot| {
            slot.as_ref()
                .map(|entry| {
                    entry.is_idle()
                        && entry.startup.canonical_bytes() == startup.canonical_bytes()
                        && entry.covers_nodes(alive_nodes)
                })
                .unwrap_or(false)
        })?;
        let mut entry = self.entries[index].take();
        if let Some(entry) = entry.as_mut() {
            entry.mark_in_use();
            debug!(
                user = entry.startup.user(),
                database = entry.startup.database(),
                "reusing pooled backend entry"
            );
        }
        entry
    }

    /// Return an entry to the pool. When the pool is full, the idle
    /// entry with the oldest close time is evicted and handed back to
    /// the caller for termination.
    pub fn release(&mut self, mut entry: PoolEntry, now: Instant) -> Option<PoolEntry> {
        entry.mark_idle(now);

        if let Some(slot) = self.entries.iter_mut().find(|e| e.is_none()) {
            *slot = Some(entry);
            return None;
        }

        // Evict LRU by close time
        let evict_index = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().and_then(|entry| entry.idle_since().map(|t| (i, t))))
            .min_by_key(|(_, t)| *t)
            .map(|(i, _)| i)?;
        let evicted = self.entries[evict_index].replace(entry);
        debug!("connection pool full, evicting least recently used entry");
        evicted
    }

    /// Remove entries whose idle age reached `life_time`
    pub fn sweep(&mut self, life_time: Duration, now: Instant) -> Vec<PoolEntry> {
        if life_time.is_zero() {
            return Vec::new();
        }
        let mut expired = Vec::new();
        for slot in self.entries.iter_mut() {
            let old = slot
                .as_ref()
                .and_then(|e| e.idle_since())
                .map(|t| now.duration_since(t) >= life_time)
                .unwrap_or(false);
            if old {
                if let Some(entry) = slot.take() {
                    expired.push(entry);
                }
            }
        }
        expired
    }

    /// Drop every idle entry (asynchronous close-idle signal)
    pub fn drain_all(&mut self) -> Vec<PoolEntry> {
        self.entries.iter_mut().filter_map(|e| e.take()).collect()
    }

    /// Drop entries holding a slot for a node that just failed over
    pub fn discard_node(&mut self, node_id: usize) -> Vec<PoolEntry> {
        let mut discarded = Vec::new();
        for slot in self.entries.iter_mut() {
            let hit = slot
                .as_ref()
                .map(|e| e.slot(node_id).is_some())
                .unwrap_or(false);
            if hit {
                if let Some(entry) = slot.take() {
                    discarded.push(entry);
                }
            }
        }
        discarded
    }

    /// Drop idle entries for one (user, database) pair
    pub fn discard_matching(&mut self, user: &str, database: &str) -> Vec<PoolEntry> {
        let mut discarded = Vec::new();
        for slot in self.entries.iter_mut() {
            let hit = slot
                .as_ref()
                .map(|e| e.startup.user() == user && e.startup.database() == database)
                .unwrap_or(false);
            if hit {
                if let Some(entry) = slot.take() {
                    discarded.push(entry);
                }
            }
        }
        discarded
    }

    pub fn capacity(&self) -> usize {
        self.max_pool
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use bytes::{BufMut, BytesMut};

    pub fn startup_packet(user: &str, db: &str) -> StartupPacket {
        let mut buf = BytesMut::new();
        buf.put_i32(196608);
        for (k, v) in [("user", user), ("database", db)] {
            buf.put_slice(k.as_bytes());
            buf.put_u8(0);
            buf.put_slice(v.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
        StartupPacket::parse(buf.freeze()).unwrap()
    }

    pub fn test_slot(node_id: usize) -> BackendSlot {
        let (_a, b) = tokio::io::duplex(64);
        BackendSlot::new(
            node_id,
            PacketStream::new(Box::new(b) as BackendIo),
            CancelKey::new(100 + node_id as i32, 7),
            vec![("server_version".into(), "15.3".into())],
            TransactionState::Idle,
        )
    }

    pub fn test_entry(user: &str, db: &str, nodes: &[usize], node_count: usize) -> PoolEntry {
        let mut entry = PoolEntry::new(startup_packet(user, db), node_count);
        for id in nodes {
            entry.install_slot(test_slot(*id));
        }
        entry
    }
}
