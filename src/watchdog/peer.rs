/// Watchdog peer bookkeeping
///
/// A peer's identity is (hostname, watchdog port, proxy port). Every
/// remote peer has two potential socket identities: the connection we
/// initiated (client side) and the one the peer initiated (server
/// side). Either may carry traffic; sends prefer the client side.
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use tokio::sync::mpsc;

use super::fsm::WdState;
use super::packet::{BeaconMessage, WdPacket};

/// Reconnect attempts to an unreachable peer are spaced at least this
/// far apart
pub const MIN_SECS_CONNECTION_RETRY: Duration = Duration::from_secs(10);

/// A peer that has not replied this long after a reply-expecting send
/// is considered lost
pub const MAX_SECS_WAIT_FOR_REPLY: Duration = Duration::from_secs(5);

/// Configured identity of a remote watchdog peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub hostname: String,
    pub wd_port: u16,
    pub proxy_port: u16,
}

impl PeerAddress {
    pub fn wd_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.wd_port)
    }

    /// Identity comparison used to match an inbound handshake to a
    /// configured peer
    pub fn matches(&self, hostname: &str, wd_port: u16, proxy_port: u16) -> bool {
        self.hostname == hostname && self.wd_port == wd_port && self.proxy_port == proxy_port
    }
}

/// Lifecycle of one socket direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Uninitialized,
    WaitingForConnect,
    Connected,
    ErrorState,
    Closed,
}

/// Runtime view of a remote peer
pub struct WatchdogPeer {
    pub id: usize,
    pub address: PeerAddress,
    pub node_name: String,
    pub state: WdState,
    pub priority: i32,
    /// Relative clocks reconstructed from the last beacon
    pub seconds_since_startup: u64,
    pub state_changed_at: Option<Instant>,
    pub quorum_status: i32,
    pub standby_count: i32,
    pub escalated: bool,
    pub last_rcv: Option<Instant>,
    pub last_sent: Option<Instant>,
    pub client_sock: SocketState,
    pub server_sock: SocketState,
    pub last_connect_attempt: Option<Instant>,
    /// Writer handle for the outbound (client) connection
    pub client_tx: Option<mpsc::UnboundedSender<WdPacket>>,
    /// Writer handle for the inbound (server) connection
    pub server_tx: Option<mpsc::UnboundedSender<WdPacket>>,
}

impl WatchdogPeer {
    pub fn new(id: usize, address: PeerAddress) -> Self {
        Self {
            id,
            node_name: address.hostname.clone(),
            address,
            state: WdState::Dead,
            priority: 0,
            seconds_since_startup: 0,
            state_changed_at: None,
            quorum_status: -1,
            standby_count: 0,
            escalated: false,
            last_rcv: None,
            last_sent: None,
            client_sock: SocketState::Uninitialized,
            server_sock: SocketState::Uninitialized,
            last_connect_attempt: None,
            client_tx: None,
            server_tx: None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.client_tx.is_some() || self.server_tx.is_some()
    }

    /// Queue a packet toward the peer. The outbound connection is
    /// preferred; the inbound one is the fallback. Returns false when
    /// neither direction is usable.
    pub fn send(&mut self, packet: WdPacket, now: Instant) -> bool {
        if let Some(tx) = &self.client_tx {
            if tx.send(packet.clone()).is_ok() {
                self.last_sent = Some(now);
                return true;
            }
            self.client_tx = None;
            self.client_sock = SocketState::ErrorState;
        }
        if let Some(tx) = &self.server_tx {
            if tx.send(packet).is_ok() {
                self.last_sent = Some(now);
                return true;
            }
            self.server_tx = None;
            self.server_sock = SocketState::ErrorState;
        }
        false
    }

    /// Whether an outbound connection attempt is due
    pub fn reconnect_due(&self, now: Instant) -> bool {
        if self.client_tx.is_some() || self.client_sock == SocketState::WaitingForConnect {
            return false;
        }
        match self.last_connect_attempt {
            Some(at) => now.duration_since(at) >= MIN_SECS_CONNECTION_RETRY,
            None => true,
        }
    }

    /// Apply beacon fields received from the peer
    pub fn apply_beacon(&mut self, beacon: &BeaconMessage, now: Instant) {
        self.state = WdState::from_u8(beacon.state).unwrap_or(self.state);
        self.seconds_since_startup = beacon.seconds_since_startup;
        self.state_changed_at = now.checked_sub(Duration::from_secs(beacon.seconds_since_state_change));
        self.quorum_status = beacon.quorum_status;
        self.standby_count = beacon.standby_count;
        self.escalated = beacon.escalated;
    }

    pub fn drop_connections(&mut self) {
        self.client_tx = None;
        self.server_tx = None;
        self.client_sock = SocketState::Closed;
        self.server_sock = SocketState::Closed;
    }
}

/// Hash authenticating a peer handshake. Computed over the canonical
/// node string plus the shared key; the canonical form must stay
/// bit-identical across versions for mixed deployments to pair up.
pub fn auth_hash(state: u8, wd_port: u16, auth_key: &str) -> String {
    let canonical = format!("state={} wd_port={}", state, wd_port);
    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    hasher.update(auth_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify an incoming handshake hash. An empty configured key
/// disables authentication.
pub fn verify_auth_hash(
    state: u8,
    wd_port: u16,
    auth_key: &str,
    presented: Option<&str>,
) -> bool {
    if auth_key.is_empty() {
        return true;
    }
    match presented {
        Some(hash) => auth_hash(state, wd_port, auth_key) == hash,
        None => false,
    }
}
