/// Watchdog state machine
///
/// All cluster-coordination state lives here and is mutated from a
/// single task. Events come in (packets, timers, connection changes,
/// local failover votes); protocol messages go out through the peer
/// send handles, and side effects the proxy must perform come back as
/// actions for the caller to interpret.
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::failover::ArbiterVerdict;
use crate::registry::{NodeOpFlags, NodeOpKind, NodeOpRequest, NodeStatus};

use super::command::{CommandBus, CommandStatus};
use super::consensus::{self, ConsensusEngine, ConsensusSettings};
use super::packet::{
    BeaconMessage, ClusterServiceEvent, FailoverRequestMessage, FailoverVerdictMessage,
    NodeInfoMessage, PacketType, WdPacket,
};
use super::peer::{self, PeerAddress, WatchdogPeer};

/// Beacon cadence of an acting coordinator
pub const BEACON_INTERVAL: Duration = Duration::from_secs(10);

/// Reply budget for cluster commands during elections
const ELECTION_COMMAND_TIMEOUT: Duration = Duration::from_secs(4);
const JOIN_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// States of the local watchdog node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WdState {
    Dead,
    Loading,
    Joining,
    Initializing,
    Coordinator,
    ParticipateInElection,
    StandForCoordinator,
    Standby,
    Lost,
    InNetworkTrouble,
    Shutdown,
    AddMessageSent,
}

impl WdState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WdState::Dead => "DEAD",
            WdState::Loading => "LOADING",
            WdState::Joining => "JOINING",
            WdState::Initializing => "INITIALIZING",
            WdState::Coordinator => "MASTER",
            WdState::ParticipateInElection => "PARTICIPATING IN ELECTION",
            WdState::StandForCoordinator => "STANDING FOR MASTER",
            WdState::Standby => "STANDBY",
            WdState::Lost => "LOST",
            WdState::InNetworkTrouble => "IN NETWORK TROUBLE",
            WdState::Shutdown => "SHUTDOWN",
            WdState::AddMessageSent => "ADD MESSAGE SENT",
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            WdState::Dead => 0,
            WdState::Loading => 1,
            WdState::Joining => 2,
            WdState::Initializing => 3,
            WdState::Coordinator => 4,
            WdState::ParticipateInElection => 5,
            WdState::StandForCoordinator => 6,
            WdState::Standby => 7,
            WdState::Lost => 8,
            WdState::InNetworkTrouble => 9,
            WdState::Shutdown => 10,
            WdState::AddMessageSent => 11,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => WdState::Dead,
            1 => WdState::Loading,
            2 => WdState::Joining,
            3 => WdState::Initializing,
            4 => WdState::Coordinator,
            5 => WdState::ParticipateInElection,
            6 => WdState::StandForCoordinator,
            7 => WdState::Standby,
            8 => WdState::Lost,
            9 => WdState::InNetworkTrouble,
            10 => WdState::Shutdown,
            11 => WdState::AddMessageSent,
            _ => return None,
        })
    }
}

/// Who currently coordinates the cluster from our point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Master {
    Local,
    Peer(usize),
}

/// Side effects the embedding proxy must perform
#[derive(Debug, PartialEq)]
pub enum WdAction {
    /// Acquire the delegate IP (become the escalated node)
    Escalate,
    /// Release the delegate IP
    DeEscalate,
    /// Run this node operation against the local registry
    ExecuteFailover { request: NodeOpRequest },
    /// Mirror the coordinator's failover-in-progress flag
    SetSwitching(bool),
    /// Overwrite local backend state with the coordinator's
    ApplyBackendState {
        statuses: Vec<NodeStatus>,
        primary_node_id: i32,
    },
    /// Tear down both sockets of a peer
    ClosePeerConnections { peer_id: usize },
    /// Unrecoverable; the watchdog must exit
    FatalExit { reason: String },
}

/// Inputs to the state machine
#[derive(Debug)]
pub enum WdEvent {
    PacketReceived { peer_id: usize, packet: WdPacket },
    CommandFinished { command_id: u32, packet_type: PacketType, status: CommandStatus },
    NewOutboundConnection { peer_id: usize },
    NodeConnectionFound { peer_id: usize },
    NodeConnectionLost { peer_id: usize },
    RemoteNodeFound { peer_id: usize },
    RemoteNodeLost { peer_id: usize },
    NetworkLinkDown,
    QuorumChanged,
    TimerExpired,
}

/// What became of a locally raised failover request
#[derive(Debug)]
pub enum FailoverDisposition {
    Verdict(ArbiterVerdict),
    /// Forwarded to the coordinator; the answer arrives as a
    /// CmdReplyInData frame carrying this command id
    AwaitReply { command_id: u32 },
}

/// Identity and policy of the local node
#[derive(Debug, Clone)]
pub struct LocalNodeConfig {
    pub node_name: String,
    pub hostname: String,
    pub wd_port: u16,
    pub proxy_port: u16,
    pub priority: i32,
    pub auth_key: String,
}

pub struct StateMachine {
    pub config: LocalNodeConfig,
    state: WdState,
    started_at: Instant,
    state_changed_at: Instant,
    pub escalated: bool,
    pub quorum_status: i32,
    pub master: Option<Master>,
    pub peers: Vec<WatchdogPeer>,
    pub bus: CommandBus,
    pub consensus: ConsensusEngine,
    half_votes: bool,
    timer: Option<Instant>,
    last_beacon: Option<Instant>,
    /// The in-flight command that gates the current state transition
    state_command: Option<(u32, PacketType)>,
    /// Packets handed to peer send handles, kept for inspection
    outbox: Vec<(usize, WdPacket)>,
}

impl StateMachine {
    pub fn new(
        config: LocalNodeConfig,
        peer_addresses: Vec<PeerAddress>,
        consensus_settings: ConsensusSettings,
        now: Instant,
    ) -> Self {
        let cluster_size = peer_addresses.len() + 1;
        let half_votes = consensus_settings.enable_consensus_with_half_votes;
        let peers = peer_addresses
            .into_iter()
            .enumerate()
            .map(|(id, address)| WatchdogPeer::new(id, address))
            .collect();
        Self {
            config,
            state: WdState::Dead,
            started_at: now,
            state_changed_at: now,
            escalated: false,
            quorum_status: -1,
            master: None,
            peers,
            bus: CommandBus::new(),
            consensus: ConsensusEngine::new(consensus_settings, cluster_size),
            half_votes,
            timer: None,
            last_beacon: None,
            state_command: None,
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> WdState {
        self.state
    }

    /// Command id of the transition-gating command, when one is in
    /// flight
    pub fn state_command_id(&self) -> Option<u32> {
        self.state_command.map(|(id, _)| id)
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Peers we can currently talk to
    fn reachable_peer_ids(&self) -> Vec<usize> {
        self.peers
            .iter()
            .filter(|p| p.is_reachable())
            .map(|p| p.id)
            .collect()
    }

    pub fn standby_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.state == WdState::Standby)
            .count()
    }

    /// Sent packets since the last drain; used by the driver and by
    /// tests
    pub fn take_outbox(&mut self) -> Vec<(usize, WdPacket)> {
        std::mem::take(&mut self.outbox)
    }

    // -- message construction ----------------------------------------

    pub fn beacon(&self, now: Instant) -> BeaconMessage {
        BeaconMessage {
            state: self.state.as_u8(),
            seconds_since_startup: now.duration_since(self.started_at).as_secs(),
            seconds_since_state_change: now.duration_since(self.state_changed_at).as_secs(),
            quorum_status: self.quorum_status,
            standby_count: self.standby_count() as i32,
            escalated: self.escalated,
        }
    }

    fn node_info(&self, now: Instant, with_auth: bool) -> NodeInfoMessage {
        let auth_hash = if with_auth && !self.config.auth_key.is_empty() {
            Some(peer::auth_hash(
                self.state.as_u8(),
                self.config.wd_port,
                &self.config.auth_key,
            ))
        } else {
            None
        };
        NodeInfoMessage {
            node_name: self.config.node_name.clone(),
            hostname: self.config.hostname.clone(),
            wd_port: self.config.wd_port,
            proxy_port: self.config.proxy_port,
            priority: self.config.priority,
            beacon: self.beacon(now),
            auth_hash,
        }
    }

    // -- sending -----------------------------------------------------

    fn send_to(&mut self, peer_id: usize, packet: WdPacket, now: Instant) -> bool {
        self.outbox.push((peer_id, packet.clone()));
        match self.peers.get_mut(peer_id) {
            Some(peer) => peer.send(packet, now),
            None => false,
        }
    }

    fn broadcast(&mut self, packet: WdPacket, now: Instant) {
        for id in 0..self.peers.len() {
            self.send_to(id, packet.clone(), now);
        }
    }

    fn reply(&mut self, peer_id: usize, packet_type: PacketType, reply_to: &WdPacket, now: Instant) {
        let packet = WdPacket::empty(packet_type, reply_to.command_id);
        self.send_to(peer_id, packet, now);
    }

    /// Issue a tracked cluster command and push its packet to every
    /// reachable peer. Completion may fire synchronously when nothing
    /// is reachable.
    fn issue_command(
        &mut self,
        packet_type: PacketType,
        data: Bytes,
        timeout: Duration,
        now: Instant,
    ) -> (u32, Vec<WdAction>) {
        let recipients = self.reachable_peer_ids();
        let command_id = self.bus.issue(packet_type, &recipients, timeout, now);
        self.state_command = Some((command_id, packet_type));

        let mut finished = None;
        for peer_id in recipients {
            let packet = WdPacket::new(packet_type, command_id, data.clone());
            if self.send_to(peer_id, packet, now) {
                self.bus.record_sent(command_id, peer_id);
            } else if let Some(status) = self.bus.record_send_error(command_id, peer_id) {
                if status.is_finished() {
                    finished = Some(status);
                }
            }
        }
        if let Some(cmd) = self.bus.get(command_id) {
            if cmd.status.is_finished() {
                finished = Some(cmd.status);
            }
        }

        let mut actions = Vec::new();
        if let Some(status) = finished {
            self.bus.retire(command_id);
            actions.extend(self.handle_event(
                WdEvent::CommandFinished {
                    command_id,
                    packet_type,
                    status,
                },
                now,
            ));
        }
        (command_id, actions)
    }

    // -- state transitions -------------------------------------------

    pub fn start(&mut self, now: Instant) -> Vec<WdAction> {
        info!(node = self.config.node_name.as_str(), "watchdog starting");
        self.set_state(WdState::Loading, now)
    }

    fn set_state(&mut self, new_state: WdState, now: Instant) -> Vec<WdAction> {
        let old_state = self.state;
        if old_state == new_state {
            return Vec::new();
        }
        info!(
            from = old_state.as_str(),
            to = new_state.as_str(),
            "watchdog state change"
        );
        self.state = new_state;
        self.state_changed_at = now;
        self.timer = None;
        self.state_command = None;

        if old_state == WdState::Coordinator {
            // Our pending failover votes die with the coordinator seat
            self.consensus.clear();
        }

        self.on_enter(now)
    }

    fn on_enter(&mut self, now: Instant) -> Vec<WdAction> {
        let mut actions = Vec::new();
        match self.state {
            WdState::Loading => {
                let info = self.node_info(now, true);
                let reachable = self.reachable_peer_ids();
                for peer_id in reachable {
                    if let Ok(packet) =
                        WdPacket::with_json(PacketType::AddNode, 0, &info)
                    {
                        if self.send_to(peer_id, packet, now) {
                            self.peers[peer_id].state = WdState::AddMessageSent;
                        }
                    }
                }
                self.timer = Some(now + peer::MAX_SECS_WAIT_FOR_REPLY);
            }
            WdState::Joining => {
                self.master = None;
                // Fallback timer goes first: the command can complete
                // synchronously and move us on, with its own timer
                self.timer = Some(now + peer::MAX_SECS_WAIT_FOR_REPLY + Duration::from_secs(1));
                let (_, extra) = self.issue_command(
                    PacketType::ReqInfo,
                    Bytes::new(),
                    peer::MAX_SECS_WAIT_FOR_REPLY,
                    now,
                );
                actions.extend(extra);
            }
            WdState::Initializing => {
                self.timer = Some(now + Duration::from_secs(1));
            }
            WdState::StandForCoordinator => {
                let (_, extra) = self.issue_command(
                    PacketType::StandForCoordinator,
                    Bytes::new(),
                    ELECTION_COMMAND_TIMEOUT,
                    now,
                );
                actions.extend(extra);
            }
            WdState::ParticipateInElection => {
                self.timer = Some(now + Duration::from_secs(5));
            }
            WdState::Coordinator => {
                self.master = Some(Master::Local);
                self.last_beacon = Some(now);
                let (_, extra) = self.issue_command(
                    PacketType::DeclareCoordinator,
                    Bytes::new(),
                    ELECTION_COMMAND_TIMEOUT,
                    now,
                );
                actions.extend(extra);
            }
            WdState::Standby => {
                if let Some(Master::Peer(master_id)) = self.master {
                    let command_id = self.bus.issue(
                        PacketType::JoinCoordinator,
                        &[master_id],
                        JOIN_COMMAND_TIMEOUT,
                        now,
                    );
                    self.state_command = Some((command_id, PacketType::JoinCoordinator));
                    let packet = WdPacket::empty(PacketType::JoinCoordinator, command_id);
                    if self.send_to(master_id, packet, now) {
                        self.bus.record_sent(command_id, master_id);
                    } else {
                        self.bus.record_send_error(command_id, master_id);
                        actions.extend(self.set_state(WdState::Joining, now));
                    }
                } else {
                    actions.extend(self.set_state(WdState::Joining, now));
                }
            }
            WdState::InNetworkTrouble | WdState::Lost => {
                // Operating with stale authority is worse than dying;
                // healthchecks recorded while isolated cannot be
                // trusted until resynchronized
                actions.push(WdAction::FatalExit {
                    reason: format!(
                        "watchdog is in state {} and cannot continue",
                        self.state.as_str()
                    ),
                });
            }
            _ => {}
        }
        actions
    }

    // -- the event dispatcher ----------------------------------------

    pub fn handle_event(&mut self, event: WdEvent, now: Instant) -> Vec<WdAction> {
        match event {
            WdEvent::PacketReceived { peer_id, packet } => {
                self.handle_packet(peer_id, packet, now)
            }
            WdEvent::CommandFinished {
                command_id,
                packet_type,
                status,
            } => self.handle_command_finished(command_id, packet_type, status, now),
            WdEvent::NewOutboundConnection { peer_id }
            | WdEvent::NodeConnectionFound { peer_id } => {
                // Identify ourselves on every fresh link
                let info = self.node_info(now, true);
                if let Ok(packet) = WdPacket::with_json(PacketType::AddNode, 0, &info) {
                    self.send_to(peer_id, packet, now);
                }
                Vec::new()
            }
            WdEvent::RemoteNodeFound { peer_id } => {
                debug!(peer_id, "remote watchdog node is back");
                Vec::new()
            }
            WdEvent::RemoteNodeLost { peer_id } | WdEvent::NodeConnectionLost { peer_id } => {
                self.handle_peer_lost(peer_id, now)
            }
            WdEvent::NetworkLinkDown => self.set_state(WdState::InNetworkTrouble, now),
            WdEvent::QuorumChanged => self.handle_quorum_changed(now),
            WdEvent::TimerExpired => self.handle_timer(now),
        }
    }

    fn handle_peer_lost(&mut self, peer_id: usize, now: Instant) -> Vec<WdAction> {
        let mut actions = Vec::new();
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if peer.state != WdState::Shutdown {
                peer.state = WdState::Lost;
            }
            peer.drop_connections();
        }
        actions.push(WdAction::ClosePeerConnections { peer_id });

        for (command_id, status) in self.bus.cancel_for_peer(peer_id) {
            let packet_type = self
                .bus
                .get(command_id)
                .map(|c| c.packet_type)
                .unwrap_or(PacketType::Error);
            self.bus.retire(command_id);
            actions.extend(self.handle_event(
                WdEvent::CommandFinished {
                    command_id,
                    packet_type,
                    status,
                },
                now,
            ));
        }

        if self.master == Some(Master::Peer(peer_id)) {
            self.master = None;
            if self.state == WdState::Standby {
                warn!(peer_id, "coordinator lost, rejoining the cluster");
                actions.extend(self.set_state(WdState::Joining, now));
            }
        }
        if self.state == WdState::Coordinator {
            actions.extend(self.update_quorum(now));
        }
        actions
    }

    fn handle_timer(&mut self, now: Instant) -> Vec<WdAction> {
        match self.state {
            WdState::Loading => self.set_state(WdState::Joining, now),
            WdState::Joining => self.set_state(WdState::Initializing, now),
            WdState::Initializing => {
                if let Some(coordinator) = self
                    .peers
                    .iter()
                    .find(|p| p.state == WdState::Coordinator)
                    .map(|p| p.id)
                {
                    self.master = Some(Master::Peer(coordinator));
                    self.set_state(WdState::Standby, now)
                } else if self.reachable_peer_ids().is_empty() {
                    // Nobody else is alive; take the cluster
                    self.set_state(WdState::Coordinator, now)
                } else if self
                    .peers
                    .iter()
                    .any(|p| p.state == WdState::StandForCoordinator)
                {
                    self.set_state(WdState::ParticipateInElection, now)
                } else {
                    self.set_state(WdState::StandForCoordinator, now)
                }
            }
            WdState::ParticipateInElection => self.set_state(WdState::Joining, now),
            _ => Vec::new(),
        }
    }

    /// Periodic work; the driver calls this about once a second
    pub fn on_tick(&mut self, now: Instant, primary_in_quarantine: Option<usize>) -> Vec<WdAction> {
        let mut actions = Vec::new();

        if let Some(deadline) = self.timer {
            if now >= deadline {
                self.timer = None;
                actions.extend(self.handle_event(WdEvent::TimerExpired, now));
            }
        }

        for (command_id, packet_type) in self.bus.sweep_timeouts(now) {
            actions.extend(self.handle_event(
                WdEvent::CommandFinished {
                    command_id,
                    packet_type,
                    status: CommandStatus::FinishedTimeout,
                },
                now,
            ));
        }

        match self.state {
            WdState::Coordinator => {
                if self
                    .last_beacon
                    .map(|at| now.duration_since(at) >= BEACON_INTERVAL)
                    .unwrap_or(true)
                {
                    self.last_beacon = Some(now);
                    let beacon = self.beacon(now);
                    if let Ok(packet) =
                        WdPacket::with_json(PacketType::IAmCoordinator, 0, &beacon)
                    {
                        self.broadcast(packet, now);
                    }
                }
                actions.extend(self.sweep_consensus(now, primary_in_quarantine));
            }
            WdState::Standby => {
                if let Some(Master::Peer(master_id)) = self.master {
                    let silent_for = self.peers[master_id]
                        .last_rcv
                        .map(|at| now.duration_since(at))
                        .unwrap_or(Duration::MAX);
                    if silent_for >= 2 * BEACON_INTERVAL {
                        warn!("coordinator silent for two beacon intervals, rejoining");
                        actions.extend(self.set_state(WdState::Joining, now));
                    } else if silent_for >= BEACON_INTERVAL {
                        let command_id = self.bus.next_command_id();
                        let packet = WdPacket::empty(PacketType::ReqInfo, command_id);
                        self.send_to(master_id, packet, now);
                    }
                }
            }
            _ => {}
        }
        actions
    }

    /// Expire stale failover objects. The coordinator resigns when
    /// its own vote against the primary could not build consensus and
    /// the primary is stuck in quarantine.
    fn sweep_consensus(
        &mut self,
        now: Instant,
        primary_in_quarantine: Option<usize>,
    ) -> Vec<WdAction> {
        let mut actions = Vec::new();
        for expired in self.consensus.sweep(now) {
            warn!(kind = ?expired.kind, nodes = ?expired.nodes, "failover request expired without consensus");
            let local_voted = expired
                .voters
                .contains(&super::consensus::Voter::Local);
            let against_quarantined_primary = primary_in_quarantine
                .map(|primary| expired.nodes.contains(&primary))
                .unwrap_or(false);
            if expired.kind == NodeOpKind::Down && local_voted && against_quarantined_primary {
                warn!(
                    "could not get the cluster to fail over the quarantined primary, resigning from coordinator"
                );
                self.config.priority = -1;
                let packet = WdPacket::cluster_service(
                    self.bus.next_command_id(),
                    ClusterServiceEvent::ResigningFromMaster,
                );
                self.broadcast(packet, now);
                if self.escalated {
                    self.escalated = false;
                    actions.push(WdAction::DeEscalate);
                }
                actions.extend(self.set_state(WdState::Joining, now));
                return actions;
            }
        }
        actions
    }

    fn handle_command_finished(
        &mut self,
        command_id: u32,
        packet_type: PacketType,
        status: CommandStatus,
        now: Instant,
    ) -> Vec<WdAction> {
        debug!(command_id, ?packet_type, ?status, "cluster command finished");
        if self.state_command.map(|(id, _)| id) == Some(command_id) {
            self.state_command = None;
        }
        self.bus.retire(command_id);

        match (self.state, packet_type) {
            (WdState::Joining, PacketType::ReqInfo) => self.set_state(WdState::Initializing, now),
            (WdState::StandForCoordinator, PacketType::StandForCoordinator) => match status {
                CommandStatus::FinishedAllReplied | CommandStatus::FinishedTimeout => {
                    self.set_state(WdState::Coordinator, now)
                }
                CommandStatus::FinishedRejected => {
                    self.set_state(WdState::ParticipateInElection, now)
                }
                _ => self.set_state(WdState::Joining, now),
            },
            (WdState::Coordinator, PacketType::DeclareCoordinator) => match status {
                CommandStatus::FinishedAllReplied | CommandStatus::FinishedTimeout => {
                    info!("cluster accepted this node as coordinator");
                    self.update_quorum(now)
                }
                _ => {
                    warn!("cluster rejected our coordinator claim");
                    self.set_state(WdState::Joining, now)
                }
            },
            (WdState::Standby, PacketType::JoinCoordinator) => match status {
                CommandStatus::FinishedAllReplied => {
                    info!("joined the coordinator as a standby");
                    Vec::new()
                }
                _ => self.set_state(WdState::Joining, now),
            },
            _ => Vec::new(),
        }
    }

    fn handle_quorum_changed(&mut self, _now: Instant) -> Vec<WdAction> {
        if self.state != WdState::Coordinator {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.quorum_status >= 0 {
            if !self.escalated {
                info!("quorum holds, escalating");
                self.escalated = true;
                actions.push(WdAction::Escalate);
            }
        } else if self.escalated {
            // Keep the coordinator role, but not the delegate IP
            warn!("quorum lost, de-escalating while staying coordinator");
            self.escalated = false;
            actions.push(WdAction::DeEscalate);
        }
        actions
    }

    fn update_quorum(&mut self, now: Instant) -> Vec<WdAction> {
        let new_status = consensus::quorum_status(
            self.cluster_size(),
            self.standby_count(),
            self.half_votes,
        );
        if new_status != self.quorum_status {
            info!(old = self.quorum_status, new = new_status, "quorum status changed");
            self.quorum_status = new_status;
            return self.handle_event(WdEvent::QuorumChanged, now);
        }
        Vec::new()
    }

    // -- packet handling ---------------------------------------------

    fn handle_packet(&mut self, peer_id: usize, packet: WdPacket, now: Instant) -> Vec<WdAction> {
        if peer_id >= self.peers.len() {
            warn!(peer_id, "packet from unknown peer dropped");
            return Vec::new();
        }
        self.peers[peer_id].last_rcv = Some(now);

        // A peer announcing its shutdown is gone right now
        if packet.packet_type == PacketType::InformGoingDown {
            self.peers[peer_id].state = WdState::Shutdown;
            return self.handle_peer_lost(peer_id, now);
        }
        if packet.packet_type == PacketType::IAmInNetworkTrouble {
            return self.handle_peer_lost(peer_id, now);
        }

        // Replies to tracked commands route through the bus first
        if packet.packet_type.is_command_reply() {
            if let Some(status) =
                self.bus
                    .on_reply(packet.command_id, peer_id, packet.packet_type)
            {
                let mut actions = Vec::new();
                if status.is_finished() {
                    let packet_type = self
                        .bus
                        .get(packet.command_id)
                        .map(|c| c.packet_type)
                        .unwrap_or(packet.packet_type);
                    actions.extend(self.handle_event(
                        WdEvent::CommandFinished {
                            command_id: packet.command_id,
                            packet_type,
                            status,
                        },
                        now,
                    ));
                }
                return actions;
            }
        }

        match packet.packet_type {
            PacketType::AddNode => self.handle_add_node(peer_id, &packet, now),
            PacketType::ReqInfo => {
                let info = self.node_info(now, false);
                if let Ok(reply) =
                    WdPacket::with_json(PacketType::Info, packet.command_id, &info)
                {
                    self.send_to(peer_id, reply, now);
                }
                Vec::new()
            }
            PacketType::Info => {
                self.apply_node_info(peer_id, &packet, now);
                self.after_info_update(now)
            }
            PacketType::IAmCoordinator => self.handle_coordinator_beacon(peer_id, &packet, now),
            PacketType::DeclareCoordinator => self.handle_declare(peer_id, &packet, now),
            PacketType::StandForCoordinator => self.handle_contender(peer_id, &packet, now),
            PacketType::JoinCoordinator => self.handle_join(peer_id, &packet, now),
            PacketType::ClusterService => self.handle_cluster_service(peer_id, &packet, now),
            PacketType::RemoteFailoverRequest => self.handle_remote_failover(peer_id, &packet, now),
            PacketType::FailoverStart => {
                if self.master == Some(Master::Peer(peer_id)) {
                    vec![WdAction::SetSwitching(true)]
                } else {
                    Vec::new()
                }
            }
            PacketType::FailoverEnd => self.handle_failover_end(peer_id, &packet),
            PacketType::FailoverWaitingForConsensus => {
                // The coordinator is collecting votes; repeat any
                // quarantine observation we are sitting on
                debug!(peer_id, "coordinator is waiting for failover consensus");
                Vec::new()
            }
            PacketType::AskForPoolConfig => {
                let reply = WdPacket::new(
                    PacketType::PoolConfigData,
                    packet.command_id,
                    Bytes::new(),
                );
                self.send_to(peer_id, reply, now);
                Vec::new()
            }
            PacketType::QuorumLost => {
                debug!(peer_id, "peer reports its quorum is lost");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_add_node(&mut self, peer_id: usize, packet: &WdPacket, now: Instant) -> Vec<WdAction> {
        let info: NodeInfoMessage = match packet.json() {
            Ok(info) => info,
            Err(e) => {
                warn!(peer_id, error = %e, "malformed AddNode message");
                self.reply(peer_id, PacketType::Reject, packet, now);
                return vec![WdAction::ClosePeerConnections { peer_id }];
            }
        };

        let authenticated = peer::verify_auth_hash(
            info.beacon.state,
            info.wd_port,
            &self.config.auth_key,
            info.auth_hash.as_deref(),
        );
        if !authenticated {
            warn!(
                peer_id,
                node = info.node_name.as_str(),
                "AddNode authentication failed, make sure the auth key matches on all nodes"
            );
            self.reply(peer_id, PacketType::Reject, packet, now);
            return vec![WdAction::ClosePeerConnections { peer_id }];
        }

        {
            let peer = &mut self.peers[peer_id];
            peer.node_name = info.node_name.clone();
            peer.priority = info.priority;
            peer.apply_beacon(&info.beacon, now);
        }
        debug!(peer_id, node = info.node_name.as_str(), "peer added to cluster view");

        self.reply(peer_id, PacketType::Accept, packet, now);
        let reply_info = self.node_info(now, false);
        if let Ok(reply) = WdPacket::with_json(PacketType::Info, packet.command_id, &reply_info) {
            self.send_to(peer_id, reply, now);
        }
        // A joining peer should learn who coordinates right away
        if self.state == WdState::Coordinator {
            let beacon = self.beacon(now);
            if let Ok(reply) = WdPacket::with_json(PacketType::IAmCoordinator, 0, &beacon) {
                self.send_to(peer_id, reply, now);
            }
        }
        Vec::new()
    }

    fn apply_node_info(&mut self, peer_id: usize, packet: &WdPacket, now: Instant) {
        if let Ok(info) = packet.json::<NodeInfoMessage>() {
            let peer = &mut self.peers[peer_id];
            peer.node_name = info.node_name;
            peer.priority = info.priority;
            peer.apply_beacon(&info.beacon, now);
        }
    }

    fn after_info_update(&mut self, now: Instant) -> Vec<WdAction> {
        if self.state == WdState::Loading {
            let all_replied = !self
                .peers
                .iter()
                .any(|p| p.state == WdState::AddMessageSent);
            if all_replied {
                return self.set_state(WdState::Initializing, now);
            }
        }
        Vec::new()
    }

    fn handle_coordinator_beacon(
        &mut self,
        peer_id: usize,
        packet: &WdPacket,
        now: Instant,
    ) -> Vec<WdAction> {
        match packet.json::<BeaconMessage>() {
            Ok(beacon) => self.peers[peer_id].apply_beacon(&beacon, now),
            Err(_) => {
                // Keep the claim but without beacon data; arbitration
                // will treat it as insufficient
                self.peers[peer_id].state = WdState::Coordinator;
                self.peers[peer_id].state_changed_at = None;
            }
        }
        self.peers[peer_id].state = WdState::Coordinator;

        match self.state {
            WdState::Coordinator => self.handle_split_brain(peer_id, now),
            WdState::Standby => {
                match self.master {
                    Some(Master::Peer(master_id)) if master_id == peer_id => Vec::new(),
                    Some(_) => {
                        // Someone else besides our master claims the
                        // cluster; let the coordinators fight it out
                        warn!(peer_id, "second coordinator detected from standby");
                        let packet = WdPacket::cluster_service(
                            self.bus.next_command_id(),
                            ClusterServiceEvent::SplitBrain,
                        );
                        self.broadcast(packet, now);
                        Vec::new()
                    }
                    None => {
                        self.master = Some(Master::Peer(peer_id));
                        Vec::new()
                    }
                }
            }
            WdState::ParticipateInElection => {
                self.master = Some(Master::Peer(peer_id));
                self.set_state(WdState::Joining, now)
            }
            _ => Vec::new(),
        }
    }

    /// Both we and a peer claim the coordinator seat; decide who keeps
    /// it, in deterministic rule order
    fn handle_split_brain(&mut self, peer_id: usize, now: Instant) -> Vec<WdAction> {
        match self.split_brain_keep_local(peer_id) {
            None => {
                warn!(peer_id, "split brain with insufficient data, forcing re-election");
                let packet = WdPacket::cluster_service(
                    self.bus.next_command_id(),
                    ClusterServiceEvent::NeedsElection,
                );
                self.send_to(peer_id, packet, now);
                self.set_state(WdState::Joining, now)
            }
            Some(false) => {
                warn!(
                    peer = self.peers[peer_id].node_name.as_str(),
                    "split brain resolved in favor of the remote node, resigning"
                );
                let packet = WdPacket::cluster_service(
                    self.bus.next_command_id(),
                    ClusterServiceEvent::IAmNotTrueMaster,
                );
                self.broadcast(packet, now);
                let mut actions = Vec::new();
                if self.escalated {
                    self.escalated = false;
                    actions.push(WdAction::DeEscalate);
                }
                actions.extend(self.set_state(WdState::Joining, now));
                actions
            }
            Some(true) => {
                info!(
                    peer = self.peers[peer_id].node_name.as_str(),
                    "split brain resolved in our favor, asking the remote node to step down"
                );
                let packet = WdPacket::cluster_service(
                    self.bus.next_command_id(),
                    ClusterServiceEvent::IAmTrueMaster,
                );
                self.send_to(peer_id, packet, now);
                Vec::new()
            }
        }
    }

    /// The ordered tie-break: escalation, quorum, standby count, seat
    /// age. None when the remote beacon lacks the data to compare.
    pub fn split_brain_keep_local(&self, peer_id: usize) -> Option<bool> {
        if self.state != WdState::Coordinator {
            return None;
        }
        let peer = self.peers.get(peer_id)?;
        if peer.state != WdState::Coordinator {
            return None;
        }
        let peer_seat_age = peer.state_changed_at?;

        if peer.escalated != self.escalated {
            // Whoever holds the delegate IP keeps the cluster
            return Some(!peer.escalated);
        }
        if peer.quorum_status != self.quorum_status {
            return Some(self.quorum_status > peer.quorum_status);
        }
        let local_standbys = self.standby_count() as i32;
        if peer.standby_count != local_standbys {
            return Some(local_standbys > peer.standby_count);
        }
        // The older seat wins
        Some(peer_seat_age >= self.state_changed_at)
    }

    fn handle_declare(&mut self, peer_id: usize, packet: &WdPacket, now: Instant) -> Vec<WdAction> {
        let peer_priority = self.peers[peer_id].priority;
        match self.state {
            WdState::ParticipateInElection | WdState::Initializing | WdState::Joining
            | WdState::Loading => {
                if peer_priority >= self.config.priority {
                    self.reply(peer_id, PacketType::Accept, packet, now);
                    self.peers[peer_id].state = WdState::Coordinator;
                    self.master = Some(Master::Peer(peer_id));
                    self.set_state(WdState::Initializing, now)
                } else {
                    self.reply(peer_id, PacketType::Reject, packet, now);
                    Vec::new()
                }
            }
            WdState::Standby => {
                // A new election concluded; follow the new coordinator
                self.reply(peer_id, PacketType::Accept, packet, now);
                self.peers[peer_id].state = WdState::Coordinator;
                self.master = Some(Master::Peer(peer_id));
                self.set_state(WdState::Joining, now)
            }
            WdState::StandForCoordinator | WdState::Coordinator => {
                if peer_priority > self.config.priority {
                    self.reply(peer_id, PacketType::Accept, packet, now);
                    self.peers[peer_id].state = WdState::Coordinator;
                    self.master = Some(Master::Peer(peer_id));
                    self.set_state(WdState::Initializing, now)
                } else {
                    self.reply(peer_id, PacketType::Reject, packet, now);
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn handle_contender(&mut self, peer_id: usize, packet: &WdPacket, now: Instant) -> Vec<WdAction> {
        let peer_priority = self.peers[peer_id].priority;
        self.peers[peer_id].state = WdState::StandForCoordinator;

        match self.state {
            WdState::Loading | WdState::Joining | WdState::Initializing => {
                // A contest is already running; join on the right side
                if self.config.priority > peer_priority {
                    self.reply(peer_id, PacketType::Reject, packet, now);
                    self.set_state(WdState::StandForCoordinator, now)
                } else {
                    self.reply(peer_id, PacketType::Accept, packet, now);
                    self.set_state(WdState::ParticipateInElection, now)
                }
            }
            WdState::StandForCoordinator => {
                if self.config.priority > peer_priority {
                    self.reply(peer_id, PacketType::Reject, packet, now);
                    Vec::new()
                } else if self.config.priority < peer_priority {
                    self.reply(peer_id, PacketType::Accept, packet, now);
                    self.set_state(WdState::ParticipateInElection, now)
                } else {
                    // Same priority: the node that has been up longer
                    // continues standing
                    let local_uptime = now.duration_since(self.started_at).as_secs();
                    if self.peers[peer_id].seconds_since_startup > local_uptime {
                        self.reply(peer_id, PacketType::Accept, packet, now);
                        self.set_state(WdState::ParticipateInElection, now)
                    } else {
                        self.reply(peer_id, PacketType::Reject, packet, now);
                        Vec::new()
                    }
                }
            }
            WdState::Coordinator => {
                // We already hold the seat; remind the contender
                self.reply(peer_id, PacketType::Reject, packet, now);
                let beacon = self.beacon(now);
                if let Ok(reply) = WdPacket::with_json(PacketType::IAmCoordinator, 0, &beacon) {
                    self.send_to(peer_id, reply, now);
                }
                Vec::new()
            }
            _ => {
                self.reply(peer_id, PacketType::Accept, packet, now);
                Vec::new()
            }
        }
    }

    fn handle_join(&mut self, peer_id: usize, packet: &WdPacket, now: Instant) -> Vec<WdAction> {
        if self.state != WdState::Coordinator {
            self.reply(peer_id, PacketType::Reject, packet, now);
            return Vec::new();
        }
        self.reply(peer_id, PacketType::Accept, packet, now);
        self.peers[peer_id].state = WdState::Standby;
        info!(
            peer = self.peers[peer_id].node_name.as_str(),
            standbys = self.standby_count(),
            "standby joined the cluster"
        );
        let ask = WdPacket::empty(PacketType::AskForPoolConfig, self.bus.next_command_id());
        self.send_to(peer_id, ask, now);
        self.update_quorum(now)
    }

    fn handle_cluster_service(
        &mut self,
        peer_id: usize,
        packet: &WdPacket,
        now: Instant,
    ) -> Vec<WdAction> {
        let Some(event) = packet.cluster_service_event() else {
            warn!(peer_id, "cluster service message without a valid sub-type");
            return Vec::new();
        };
        match event {
            ClusterServiceEvent::IAmTrueMaster => {
                if self.state == WdState::Coordinator {
                    // The remote insists; run the same arbitration
                    self.peers[peer_id].state = WdState::Coordinator;
                    self.handle_split_brain(peer_id, now)
                } else {
                    self.master = Some(Master::Peer(peer_id));
                    self.peers[peer_id].state = WdState::Coordinator;
                    Vec::new()
                }
            }
            ClusterServiceEvent::IAmNotTrueMaster => {
                self.peers[peer_id].state = WdState::Joining;
                if self.master == Some(Master::Peer(peer_id)) {
                    self.master = None;
                    if self.state == WdState::Standby {
                        return self.set_state(WdState::Joining, now);
                    }
                }
                Vec::new()
            }
            ClusterServiceEvent::ResigningFromMaster => {
                self.peers[peer_id].state = WdState::Joining;
                if self.master == Some(Master::Peer(peer_id)) {
                    self.master = None;
                    warn!(peer_id, "coordinator resigned, restarting cluster discovery");
                    return self.set_state(WdState::Joining, now);
                }
                Vec::new()
            }
            ClusterServiceEvent::NeedsElection => {
                warn!(peer_id, "peer requested a new election");
                self.set_state(WdState::Joining, now)
            }
            ClusterServiceEvent::SplitBrain => {
                if self.state == WdState::Coordinator {
                    // Make our claim visible so arbitration can run
                    let beacon = self.beacon(now);
                    if let Ok(reply) =
                        WdPacket::with_json(PacketType::IAmCoordinator, 0, &beacon)
                    {
                        self.broadcast(reply, now);
                    }
                }
                Vec::new()
            }
            ClusterServiceEvent::QuorumLost | ClusterServiceEvent::QuorumFound => {
                debug!(peer_id, ?event, "coordinator quorum report");
                Vec::new()
            }
            ClusterServiceEvent::InvalidVersion => {
                warn!(peer_id, "peer rejected us as an incompatible version");
                Vec::new()
            }
        }
    }

    // -- failover votes ----------------------------------------------

    /// A locally observed node failure wants cluster arbitration
    pub fn handle_local_failover(
        &mut self,
        request: &NodeOpRequest,
        now: Instant,
    ) -> (FailoverDisposition, Vec<WdAction>) {
        match self.state {
            WdState::Coordinator => {
                let verdict = self.consensus.submit(
                    request.kind,
                    &request.nodes,
                    request.flags,
                    super::consensus::Voter::Local,
                    self.quorum_status >= 0,
                    now,
                );
                let actions = self.after_verdict(verdict, request, None, now);
                (FailoverDisposition::Verdict(verdict), actions)
            }
            WdState::Standby => {
                let Some(Master::Peer(master_id)) = self.master else {
                    return (
                        FailoverDisposition::Verdict(ArbiterVerdict::NoQuorum),
                        Vec::new(),
                    );
                };
                let message = FailoverRequestMessage {
                    kind: request.kind,
                    nodes: request.nodes.clone(),
                    flags: request.flags,
                };
                let command_id = self.bus.issue(
                    PacketType::RemoteFailoverRequest,
                    &[master_id],
                    peer::MAX_SECS_WAIT_FOR_REPLY,
                    now,
                );
                match WdPacket::with_json(PacketType::RemoteFailoverRequest, command_id, &message)
                {
                    Ok(packet) => {
                        if self.send_to(master_id, packet, now) {
                            self.bus.record_sent(command_id, master_id);
                            (FailoverDisposition::AwaitReply { command_id }, Vec::new())
                        } else {
                            self.bus.retire(command_id);
                            (
                                FailoverDisposition::Verdict(ArbiterVerdict::NoQuorum),
                                Vec::new(),
                            )
                        }
                    }
                    Err(_) => (
                        FailoverDisposition::Verdict(ArbiterVerdict::NoQuorum),
                        Vec::new(),
                    ),
                }
            }
            _ => {
                // The cluster is between coordinators; nothing can be
                // decided right now
                (
                    FailoverDisposition::Verdict(ArbiterVerdict::NoQuorum),
                    Vec::new(),
                )
            }
        }
    }

    /// A peer forwarded its failover vote to us, the coordinator
    fn handle_remote_failover(
        &mut self,
        peer_id: usize,
        packet: &WdPacket,
        now: Instant,
    ) -> Vec<WdAction> {
        if self.state != WdState::Coordinator {
            self.reply(peer_id, PacketType::Error, packet, now);
            return Vec::new();
        }
        let message: FailoverRequestMessage = match packet.json() {
            Ok(message) => message,
            Err(e) => {
                warn!(peer_id, error = %e, "malformed failover request");
                self.reply(peer_id, PacketType::Error, packet, now);
                return Vec::new();
            }
        };

        let verdict = self.consensus.submit(
            message.kind,
            &message.nodes,
            message.flags,
            super::consensus::Voter::Peer(peer_id),
            self.quorum_status >= 0,
            now,
        );

        let verdict_str = match verdict {
            ArbiterVerdict::Proceed | ArbiterVerdict::WillBeDone => {
                FailoverVerdictMessage::WILL_BE_DONE
            }
            ArbiterVerdict::BuildingConsensus => FailoverVerdictMessage::BUILDING_CONSENSUS,
            ArbiterVerdict::NoQuorum => FailoverVerdictMessage::NO_QUORUM,
            ArbiterVerdict::ConsensusMayFail => FailoverVerdictMessage::MAY_FAIL,
        };
        if let Ok(reply) = WdPacket::with_json(
            PacketType::CmdReplyInData,
            packet.command_id,
            &FailoverVerdictMessage::new(verdict_str),
        ) {
            self.send_to(peer_id, reply, now);
        }

        let mut request = NodeOpRequest::new(message.kind, message.nodes);
        request.flags = NodeOpFlags {
            from_watchdog: true,
            ..message.flags
        };
        self.after_verdict(verdict, &request, Some(peer_id), now)
    }

    /// Common tail after a consensus decision
    fn after_verdict(
        &mut self,
        verdict: ArbiterVerdict,
        request: &NodeOpRequest,
        remote_origin: Option<usize>,
        now: Instant,
    ) -> Vec<WdAction> {
        match verdict {
            ArbiterVerdict::Proceed => {
                let start = WdPacket::empty(PacketType::FailoverStart, self.bus.next_command_id());
                self.broadcast(start, now);
                if remote_origin.is_some() {
                    // The vote came from a peer: the coordinator
                    // executes on its behalf
                    vec![
                        WdAction::SetSwitching(true),
                        WdAction::ExecuteFailover {
                            request: request.clone(),
                        },
                    ]
                } else {
                    vec![WdAction::SetSwitching(true)]
                }
            }
            ArbiterVerdict::BuildingConsensus => {
                // Nudge peers into repeating reports they are sitting
                // on, e.g. dormant quarantine observations
                let packet = WdPacket::empty(
                    PacketType::FailoverWaitingForConsensus,
                    self.bus.next_command_id(),
                );
                self.broadcast(packet, now);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// The embedding proxy finished executing a failover we approved;
    /// tell the cluster and carry the resulting state to the standbys
    pub fn on_failover_executed(
        &mut self,
        statuses: Vec<NodeStatus>,
        primary_node_id: i32,
        now: Instant,
    ) -> Vec<WdAction> {
        if self.state != WdState::Coordinator {
            return Vec::new();
        }
        let message = super::packet::BackendStateMessage {
            statuses,
            primary_node_id,
        };
        if let Ok(packet) = WdPacket::with_json(
            PacketType::FailoverEnd,
            self.bus.next_command_id(),
            &message,
        ) {
            self.broadcast(packet, now);
        }
        vec![WdAction::SetSwitching(false)]
    }

    fn handle_failover_end(&mut self, peer_id: usize, packet: &WdPacket) -> Vec<WdAction> {
        if self.master != Some(Master::Peer(peer_id)) {
            return Vec::new();
        }
        let mut actions = vec![WdAction::SetSwitching(false)];
        if let Ok(message) = packet.json::<super::packet::BackendStateMessage>() {
            actions.push(WdAction::ApplyBackendState {
                statuses: message.statuses,
                primary_node_id: message.primary_node_id,
            });
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(priority: i32) -> LocalNodeConfig {
        LocalNodeConfig {
            node_name: "portero-0".into(),
            hostname: "10.0.0.1".into(),
            wd_port: 9000,
            proxy_port: 9999,
            priority,
            auth_key: String::new(),
        }
    }

    fn peer_addr(n: usize) -> PeerAddress {
        PeerAddress {
            hostname: format!("10.0.0.{}", n + 2),
            wd_port: 9000,
            proxy_port: 9999,
        }
    }

    fn machine(priority: i32, peer_count: usize) -> StateMachine {
        StateMachine::new(
            config(priority),
            (0..peer_count).map(peer_addr).collect(),
            ConsensusSettings::default(),
            Instant::now(),
        )
    }

    /// Wire a fake channel into a peer so it counts as reachable
    fn make_reachable(fsm: &mut StateMachine, peer_id: usize) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        std::mem::forget(rx);
        fsm.peers[peer_id].client_tx = Some(tx);
    }

    fn beacon(
        state: WdState,
        since_state_change: u64,
        quorum: i32,
        standbys: i32,
        escalated: bool,
    ) -> BeaconMessage {
        BeaconMessage {
            state: state.as_u8(),
            seconds_since_startup: 1000,
            seconds_since_state_change: since_state_change,
            quorum_status: quorum,
            standby_count: standbys,
            escalated,
        }
    }

    fn sent_types(fsm: &mut StateMachine) -> Vec<(usize, PacketType)> {
        fsm.take_outbox()
            .into_iter()
            .map(|(id, p)| (id, p.packet_type))
            .collect()
    }

    #[test]
    fn test_state_names_and_codes_round_trip() {
        for code in 0..12u8 {
            let state = WdState::from_u8(code).unwrap();
            assert_eq!(state.as_u8(), code);
            assert!(!state.as_str().is_empty());
        }
        assert_eq!(WdState::from_u8(12), None);
        assert_eq!(WdState::Coordinator.as_str(), "MASTER");
    }

    #[test]
    fn test_lone_node_walks_to_coordinator_and_escalates() {
        // No peers configured: the node owns the whole cluster
        let mut fsm = machine(50, 0);
        let mut now = Instant::now();
        fsm.start(now);
        assert_eq!(fsm.state(), WdState::Loading);

        now += Duration::from_secs(6);
        let actions = fsm.on_tick(now, None);
        // Loading -> Joining -> (empty ReqInfo completes) ->
        // Initializing; one second later the timer promotes us
        assert_eq!(fsm.state(), WdState::Initializing);
        assert!(actions.is_empty());

        now += Duration::from_secs(1);
        let actions = fsm.on_tick(now, None);
        assert_eq!(fsm.state(), WdState::Coordinator);
        assert_eq!(fsm.master, Some(Master::Local));
        // A single-node cluster holds quorum by itself
        assert_eq!(fsm.quorum_status, 1);
        assert!(actions.contains(&WdAction::Escalate));
        assert!(fsm.escalated);
    }

    #[test]
    fn test_lone_node_in_two_node_cluster_gets_no_quorum() {
        let mut fsm = machine(50, 1);
        let mut now = Instant::now();
        fsm.start(now);

        now += Duration::from_secs(6);
        fsm.on_tick(now, None);
        now += Duration::from_secs(1);
        let actions = fsm.on_tick(now, None);

        assert_eq!(fsm.state(), WdState::Coordinator);
        // The unreachable peer denies quorum: coordinator without
        // escalation
        assert_eq!(fsm.quorum_status, -1);
        assert!(!actions.contains(&WdAction::Escalate));
        assert!(!fsm.escalated);
    }

    #[test]
    fn test_loading_contender_with_lower_priority_is_rejected() {
        let mut fsm = machine(50, 1);
        let now = Instant::now();
        fsm.start(now);
        fsm.take_outbox();

        fsm.peers[0].priority = 10;
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::StandForCoordinator, 77),
            },
            now,
        );
        let sent = sent_types(&mut fsm);
        assert!(sent.contains(&(0, PacketType::Reject)));
        assert_eq!(fsm.state(), WdState::StandForCoordinator);
    }

    #[test]
    fn test_loading_contender_with_higher_priority_is_accepted() {
        let mut fsm = machine(10, 1);
        let now = Instant::now();
        fsm.start(now);
        fsm.take_outbox();

        fsm.peers[0].priority = 50;
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::StandForCoordinator, 77),
            },
            now,
        );
        let sent = sent_types(&mut fsm);
        assert!(sent.contains(&(0, PacketType::Accept)));
        assert_eq!(fsm.state(), WdState::ParticipateInElection);
    }

    #[test]
    fn test_equal_priority_contest_tie_breaks_on_startup_time() {
        // Scenario: both stand for coordinator with equal priority;
        // the node that booted earlier keeps standing
        let mut fsm = machine(50, 1);
        let mut now = Instant::now();
        fsm.start(now);
        now += Duration::from_secs(30);
        make_reachable(&mut fsm, 0);
        let _ = fsm.set_state(WdState::StandForCoordinator, now);
        fsm.take_outbox();

        // The peer is older than our 30 seconds of uptime: it wins
        fsm.peers[0].priority = 50;
        fsm.peers[0].seconds_since_startup = 1000;
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::StandForCoordinator, 5),
            },
            now,
        );
        assert!(sent_types(&mut fsm).contains(&(0, PacketType::Accept)));
        assert_eq!(fsm.state(), WdState::ParticipateInElection);

        // Fresh machine against a younger peer: we keep standing
        let mut fsm = machine(50, 1);
        let mut now = Instant::now();
        fsm.start(now);
        now += Duration::from_secs(3000);
        make_reachable(&mut fsm, 0);
        let _ = fsm.set_state(WdState::StandForCoordinator, now);
        fsm.take_outbox();

        fsm.peers[0].priority = 50;
        fsm.peers[0].seconds_since_startup = 10;
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::StandForCoordinator, 5),
            },
            now,
        );
        assert!(sent_types(&mut fsm).contains(&(0, PacketType::Reject)));
        assert_eq!(fsm.state(), WdState::StandForCoordinator);
    }

    #[test]
    fn test_election_completes_when_all_peers_accept() {
        let mut fsm = machine(50, 2);
        let now = Instant::now();
        fsm.start(now);
        make_reachable(&mut fsm, 0);
        make_reachable(&mut fsm, 1);
        let _ = fsm.set_state(WdState::StandForCoordinator, now);

        let command_id = fsm
            .take_outbox()
            .iter()
            .find(|(_, p)| p.packet_type == PacketType::StandForCoordinator)
            .map(|(_, p)| p.command_id)
            .unwrap();

        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::Accept, command_id),
            },
            now,
        );
        assert_eq!(fsm.state(), WdState::StandForCoordinator);
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 1,
                packet: WdPacket::empty(PacketType::Accept, command_id),
            },
            now,
        );
        assert_eq!(fsm.state(), WdState::Coordinator);
    }

    #[test]
    fn test_rejected_candidacy_moves_to_participate() {
        let mut fsm = machine(50, 1);
        let now = Instant::now();
        fsm.start(now);
        make_reachable(&mut fsm, 0);
        let _ = fsm.set_state(WdState::StandForCoordinator, now);
        let command_id = fsm
            .take_outbox()
            .iter()
            .find(|(_, p)| p.packet_type == PacketType::StandForCoordinator)
            .map(|(_, p)| p.command_id)
            .unwrap();

        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::Reject, command_id),
            },
            now,
        );
        assert_eq!(fsm.state(), WdState::ParticipateInElection);
    }

    fn coordinator_fixture(peer_count: usize) -> (StateMachine, Instant) {
        let mut fsm = machine(50, peer_count);
        let now = Instant::now();
        fsm.start(now);
        for id in 0..peer_count {
            make_reachable(&mut fsm, id);
        }
        let _ = fsm.set_state(WdState::Coordinator, now);
        // Unanswered declare command times out; the seat is taken
        let _ = fsm.on_tick(now + Duration::from_secs(4), None);
        fsm.take_outbox();
        (fsm, now + Duration::from_secs(4))
    }

    #[test]
    fn test_coordinator_beacons_every_ten_seconds() {
        let (mut fsm, now) = coordinator_fixture(1);

        let _ = fsm.on_tick(now + BEACON_INTERVAL, None);
        let beacons: Vec<_> = fsm
            .take_outbox()
            .into_iter()
            .filter(|(_, p)| p.packet_type == PacketType::IAmCoordinator)
            .collect();
        assert_eq!(beacons.len(), 1);

        // No second beacon inside the interval
        let _ = fsm.on_tick(now + BEACON_INTERVAL + Duration::from_secs(3), None);
        assert!(fsm
            .take_outbox()
            .iter()
            .all(|(_, p)| p.packet_type != PacketType::IAmCoordinator));
    }

    #[test]
    fn test_join_grows_standbys_and_quorum() {
        let (mut fsm, now) = coordinator_fixture(2);
        assert_eq!(fsm.quorum_status, -1);

        let actions = fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::JoinCoordinator, 9),
            },
            now,
        );
        // Three-node cluster with one standby: quorum holds
        assert_eq!(fsm.standby_count(), 1);
        assert_eq!(fsm.quorum_status, 1);
        assert!(actions.contains(&WdAction::Escalate));
        let sent = sent_types(&mut fsm);
        assert!(sent.contains(&(0, PacketType::Accept)));
        assert!(sent.contains(&(0, PacketType::AskForPoolConfig)));
    }

    #[test]
    fn test_quorum_loss_deescalates_but_keeps_the_seat() {
        let (mut fsm, now) = coordinator_fixture(2);
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::JoinCoordinator, 9),
            },
            now,
        );
        assert!(fsm.escalated);

        let actions = fsm.handle_event(WdEvent::RemoteNodeLost { peer_id: 0 }, now);
        assert!(actions.contains(&WdAction::DeEscalate));
        assert_eq!(fsm.state(), WdState::Coordinator);
        assert!(!fsm.escalated);
    }

    #[test]
    fn test_split_brain_escalated_node_wins() {
        // Scenario: we are coordinator without the delegate IP; the
        // remote coordinator holds it. Rule one: the remote stays.
        let (mut fsm, now) = coordinator_fixture(2);
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::JoinCoordinator, 9),
            },
            now,
        );
        fsm.escalated = false;
        fsm.take_outbox();

        let remote = beacon(WdState::Coordinator, 500, 1, 1, true);
        let packet = WdPacket::with_json(PacketType::IAmCoordinator, 0, &remote).unwrap();
        fsm.handle_event(WdEvent::PacketReceived { peer_id: 1, packet }, now);

        assert_eq!(fsm.state(), WdState::Joining);
        let sent = sent_types(&mut fsm);
        let not_true_master_broadcasts = fsm_count(&sent, PacketType::ClusterService);
        assert!(not_true_master_broadcasts >= 1);
    }

    fn fsm_count(sent: &[(usize, PacketType)], t: PacketType) -> usize {
        sent.iter().filter(|(_, pt)| *pt == t).count()
    }

    #[test]
    fn test_split_brain_local_escalated_keeps_seat() {
        let (mut fsm, now) = coordinator_fixture(2);
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::JoinCoordinator, 9),
            },
            now,
        );
        assert!(fsm.escalated);
        fsm.take_outbox();

        let remote = beacon(WdState::Coordinator, 500, 1, 1, false);
        let packet = WdPacket::with_json(PacketType::IAmCoordinator, 0, &remote).unwrap();
        fsm.handle_event(WdEvent::PacketReceived { peer_id: 1, packet }, now);

        assert_eq!(fsm.state(), WdState::Coordinator);
        let outbox = fsm.take_outbox();
        let true_master = outbox.iter().any(|(id, p)| {
            *id == 1
                && p.cluster_service_event() == Some(ClusterServiceEvent::IAmTrueMaster)
        });
        assert!(true_master);
    }

    #[test]
    fn test_split_brain_decisions_are_antisymmetric() {
        // For every asymmetric snapshot pair, exactly one side keeps
        // the seat
        let cases = [
            // (escalated, quorum, standbys) local vs remote
            ((true, 1, 1), (false, 1, 1)),
            ((false, 1, 1), (true, 1, 1)),
            ((false, 1, 2), (false, -1, 2)),
            ((false, -1, 2), (false, 1, 2)),
            ((true, 1, 3), (true, 1, 1)),
            ((true, 1, 1), (true, 1, 3)),
        ];
        for ((l_esc, l_q, l_sb), (r_esc, r_q, r_sb)) in cases {
            let (mut a, now_a) = coordinator_fixture(4);
            a.escalated = l_esc;
            a.quorum_status = l_q;
            for id in 0..(l_sb as usize) {
                a.peers[id].state = WdState::Standby;
            }
            let remote_peer = 3;
            a.peers[remote_peer].state = WdState::Coordinator;
            a.peers[remote_peer].apply_beacon(
                &beacon(WdState::Coordinator, 500, r_q, r_sb, r_esc),
                now_a,
            );

            let (mut b, now_b) = coordinator_fixture(4);
            b.escalated = r_esc;
            b.quorum_status = r_q;
            for id in 0..(r_sb as usize) {
                b.peers[id].state = WdState::Standby;
            }
            b.peers[remote_peer].state = WdState::Coordinator;
            b.peers[remote_peer].apply_beacon(
                &beacon(WdState::Coordinator, 500, l_q, l_sb, l_esc),
                now_b,
            );

            let a_keeps = a.split_brain_keep_local(remote_peer).unwrap();
            let b_keeps = b.split_brain_keep_local(remote_peer).unwrap();
            assert_ne!(
                a_keeps, b_keeps,
                "case {:?} vs {:?} both said keep={}",
                (l_esc, l_q, l_sb),
                (r_esc, r_q, r_sb),
                a_keeps
            );
        }
    }

    #[test]
    fn test_split_brain_without_beacon_data_forces_election() {
        let (mut fsm, now) = coordinator_fixture(1);
        // The peer claims the seat but its beacon cannot be parsed
        let packet = WdPacket::new(
            PacketType::IAmCoordinator,
            0,
            Bytes::from_static(b"not json"),
        );
        fsm.handle_event(WdEvent::PacketReceived { peer_id: 0, packet }, now);

        assert_eq!(fsm.state(), WdState::Joining);
        let outbox = fsm.take_outbox();
        assert!(outbox.iter().any(|(id, p)| *id == 0
            && p.cluster_service_event() == Some(ClusterServiceEvent::NeedsElection)));
    }

    #[test]
    fn test_standby_rejoins_after_coordinator_silence() {
        let mut fsm = machine(50, 1);
        let now = Instant::now();
        fsm.start(now);
        make_reachable(&mut fsm, 0);
        fsm.peers[0].state = WdState::Coordinator;
        fsm.peers[0].last_rcv = Some(now);
        fsm.master = Some(Master::Peer(0));
        let _ = fsm.set_state(WdState::Standby, now);
        // The coordinator accepts our join before going quiet
        let join_id = fsm.state_command_id().unwrap();
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::Accept, join_id),
            },
            now,
        );
        fsm.peers[0].last_rcv = Some(now);
        fsm.take_outbox();

        // One beacon interval of silence: ask for information
        let _ = fsm.on_tick(now + BEACON_INTERVAL + Duration::from_secs(1), None);
        assert_eq!(fsm.state(), WdState::Standby);
        assert!(sent_types(&mut fsm).contains(&(0, PacketType::ReqInfo)));

        // Two intervals: give up and rediscover the cluster
        let _ = fsm.on_tick(now + 2 * BEACON_INTERVAL, None);
        assert_eq!(fsm.state(), WdState::Joining);
    }

    #[test]
    fn test_standby_applies_coordinator_failover_end() {
        let mut fsm = machine(50, 1);
        let now = Instant::now();
        fsm.start(now);
        make_reachable(&mut fsm, 0);
        fsm.peers[0].state = WdState::Coordinator;
        fsm.peers[0].last_rcv = Some(now);
        fsm.master = Some(Master::Peer(0));
        let _ = fsm.set_state(WdState::Standby, now);

        let message = super::super::packet::BackendStateMessage {
            statuses: vec![NodeStatus::Up, NodeStatus::Down],
            primary_node_id: 0,
        };
        let packet = WdPacket::with_json(PacketType::FailoverEnd, 0, &message).unwrap();
        let actions = fsm.handle_event(WdEvent::PacketReceived { peer_id: 0, packet }, now);

        assert!(actions.contains(&WdAction::SetSwitching(false)));
        assert!(actions.iter().any(|a| matches!(
            a,
            WdAction::ApplyBackendState { statuses, primary_node_id: 0 }
                if statuses.len() == 2
        )));
    }

    #[test]
    fn test_five_node_failover_consensus_round() {
        // Scenario: five watchdogs, backend node 3 fails. Votes from
        // the coordinator plus two standbys reach the minimum of
        // three and the coordinator executes.
        let (mut fsm, now) = coordinator_fixture(4);
        for id in 0..4 {
            fsm.peers[id].state = WdState::Standby;
        }
        let _ = fsm.handle_event(WdEvent::QuorumChanged, now);
        fsm.quorum_status = 1;
        fsm.take_outbox();

        // Local vote
        let request = NodeOpRequest::new(NodeOpKind::Down, vec![3]);
        let (disposition, actions) = fsm.handle_local_failover(&request, now);
        assert!(matches!(
            disposition,
            FailoverDisposition::Verdict(ArbiterVerdict::BuildingConsensus)
        ));
        assert!(actions.is_empty());
        let sent = sent_types(&mut fsm);
        assert_eq!(fsm_count(&sent, PacketType::FailoverWaitingForConsensus), 4);

        // Second vote from peer 0
        let vote = FailoverRequestMessage {
            kind: NodeOpKind::Down,
            nodes: vec![3],
            flags: NodeOpFlags::default(),
        };
        let packet = WdPacket::with_json(PacketType::RemoteFailoverRequest, 21, &vote).unwrap();
        let actions = fsm.handle_event(WdEvent::PacketReceived { peer_id: 0, packet }, now);
        assert!(actions.is_empty());
        let outbox = fsm.take_outbox();
        let reply: FailoverVerdictMessage = outbox
            .iter()
            .find(|(id, p)| *id == 0 && p.packet_type == PacketType::CmdReplyInData)
            .map(|(_, p)| p.json().unwrap())
            .unwrap();
        assert_eq!(reply.verdict, FailoverVerdictMessage::BUILDING_CONSENSUS);

        // Third vote from peer 1 reaches consensus
        let packet = WdPacket::with_json(PacketType::RemoteFailoverRequest, 22, &vote).unwrap();
        let actions = fsm.handle_event(WdEvent::PacketReceived { peer_id: 1, packet }, now);
        assert!(actions.iter().any(|a| matches!(
            a,
            WdAction::ExecuteFailover { request }
                if request.kind == NodeOpKind::Down && request.nodes == vec![3]
        )));
        assert!(actions.contains(&WdAction::SetSwitching(true)));

        let outbox = fsm.take_outbox();
        let reply: FailoverVerdictMessage = outbox
            .iter()
            .find(|(id, p)| *id == 1 && p.packet_type == PacketType::CmdReplyInData)
            .map(|(_, p)| p.json().unwrap())
            .unwrap();
        assert_eq!(reply.verdict, FailoverVerdictMessage::WILL_BE_DONE);
        assert_eq!(
            outbox
                .iter()
                .filter(|(_, p)| p.packet_type == PacketType::FailoverStart)
                .count(),
            4
        );

        // Execution finished: the end-of-failover state broadcast
        let actions = fsm.on_failover_executed(
            vec![
                NodeStatus::Up,
                NodeStatus::Up,
                NodeStatus::Up,
                NodeStatus::Down,
            ],
            0,
            now,
        );
        assert!(actions.contains(&WdAction::SetSwitching(false)));
        let outbox = fsm.take_outbox();
        assert_eq!(
            outbox
                .iter()
                .filter(|(_, p)| p.packet_type == PacketType::FailoverEnd)
                .count(),
            4
        );
    }

    #[test]
    fn test_standby_forwards_failover_vote_to_coordinator() {
        let mut fsm = machine(50, 1);
        let now = Instant::now();
        fsm.start(now);
        make_reachable(&mut fsm, 0);
        fsm.peers[0].state = WdState::Coordinator;
        fsm.peers[0].last_rcv = Some(now);
        fsm.master = Some(Master::Peer(0));
        let _ = fsm.set_state(WdState::Standby, now);
        fsm.take_outbox();

        let request = NodeOpRequest::new(NodeOpKind::Down, vec![1]);
        let (disposition, _) = fsm.handle_local_failover(&request, now);
        let FailoverDisposition::AwaitReply { command_id } = disposition else {
            panic!("expected the vote to be forwarded");
        };

        let outbox = fsm.take_outbox();
        let forwarded = outbox
            .iter()
            .find(|(id, p)| *id == 0 && p.packet_type == PacketType::RemoteFailoverRequest)
            .unwrap();
        assert_eq!(forwarded.1.command_id, command_id);
        let vote: FailoverRequestMessage = forwarded.1.json().unwrap();
        assert_eq!(vote.nodes, vec![1]);
    }

    #[test]
    fn test_coordinator_resigns_when_primary_quarantine_fails_consensus() {
        let (mut fsm, now) = coordinator_fixture(4);
        for id in 0..4 {
            fsm.peers[id].state = WdState::Standby;
        }
        fsm.quorum_status = 1;
        fsm.escalated = true;

        let request = NodeOpRequest::new(NodeOpKind::Down, vec![0]);
        let (_, _) = fsm.handle_local_failover(&request, now);
        fsm.take_outbox();

        // The vote never gathers consensus; primary node 0 sits in
        // quarantine when the object expires
        let later = now + Duration::from_secs(16);
        let actions = fsm.on_tick(later, Some(0));

        assert_eq!(fsm.state(), WdState::Joining);
        assert_eq!(fsm.config.priority, -1);
        assert!(actions.contains(&WdAction::DeEscalate));
        let outbox = fsm.take_outbox();
        assert!(outbox.iter().any(|(_, p)| p.cluster_service_event()
            == Some(ClusterServiceEvent::ResigningFromMaster)));
    }

    #[test]
    fn test_going_down_notice_cancels_commands_waiting_on_the_peer() {
        let mut fsm = machine(50, 2);
        let now = Instant::now();
        fsm.start(now);
        make_reachable(&mut fsm, 0);
        make_reachable(&mut fsm, 1);
        let _ = fsm.set_state(WdState::StandForCoordinator, now);
        fsm.take_outbox();

        let command_id = fsm.state_command_id().unwrap();
        // Peer 0 accepts; peer 1 announces shutdown instead of
        // replying. The command completes and the election finishes.
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::Accept, command_id),
            },
            now,
        );
        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 1,
                packet: WdPacket::empty(PacketType::InformGoingDown, 0),
            },
            now,
        );
        assert_eq!(fsm.peers[1].state, WdState::Shutdown);
        assert_eq!(fsm.state(), WdState::Coordinator);
    }

    #[test]
    fn test_network_trouble_is_fatal() {
        let mut fsm = machine(50, 1);
        let now = Instant::now();
        fsm.start(now);

        let actions = fsm.handle_event(WdEvent::NetworkLinkDown, now);
        assert_eq!(fsm.state(), WdState::InNetworkTrouble);
        assert!(actions
            .iter()
            .any(|a| matches!(a, WdAction::FatalExit { .. })));
    }

    #[test]
    fn test_add_node_with_bad_auth_hash_is_rejected() {
        let mut fsm = StateMachine::new(
            LocalNodeConfig {
                auth_key: "cluster-secret".into(),
                ..config(50)
            },
            vec![peer_addr(0)],
            ConsensusSettings::default(),
            Instant::now(),
        );
        let now = Instant::now();
        fsm.start(now);
        fsm.take_outbox();

        let info = NodeInfoMessage {
            node_name: "intruder".into(),
            hostname: "10.9.9.9".into(),
            wd_port: 9000,
            proxy_port: 9999,
            priority: 99,
            beacon: beacon(WdState::Loading, 0, -1, 0, false),
            auth_hash: Some("wrong".into()),
        };
        let packet = WdPacket::with_json(PacketType::AddNode, 1, &info).unwrap();
        let actions = fsm.handle_event(WdEvent::PacketReceived { peer_id: 0, packet }, now);

        assert!(actions.contains(&WdAction::ClosePeerConnections { peer_id: 0 }));
        assert!(sent_types(&mut fsm).contains(&(0, PacketType::Reject)));
    }

    #[test]
    fn test_add_node_with_valid_hash_is_accepted_and_answered() {
        let key = "cluster-secret";
        let mut fsm = StateMachine::new(
            LocalNodeConfig {
                auth_key: key.into(),
                ..config(50)
            },
            vec![peer_addr(0)],
            ConsensusSettings::default(),
            Instant::now(),
        );
        let now = Instant::now();
        fsm.start(now);
        fsm.take_outbox();

        let state = WdState::Loading;
        let info = NodeInfoMessage {
            node_name: "portero-1".into(),
            hostname: "10.0.0.2".into(),
            wd_port: 9000,
            proxy_port: 9999,
            priority: 40,
            beacon: beacon(state, 0, -1, 0, false),
            auth_hash: Some(peer::auth_hash(state.as_u8(), 9000, key)),
        };
        let packet = WdPacket::with_json(PacketType::AddNode, 1, &info).unwrap();
        let actions = fsm.handle_event(WdEvent::PacketReceived { peer_id: 0, packet }, now);

        assert!(actions.is_empty());
        let sent = sent_types(&mut fsm);
        assert!(sent.contains(&(0, PacketType::Accept)));
        assert!(sent.contains(&(0, PacketType::Info)));
        assert_eq!(fsm.peers[0].node_name, "portero-1");
        assert_eq!(fsm.peers[0].priority, 40);
    }

    #[test]
    fn test_req_info_is_answered_with_node_info() {
        let mut fsm = machine(50, 1);
        let now = Instant::now();
        fsm.start(now);
        fsm.take_outbox();

        fsm.handle_event(
            WdEvent::PacketReceived {
                peer_id: 0,
                packet: WdPacket::empty(PacketType::ReqInfo, 33),
            },
            now,
        );
        let outbox = fsm.take_outbox();
        let info = outbox
            .iter()
            .find(|(id, p)| *id == 0 && p.packet_type == PacketType::Info)
            .unwrap();
        assert_eq!(info.1.command_id, 33);
        let decoded: NodeInfoMessage = info.1.json().unwrap();
        assert_eq!(decoded.node_name, "portero-0");
    }
}
