/// The watchdog: cluster coordination between proxy instances
///
/// A single driver task owns the state machine; peer sockets, the
/// IPC server, and failover arbitration all funnel into it over
/// channels, so every piece of coordination state has exactly one
/// writer.
pub mod command;
pub mod consensus;
pub mod fsm;
pub mod ipc;
pub mod packet;
pub mod peer;
pub mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{PorteroError, PorteroResult};
use crate::failover::{ArbiterVerdict, FailoverArbiter, FailoverCoordinator};
use crate::registry::{ClusterRegistry, NodeOpKind, NodeOpRequest, NodeRole, NodeStatus};

use consensus::ConsensusSettings;
use fsm::{FailoverDisposition, LocalNodeConfig, StateMachine, WdAction, WdEvent};
use ipc::{IpcCommandType, IpcReplyType, IpcRequest};
use packet::{FailoverVerdictMessage, PacketType, WdPacket};
use peer::{PeerAddress, SocketState};
use transport::TransportEvent;

/// Runtime watchdog configuration
#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub node_name: String,
    pub hostname: String,
    pub wd_port: u16,
    pub proxy_port: u16,
    pub priority: i32,
    pub auth_key: String,
    pub peers: Vec<PeerAddress>,
    /// None disables the wire listener (tests drive events directly)
    pub listen_addr: Option<String>,
    pub ipc_socket_path: Option<PathBuf>,
    /// Shell command run when this node wins escalation
    pub escalation_command: Option<String>,
    pub de_escalation_command: Option<String>,
    pub consensus: ConsensusSettings,
}

/// Inputs from the embedding proxy to the driver
#[derive(Debug)]
pub enum DriverInput {
    LocalFailover {
        request: NodeOpRequest,
        reply: oneshot::Sender<ArbiterVerdict>,
    },
    FailoverExecuted {
        request: NodeOpRequest,
    },
    Shutdown,
}

/// Clonable handle the failover coordinator uses to consult the
/// cluster before executing anything
#[derive(Clone)]
pub struct WatchdogHandle {
    tx: mpsc::UnboundedSender<DriverInput>,
}

impl WatchdogHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(DriverInput::Shutdown);
    }
}

#[async_trait]
impl FailoverArbiter for WatchdogHandle {
    async fn submit(&self, request: &NodeOpRequest) -> ArbiterVerdict {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(DriverInput::LocalFailover {
                request: request.clone(),
                reply: reply_tx,
            })
            .is_err()
        {
            // The watchdog is gone; act on local knowledge
            warn!("watchdog driver unavailable, proceeding without cluster consensus");
            return ArbiterVerdict::Proceed;
        }
        // A dropped reply means the forwarded vote expired unanswered;
        // stay pessimistic rather than failing over on our own
        reply_rx.await.unwrap_or(ArbiterVerdict::BuildingConsensus)
    }

    async fn completed(&self, request: &NodeOpRequest) {
        let _ = self.tx.send(DriverInput::FailoverExecuted {
            request: request.clone(),
        });
    }
}

/// Create the handle / input-channel pair
pub fn watchdog_channel() -> (WatchdogHandle, mpsc::UnboundedReceiver<DriverInput>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WatchdogHandle { tx }, rx)
}

/// The driver task owning the state machine
pub struct WatchdogDriver {
    settings: WatchdogSettings,
    fsm: StateMachine,
    registry: Arc<ClusterRegistry>,
    executor: Arc<FailoverCoordinator>,
    input_rx: mpsc::UnboundedReceiver<DriverInput>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ipc_tx: mpsc::UnboundedSender<IpcRequest>,
    ipc_rx: mpsc::UnboundedReceiver<IpcRequest>,
    /// Standby-side failover votes awaiting the coordinator's answer,
    /// keyed by command id
    pending_verdicts: HashMap<u32, oneshot::Sender<ArbiterVerdict>>,
    /// Key internal IPC clients must present
    shared_key: u32,
}

impl WatchdogDriver {
    pub fn new(
        settings: WatchdogSettings,
        registry: Arc<ClusterRegistry>,
        executor: Arc<FailoverCoordinator>,
        input_rx: mpsc::UnboundedReceiver<DriverInput>,
    ) -> Self {
        let local = LocalNodeConfig {
            node_name: settings.node_name.clone(),
            hostname: settings.hostname.clone(),
            wd_port: settings.wd_port,
            proxy_port: settings.proxy_port,
            priority: settings.priority,
            auth_key: settings.auth_key.clone(),
        };
        let fsm = StateMachine::new(
            local,
            settings.peers.clone(),
            settings.consensus.clone(),
            Instant::now(),
        );
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (ipc_tx, ipc_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            fsm,
            registry,
            executor,
            input_rx,
            transport_tx,
            transport_rx,
            ipc_tx,
            ipc_rx,
            pending_verdicts: HashMap::new(),
            shared_key: rand::thread_rng().gen(),
        }
    }

    /// Feed for tests injecting transport events
    pub fn transport_sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.transport_tx.clone()
    }

    pub fn shared_key(&self) -> u32 {
        self.shared_key
    }

    pub async fn run(mut self) -> PorteroResult<()> {
        if let Some(addr) = self.settings.listen_addr.clone() {
            let listener = TcpListener::bind(&addr).await?;
            info!(addr = addr.as_str(), "watchdog listening");
            transport::spawn_listener(listener, self.transport_tx.clone());
        }
        if let Some(path) = self.settings.ipc_socket_path.clone() {
            let listener = ipc::bind_socket(&path)?;
            info!(path = %path.display(), "watchdog IPC socket ready");
            ipc::spawn_ipc_server(listener, self.ipc_tx.clone());
        }

        let actions = self.fsm.start(Instant::now());
        self.apply_actions(actions).await?;

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(event) = self.transport_rx.recv() => {
                    self.on_transport(event).await?;
                }
                Some(input) = self.input_rx.recv() => {
                    if !self.on_input(input).await? {
                        break;
                    }
                }
                Some(request) = self.ipc_rx.recv() => {
                    self.on_ipc(request);
                }
                _ = ticker.tick() => {
                    self.on_timer_tick().await?;
                }
            }
        }
        Ok(())
    }

    async fn on_transport(&mut self, event: TransportEvent) -> PorteroResult<()> {
        let now = Instant::now();
        match event {
            TransportEvent::PeerPacket { peer_id, packet } => {
                // A coordinator's answer to our forwarded failover
                // vote resolves a waiting arbiter call
                if packet.packet_type == PacketType::CmdReplyInData {
                    if let Some(reply) = self.pending_verdicts.remove(&packet.command_id) {
                        let verdict = packet
                            .json::<FailoverVerdictMessage>()
                            .map(|m| match m.verdict.as_str() {
                                FailoverVerdictMessage::WILL_BE_DONE => ArbiterVerdict::WillBeDone,
                                FailoverVerdictMessage::NO_QUORUM => ArbiterVerdict::NoQuorum,
                                FailoverVerdictMessage::MAY_FAIL => {
                                    ArbiterVerdict::ConsensusMayFail
                                }
                                _ => ArbiterVerdict::BuildingConsensus,
                            })
                            .unwrap_or(ArbiterVerdict::BuildingConsensus);
                        let _ = reply.send(verdict);
                    }
                }
                let actions = self.fsm.handle_event(WdEvent::PacketReceived { peer_id, packet }, now);
                self.apply_actions(actions).await?;
            }
            TransportEvent::OutboundEstablished { peer_id, writer } => {
                debug!(peer_id, "outbound watchdog connection established");
                if let Some(peer) = self.fsm.peers.get_mut(peer_id) {
                    peer.client_tx = Some(writer);
                    peer.client_sock = SocketState::Connected;
                }
                let actions = self
                    .fsm
                    .handle_event(WdEvent::NewOutboundConnection { peer_id }, now);
                self.apply_actions(actions).await?;
            }
            TransportEvent::OutboundFailed { peer_id } => {
                if let Some(peer) = self.fsm.peers.get_mut(peer_id) {
                    peer.client_sock = SocketState::ErrorState;
                }
            }
            TransportEvent::InboundHandshake {
                info,
                packet,
                writer,
                id_reply,
            } => {
                let matched = self.fsm.peers.iter().position(|p| {
                    p.address
                        .matches(&info.hostname, info.wd_port, info.proxy_port)
                });
                match matched {
                    Some(peer_id) => {
                        let peer = &mut self.fsm.peers[peer_id];
                        peer.server_tx = Some(writer);
                        peer.server_sock = SocketState::Connected;
                        let _ = id_reply.send(Some(peer_id));
                        // Authentication happens in the state machine
                        let actions = self
                            .fsm
                            .handle_event(WdEvent::PacketReceived { peer_id, packet }, now);
                        self.apply_actions(actions).await?;
                    }
                    None => {
                        warn!(
                            node = info.node_name.as_str(),
                            hostname = info.hostname.as_str(),
                            "inbound watchdog connection from unconfigured node rejected"
                        );
                        let _ = writer.send(WdPacket::empty(PacketType::Reject, packet.command_id));
                        let _ = id_reply.send(None);
                    }
                }
            }
            TransportEvent::ConnectionClosed { peer_id, inbound } => {
                let fully_lost = {
                    let Some(peer) = self.fsm.peers.get_mut(peer_id) else {
                        return Ok(());
                    };
                    if inbound {
                        peer.server_tx = None;
                        peer.server_sock = SocketState::Closed;
                    } else {
                        peer.client_tx = None;
                        peer.client_sock = SocketState::Closed;
                    }
                    !peer.is_reachable()
                };
                if fully_lost {
                    let actions = self
                        .fsm
                        .handle_event(WdEvent::RemoteNodeLost { peer_id }, now);
                    self.apply_actions(actions).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_input(&mut self, input: DriverInput) -> PorteroResult<bool> {
        let now = Instant::now();
        match input {
            DriverInput::LocalFailover { request, reply } => {
                let (disposition, actions) = self.fsm.handle_local_failover(&request, now);
                self.apply_actions(actions).await?;
                match disposition {
                    FailoverDisposition::Verdict(verdict) => {
                        let _ = reply.send(verdict);
                    }
                    FailoverDisposition::AwaitReply { command_id } => {
                        self.pending_verdicts.insert(command_id, reply);
                    }
                }
            }
            DriverInput::FailoverExecuted { request } => {
                debug!(kind = ?request.kind, "local failover executed, informing the cluster");
                let actions = self.broadcast_failover_end(now);
                self.apply_actions(actions).await?;
            }
            DriverInput::Shutdown => {
                info!("watchdog shutting down, informing peers");
                for peer in self.fsm.peers.iter_mut() {
                    peer.send(WdPacket::empty(PacketType::InformGoingDown, 0), now);
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn broadcast_failover_end(&mut self, now: Instant) -> Vec<WdAction> {
        let statuses: Vec<NodeStatus> = self
            .registry
            .snapshot()
            .iter()
            .map(|d| d.status)
            .collect();
        let primary = self.registry.primary_node_id();
        self.fsm.on_failover_executed(statuses, primary, now)
    }

    async fn on_timer_tick(&mut self) -> PorteroResult<()> {
        let now = Instant::now();

        // Reconnect unreachable peers, spaced by the retry interval
        for peer_id in 0..self.fsm.peers.len() {
            let due = self.fsm.peers[peer_id].reconnect_due(now);
            if due {
                let peer = &mut self.fsm.peers[peer_id];
                peer.last_connect_attempt = Some(now);
                peer.client_sock = SocketState::WaitingForConnect;
                transport::spawn_outbound(
                    peer_id,
                    peer.address.wd_addr(),
                    self.transport_tx.clone(),
                );
            }
        }

        let primary_in_quarantine = self
            .registry
            .snapshot()
            .iter()
            .find(|d| d.role == NodeRole::Primary && d.status == NodeStatus::Quarantined)
            .map(|d| d.id);

        let actions = self.fsm.on_tick(now, primary_in_quarantine);
        self.apply_actions(actions).await?;

        // Forwarded votes whose command expired resolve pessimistically
        // (a dropped sender reads as BuildingConsensus on the arbiter)
        let bus = &self.fsm.bus;
        self.pending_verdicts
            .retain(|command_id, _| bus.get(*command_id).is_some());

        self.fsm.take_outbox();
        Ok(())
    }

    fn on_ipc(&mut self, request: IpcRequest) {
        let frame = request.frame;
        let reply = request.reply;
        let (status, data) = self.execute_ipc(frame.command, &frame.data);
        let _ = reply.send((status, data));
    }

    fn execute_ipc(&mut self, command: IpcCommandType, data: &[u8]) -> (IpcReplyType, Bytes) {
        let credentials = serde_json::from_slice::<ipc::IpcCredentials>(data).unwrap_or_default();
        if !ipc::authenticate(
            command,
            &credentials,
            &self.settings.auth_key,
            self.shared_key,
        ) {
            warn!(?command, "IPC command failed authentication");
            return (IpcReplyType::ResultBad, Bytes::new());
        }

        match command {
            IpcCommandType::GetNodesList => {
                let nodes: Vec<serde_json::Value> = std::iter::once(serde_json::json!({
                    "name": self.settings.node_name,
                    "hostname": self.settings.hostname,
                    "state": self.fsm.state().as_str(),
                    "priority": self.fsm.config.priority,
                    "local": true,
                }))
                .chain(self.fsm.peers.iter().map(|p| {
                    serde_json::json!({
                        "name": p.node_name,
                        "hostname": p.address.hostname,
                        "state": p.state.as_str(),
                        "priority": p.priority,
                        "local": false,
                    })
                }))
                .collect();
                let body = serde_json::json!({ "nodes": nodes });
                (IpcReplyType::ResultOk, Bytes::from(body.to_string()))
            }
            IpcCommandType::GetMasterDataRequest => match self.fsm.master {
                Some(fsm::Master::Local) => {
                    let body = serde_json::json!({
                        "name": self.settings.node_name,
                        "hostname": self.settings.hostname,
                        "escalated": self.fsm.escalated,
                    });
                    (IpcReplyType::ResultOk, Bytes::from(body.to_string()))
                }
                Some(fsm::Master::Peer(id)) => {
                    let peer = &self.fsm.peers[id];
                    let body = serde_json::json!({
                        "name": peer.node_name,
                        "hostname": peer.address.hostname,
                        "escalated": peer.escalated,
                    });
                    (IpcReplyType::ResultOk, Bytes::from(body.to_string()))
                }
                None => (IpcReplyType::ClusterInTransition, Bytes::new()),
            },
            IpcCommandType::GetRuntimeVariableValue => {
                let Ok(payload) = serde_json::from_slice::<ipc::RuntimeVariablePayload>(data)
                else {
                    return (IpcReplyType::ResultBad, Bytes::new());
                };
                let value = match payload.name.as_str() {
                    "wd_state" => serde_json::json!(self.fsm.state().as_str()),
                    "escalated" => serde_json::json!(self.fsm.escalated),
                    "quorum_status" => serde_json::json!(self.fsm.quorum_status),
                    _ => return (IpcReplyType::ResultBad, Bytes::new()),
                };
                (IpcReplyType::ResultOk, Bytes::from(value.to_string()))
            }
            IpcCommandType::NodeStatusChange => {
                let Ok(payload) = serde_json::from_slice::<ipc::NodeStatusChangePayload>(data)
                else {
                    return (IpcReplyType::ResultBad, Bytes::new());
                };
                let kind = match payload.status.as_str() {
                    "up" => NodeOpKind::Up,
                    "down" => NodeOpKind::Down,
                    _ => return (IpcReplyType::ResultBad, Bytes::new()),
                };
                if self
                    .registry
                    .submit_request(NodeOpRequest::new(kind, vec![payload.node_id]))
                {
                    (IpcReplyType::ResultOk, Bytes::new())
                } else {
                    (IpcReplyType::ResultBad, Bytes::new())
                }
            }
            IpcCommandType::FailoverCommand | IpcCommandType::OnlineRecoveryCommand => {
                let Ok(payload) = serde_json::from_slice::<ipc::FailoverCommandPayload>(data)
                else {
                    return (IpcReplyType::ResultBad, Bytes::new());
                };
                if self.registry.is_switching() {
                    return (IpcReplyType::ClusterInTransition, Bytes::new());
                }
                if self.registry.submit_request(payload.request) {
                    (IpcReplyType::ResultOk, Bytes::new())
                } else {
                    (IpcReplyType::ResultBad, Bytes::new())
                }
            }
            IpcCommandType::FailoverIndication => {
                let Ok(payload) =
                    serde_json::from_slice::<ipc::FailoverIndicationPayload>(data)
                else {
                    return (IpcReplyType::ResultBad, Bytes::new());
                };
                self.registry.set_switching(payload.start);
                (IpcReplyType::ResultOk, Bytes::new())
            }
            IpcCommandType::RegisterForNotification => (IpcReplyType::ResultOk, Bytes::new()),
        }
    }

    async fn apply_actions(&mut self, actions: Vec<WdAction>) -> PorteroResult<()> {
        let mut queue = std::collections::VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                WdAction::Escalate => {
                    info!("escalating: this node now owns the cluster delegate role");
                    run_helper_command(self.settings.escalation_command.as_deref()).await;
                }
                WdAction::DeEscalate => {
                    info!("de-escalating: releasing the cluster delegate role");
                    run_helper_command(self.settings.de_escalation_command.as_deref()).await;
                }
                WdAction::ExecuteFailover { request } => {
                    self.executor.execute(&request).await;
                    let follow_up = self.broadcast_failover_end(Instant::now());
                    queue.extend(follow_up);
                }
                WdAction::SetSwitching(value) => {
                    self.registry.set_switching(value);
                }
                WdAction::ApplyBackendState {
                    statuses,
                    primary_node_id,
                } => {
                    debug!("applying coordinator backend state");
                    for (node_id, status) in statuses.iter().enumerate() {
                        self.registry.set_status(node_id, *status);
                    }
                    if primary_node_id >= 0 {
                        for node_id in 0..self.registry.node_count() {
                            let role = if node_id == primary_node_id as usize {
                                NodeRole::Primary
                            } else {
                                NodeRole::Standby
                            };
                            self.registry.set_role(node_id, role);
                        }
                    }
                }
                WdAction::ClosePeerConnections { peer_id } => {
                    debug!(peer_id, "peer connections closed");
                }
                WdAction::FatalExit { reason } => {
                    error!(reason = reason.as_str(), "watchdog fatal exit");
                    return Err(PorteroError::watchdog(reason));
                }
            }
        }
        self.fsm.take_outbox();
        Ok(())
    }
}

/// Run the configured escalation helper, if any. The watchdog only
/// decides when escalation is appropriate; moving the delegate IP is
/// the helper's job.
async fn run_helper_command(command: Option<&str>) {
    let Some(command) = command else {
        return;
    };
    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(command, ?status, "escalation helper exited abnormally"),
        Err(e) => warn!(command, error = %e, "could not run escalation helper"),
    }
}
