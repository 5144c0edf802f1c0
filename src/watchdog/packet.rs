/// Watchdog wire protocol
///
/// Frame layout: `type:u8 | command_id:u32 BE | len:u32 BE | data`.
/// Message bodies that carry structure are JSON documents.
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::protocol::stream::PacketStream;
use crate::protocol::{ProtocolError, ProtocolResult};
use crate::registry::{NodeOpFlags, NodeOpKind};

/// Upper bound on a peer frame; anything larger is a protocol fault
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Message types exchanged between watchdog peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    AddNode,
    ReqInfo,
    DeclareCoordinator,
    Data,
    Error,
    Accept,
    Info,
    JoinCoordinator,
    IAmCoordinator,
    IAmInNetworkTrouble,
    QuorumLost,
    Reject,
    StandForCoordinator,
    RemoteFailoverRequest,
    InformGoingDown,
    AskForPoolConfig,
    PoolConfigData,
    CmdReplyInData,
    ClusterService,
    FailoverStart,
    FailoverEnd,
    FailoverWaitingForConsensus,
}

impl PacketType {
    pub fn as_u8(&self) -> u8 {
        match self {
            PacketType::AddNode => b'A',
            PacketType::ReqInfo => b'B',
            PacketType::DeclareCoordinator => b'C',
            PacketType::Data => b'D',
            PacketType::Error => b'E',
            PacketType::Accept => b'G',
            PacketType::Info => b'I',
            PacketType::JoinCoordinator => b'J',
            PacketType::IAmCoordinator => b'M',
            PacketType::IAmInNetworkTrouble => b'N',
            PacketType::QuorumLost => b'Q',
            PacketType::Reject => b'R',
            PacketType::StandForCoordinator => b'S',
            PacketType::RemoteFailoverRequest => b'V',
            PacketType::InformGoingDown => b'X',
            PacketType::AskForPoolConfig => b'Y',
            PacketType::PoolConfigData => b'Z',
            PacketType::CmdReplyInData => b'-',
            PacketType::ClusterService => b'#',
            PacketType::FailoverStart => b'F',
            PacketType::FailoverEnd => b'H',
            PacketType::FailoverWaitingForConsensus => b'K',
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            b'A' => PacketType::AddNode,
            b'B' => PacketType::ReqInfo,
            b'C' => PacketType::DeclareCoordinator,
            b'D' => PacketType::Data,
            b'E' => PacketType::Error,
            b'G' => PacketType::Accept,
            b'I' => PacketType::Info,
            b'J' => PacketType::JoinCoordinator,
            b'M' => PacketType::IAmCoordinator,
            b'N' => PacketType::IAmInNetworkTrouble,
            b'Q' => PacketType::QuorumLost,
            b'R' => PacketType::Reject,
            b'S' => PacketType::StandForCoordinator,
            b'V' => PacketType::RemoteFailoverRequest,
            b'X' => PacketType::InformGoingDown,
            b'Y' => PacketType::AskForPoolConfig,
            b'Z' => PacketType::PoolConfigData,
            b'-' => PacketType::CmdReplyInData,
            b'#' => PacketType::ClusterService,
            b'F' => PacketType::FailoverStart,
            b'H' => PacketType::FailoverEnd,
            b'K' => PacketType::FailoverWaitingForConsensus,
            _ => return None,
        })
    }

    /// Types that answer a tracked cluster command
    pub fn is_command_reply(&self) -> bool {
        matches!(
            self,
            PacketType::Accept
                | PacketType::Reject
                | PacketType::Error
                | PacketType::CmdReplyInData
        )
    }

    pub fn all() -> &'static [PacketType] {
        &[
            PacketType::AddNode,
            PacketType::ReqInfo,
            PacketType::DeclareCoordinator,
            PacketType::Data,
            PacketType::Error,
            PacketType::Accept,
            PacketType::Info,
            PacketType::JoinCoordinator,
            PacketType::IAmCoordinator,
            PacketType::IAmInNetworkTrouble,
            PacketType::QuorumLost,
            PacketType::Reject,
            PacketType::StandForCoordinator,
            PacketType::RemoteFailoverRequest,
            PacketType::InformGoingDown,
            PacketType::AskForPoolConfig,
            PacketType::PoolConfigData,
            PacketType::CmdReplyInData,
            PacketType::ClusterService,
            PacketType::FailoverStart,
            PacketType::FailoverEnd,
            PacketType::FailoverWaitingForConsensus,
        ]
    }
}

/// Sub-types carried in the one-byte body of a ClusterService message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterServiceEvent {
    QuorumLost,
    QuorumFound,
    SplitBrain,
    NeedsElection,
    IAmTrueMaster,
    IAmNotTrueMaster,
    ResigningFromMaster,
    InvalidVersion,
}

impl ClusterServiceEvent {
    pub fn as_u8(&self) -> u8 {
        match self {
            ClusterServiceEvent::QuorumLost => b'L',
            ClusterServiceEvent::QuorumFound => b'F',
            ClusterServiceEvent::SplitBrain => b'B',
            ClusterServiceEvent::NeedsElection => b'E',
            ClusterServiceEvent::IAmTrueMaster => b'M',
            ClusterServiceEvent::IAmNotTrueMaster => b'X',
            ClusterServiceEvent::ResigningFromMaster => b'R',
            ClusterServiceEvent::InvalidVersion => b'V',
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            b'L' => ClusterServiceEvent::QuorumLost,
            b'F' => ClusterServiceEvent::QuorumFound,
            b'B' => ClusterServiceEvent::SplitBrain,
            b'E' => ClusterServiceEvent::NeedsElection,
            b'M' => ClusterServiceEvent::IAmTrueMaster,
            b'X' => ClusterServiceEvent::IAmNotTrueMaster,
            b'R' => ClusterServiceEvent::ResigningFromMaster,
            b'V' => ClusterServiceEvent::InvalidVersion,
            _ => return None,
        })
    }
}

/// One framed watchdog message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WdPacket {
    pub packet_type: PacketType,
    pub command_id: u32,
    pub data: Bytes,
}

impl WdPacket {
    pub fn new(packet_type: PacketType, command_id: u32, data: Bytes) -> Self {
        Self {
            packet_type,
            command_id,
            data,
        }
    }

    pub fn empty(packet_type: PacketType, command_id: u32) -> Self {
        Self::new(packet_type, command_id, Bytes::new())
    }

    pub fn cluster_service(command_id: u32, event: ClusterServiceEvent) -> Self {
        Self::new(
            PacketType::ClusterService,
            command_id,
            Bytes::copy_from_slice(&[event.as_u8()]),
        )
    }

    pub fn cluster_service_event(&self) -> Option<ClusterServiceEvent> {
        if self.packet_type != PacketType::ClusterService {
            return None;
        }
        self.data.first().and_then(|b| ClusterServiceEvent::from_u8(*b))
    }

    pub fn with_json<T: Serialize>(
        packet_type: PacketType,
        command_id: u32,
        payload: &T,
    ) -> ProtocolResult<Self> {
        let data = serde_json::to_vec(payload)
            .map_err(|e| ProtocolError::malformed(format!("json encode: {}", e)))?;
        Ok(Self::new(packet_type, command_id, Bytes::from(data)))
    }

    pub fn json<'a, T: Deserialize<'a>>(&'a self) -> ProtocolResult<T> {
        serde_json::from_slice(&self.data)
            .map_err(|e| ProtocolError::malformed(format!("json decode: {}", e)))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(self.packet_type.as_u8());
        buf.put_u32(self.command_id);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub async fn read_from<S>(stream: &mut PacketStream<S>) -> ProtocolResult<Self>
    where
        S: AsyncRead + Unpin,
    {
        let type_byte = stream.read_u8().await?;
        let packet_type = PacketType::from_u8(type_byte).ok_or_else(|| {
            ProtocolError::malformed(format!("unknown watchdog packet type {:#x}", type_byte))
        })?;
        let command_id = stream.read_i32().await? as u32;
        let len = stream.read_i32().await? as u32;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::malformed(format!(
                "oversized watchdog frame ({} bytes)",
                len
            )));
        }
        let data = stream.read_exact_bytes(len as usize).await?;
        Ok(Self {
            packet_type,
            command_id,
            data,
        })
    }
}

/// Node identity and state advertised in AddNode and Info messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoMessage {
    pub node_name: String,
    pub hostname: String,
    pub wd_port: u16,
    pub proxy_port: u16,
    pub priority: i32,
    #[serde(flatten)]
    pub beacon: BeaconMessage,
    /// Present on AddNode when an auth key is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_hash: Option<String>,
}

/// The state summary carried in IAmCoordinator beacons. Times are
/// relative so differing wall clocks do not skew arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeaconMessage {
    pub state: u8,
    pub seconds_since_startup: u64,
    pub seconds_since_state_change: u64,
    pub quorum_status: i32,
    pub standby_count: i32,
    pub escalated: bool,
}

/// A failover vote forwarded from a peer to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverRequestMessage {
    pub kind: NodeOpKind,
    pub nodes: Vec<usize>,
    pub flags: NodeOpFlags,
}

/// Coordinator's answer to a forwarded failover vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverVerdictMessage {
    pub verdict: String,
}

impl FailoverVerdictMessage {
    pub const WILL_BE_DONE: &'static str = "WILL_BE_DONE";
    pub const BUILDING_CONSENSUS: &'static str = "BUILDING_CONSENSUS";
    pub const NO_QUORUM: &'static str = "NO_QUORUM";
    pub const MAY_FAIL: &'static str = "MAY_FAIL";

    pub fn new(verdict: &str) -> Self {
        Self {
            verdict: verdict.to_string(),
        }
    }
}

/// Backend node states broadcast with FailoverEnd so standbys can
/// synchronize their registries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStateMessage {
    pub statuses: Vec<crate::registry::NodeStatus>,
    pub primary_node_id: i32,
}
