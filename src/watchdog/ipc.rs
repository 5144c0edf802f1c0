/// Watchdog IPC over a Unix socket
///
/// Local collaborators (admin tooling, recovery scripts) talk to the
/// watchdog through `type:u8 | len:u32 BE | data(JSON)` frames on a
/// Unix socket. Commands that need cluster involvement are funneled
/// into the driver; internal-only commands must present the shared
/// key that lives in process memory, external ones the configured
/// auth key.
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::stream::PacketStream;
use crate::protocol::{ProtocolError, ProtocolResult};
use crate::registry::NodeOpRequest;

const MAX_IPC_FRAME: u32 = 256 * 1024;

/// Commands accepted on the IPC socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcCommandType {
    NodeStatusChange,
    RegisterForNotification,
    GetNodesList,
    FailoverCommand,
    OnlineRecoveryCommand,
    FailoverIndication,
    GetMasterDataRequest,
    GetRuntimeVariableValue,
}

impl IpcCommandType {
    pub fn as_u8(&self) -> u8 {
        match self {
            IpcCommandType::NodeStatusChange => b'n',
            IpcCommandType::RegisterForNotification => b'r',
            IpcCommandType::GetNodesList => b'l',
            IpcCommandType::FailoverCommand => b'f',
            IpcCommandType::OnlineRecoveryCommand => b'o',
            IpcCommandType::FailoverIndication => b'i',
            IpcCommandType::GetMasterDataRequest => b'm',
            IpcCommandType::GetRuntimeVariableValue => b'v',
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            b'n' => IpcCommandType::NodeStatusChange,
            b'r' => IpcCommandType::RegisterForNotification,
            b'l' => IpcCommandType::GetNodesList,
            b'f' => IpcCommandType::FailoverCommand,
            b'o' => IpcCommandType::OnlineRecoveryCommand,
            b'i' => IpcCommandType::FailoverIndication,
            b'm' => IpcCommandType::GetMasterDataRequest,
            b'v' => IpcCommandType::GetRuntimeVariableValue,
            _ => return None,
        })
    }

    /// Commands reserved for in-process collaborators; they must
    /// carry the shared memory key
    pub fn internal_only(&self) -> bool {
        matches!(
            self,
            IpcCommandType::FailoverIndication | IpcCommandType::NodeStatusChange
        )
    }
}

/// Reply status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcReplyType {
    ResultOk,
    ResultBad,
    ClusterInTransition,
    Timeout,
}

impl IpcReplyType {
    pub fn as_u8(&self) -> u8 {
        match self {
            IpcReplyType::ResultOk => b'k',
            IpcReplyType::ResultBad => b'b',
            IpcReplyType::ClusterInTransition => b't',
            IpcReplyType::Timeout => b'w',
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            b'k' => IpcReplyType::ResultOk,
            b'b' => IpcReplyType::ResultBad,
            b't' => IpcReplyType::ClusterInTransition,
            b'w' => IpcReplyType::Timeout,
            _ => return None,
        })
    }
}

/// Credentials every IPC payload may carry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpcCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_key: Option<u32>,
}

/// Payload of NodeStatusChange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusChangePayload {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    pub node_id: usize,
    /// "up" or "down"
    pub status: String,
}

/// Payload of FailoverCommand and OnlineRecoveryCommand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverCommandPayload {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    #[serde(flatten)]
    pub request: NodeOpRequest,
}

/// Payload of GetRuntimeVariableValue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeVariablePayload {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    pub name: String,
}

/// Payload of FailoverIndication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverIndicationPayload {
    #[serde(flatten)]
    pub credentials: IpcCredentials,
    /// true when a failover begins, false when it ends
    pub start: bool,
}

/// One decoded IPC frame
#[derive(Debug, Clone)]
pub struct IpcFrame {
    pub command: IpcCommandType,
    pub data: Bytes,
}

impl IpcFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.data.len());
        buf.put_u8(self.command.as_u8());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

pub fn encode_reply(reply: IpcReplyType, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(reply.as_u8());
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

pub async fn read_frame<S>(stream: &mut PacketStream<S>) -> ProtocolResult<IpcFrame>
where
    S: AsyncRead + Unpin,
{
    let type_byte = stream.read_u8().await?;
    let command = IpcCommandType::from_u8(type_byte).ok_or_else(|| {
        ProtocolError::malformed(format!("unknown IPC command {:#x}", type_byte))
    })?;
    let len = stream.read_i32().await? as u32;
    if len > MAX_IPC_FRAME {
        return Err(ProtocolError::malformed("oversized IPC frame"));
    }
    let data = stream.read_exact_bytes(len as usize).await?;
    Ok(IpcFrame { command, data })
}

/// An IPC request en route to the watchdog driver
#[derive(Debug)]
pub struct IpcRequest {
    pub frame: IpcFrame,
    pub reply: oneshot::Sender<(IpcReplyType, Bytes)>,
}

/// Validate the credentials carried in a frame's JSON payload
pub fn authenticate(
    command: IpcCommandType,
    credentials: &IpcCredentials,
    configured_auth_key: &str,
    shared_key: u32,
) -> bool {
    if command.internal_only() {
        return credentials.shared_key == Some(shared_key)
            || (!configured_auth_key.is_empty()
                && credentials.auth_key.as_deref() == Some(configured_auth_key));
    }
    if configured_auth_key.is_empty() {
        return true;
    }
    credentials.auth_key.as_deref() == Some(configured_auth_key)
        || credentials.shared_key == Some(shared_key)
}

/// Accept loop on the IPC socket; each connection carries one
/// command and gets one reply
pub fn spawn_ipc_server(
    listener: UnixListener,
    requests: mpsc::UnboundedSender<IpcRequest>,
) {
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "IPC accept failed");
                    continue;
                }
            };
            let requests = requests.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_ipc_connection(stream, requests).await {
                    debug!(error = %e, "IPC connection ended");
                }
            });
        }
    });
}

async fn serve_ipc_connection<S>(
    stream: S,
    requests: mpsc::UnboundedSender<IpcRequest>,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = PacketStream::new(stream);
    let frame = read_frame(&mut stream).await?;

    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = requests.send(IpcRequest {
        frame,
        reply: reply_tx,
    });

    let (reply, data) = reply_rx
        .await
        .unwrap_or((IpcReplyType::Timeout, Bytes::new()));
    stream.write_and_flush(&encode_reply(reply, &data)).await
}

/// Remove a stale socket file before binding
pub fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}
