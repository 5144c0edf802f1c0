/// PostgreSQL wire protocol handling
///
/// This module owns everything that touches raw protocol bytes on the
/// frontend and backend sides: the buffered packet stream, startup
/// packet parsing, message framing, and password authentication.
pub mod auth;
pub mod message;
pub mod startup;
pub mod stream;

use bytes::Bytes;

/// Protocol major versions spoken by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMajor {
    /// Legacy version 2 protocol (fixed-layout startup packet)
    V2,
    /// Version 3 protocol (null-terminated key/value startup options)
    V3,
}

impl ProtocolMajor {
    pub fn as_u16(&self) -> u16 {
        match self {
            ProtocolMajor::V2 => 2,
            ProtocolMajor::V3 => 3,
        }
    }
}

/// Transaction state reported by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// 'I' - idle, not in a transaction block
    Idle,
    /// 'T' - inside a transaction block
    InBlock,
    /// 'E' - in a failed transaction block
    FailedBlock,
}

impl TransactionState {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TransactionState::Idle),
            b'T' => Some(TransactionState::InBlock),
            b'E' => Some(TransactionState::FailedBlock),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            TransactionState::Idle => b'I',
            TransactionState::InBlock => b'T',
            TransactionState::FailedBlock => b'E',
        }
    }
}

/// Protocol-level errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer closed the connection. Routine on authenticated
    /// sessions (client quit); callers branch on this.
    #[error("stream closed by peer")]
    StreamClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("startup packet rejected: {0}")]
    BadStartup(String),

    #[error("no PostgreSQL user name specified in startup packet")]
    MissingUser,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported protocol feature: {0}")]
    Unsupported(String),
}

impl ProtocolError {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        ProtocolError::Malformed(msg.into())
    }

    /// True when the error is an orderly EOF rather than a fault
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::StreamClosed)
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A raw cancel key pair as carried in BackendKeyData / CancelRequest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelKey {
    pub pid: i32,
    pub key: i32,
}

impl CancelKey {
    pub fn new(pid: i32, key: i32) -> Self {
        Self { pid, key }
    }
}

/// Read-only view of a startup packet's identifying fields, used as a
/// pool lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user: String,
    pub database: String,
    pub major: ProtocolMajor,
}

/// Cached ParameterStatus pairs replayed to the frontend on pool reuse
pub type ParameterSet = Vec<(String, String)>;

/// Owned canonical startup packet bytes
pub type CanonicalPacket = Bytes;
