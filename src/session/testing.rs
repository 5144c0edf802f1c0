/// In-memory backends and connectors for session tests
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::pool::BackendIo;
use crate::protocol::message::{self, kind, WireMessage};
use crate::protocol::stream::PacketStream;
use crate::protocol::{CancelKey, ProtocolResult, TransactionState};
use crate::registry::BackendDescriptor;

use super::BackendConnector;

/// Connector that fabricates a scripted PostgreSQL backend per
/// connect call
pub struct FakeBackendConnector {
    pub connects: AtomicUsize,
    next_pid: AtomicI32,
}

impl FakeBackendConnector {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            next_pid: AtomicI32::new(100),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for FakeBackendConnector {
    async fn connect(&self, _descriptor: &BackendDescriptor) -> ProtocolResult<BackendIo> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(8192);
        tokio::spawn(run_scripted_backend(server, pid));
        Ok(Box::new(client) as BackendIo)
    }
}

/// Minimal backend: accepts any startup, answers every simple query
/// with CommandComplete + ReadyForQuery
pub async fn run_scripted_backend(io: DuplexStream, pid: i32) {
    let mut stream = PacketStream::new(io);

    let Ok(len) = stream.read_i32().await else {
        return;
    };
    if stream.read_exact_bytes(len as usize - 4).await.is_err() {
        return;
    }

    let greeting = [
        message::authentication_ok(),
        message::parameter_status("server_version", "15.3"),
        message::parameter_status("client_encoding", "UTF8"),
        message::backend_key_data(CancelKey::new(pid, 7777)),
        message::ready_for_query(TransactionState::Idle),
    ];
    for msg in greeting {
        if stream.write_and_flush(&msg.encode()).await.is_err() {
            return;
        }
    }

    loop {
        let Ok(msg) = WireMessage::read_from(&mut stream).await else {
            return;
        };
        match msg.kind {
            kind::QUERY => {
                let reply = WireMessage::new(
                    kind::COMMAND_COMPLETE,
                    bytes::Bytes::from_static(b"SELECT 1\0"),
                );
                if stream.write_and_flush(&reply.encode()).await.is_err() {
                    return;
                }
                if stream
                    .write_and_flush(
                        &message::ready_for_query(TransactionState::Idle).encode(),
                    )
                    .await
                    .is_err()
                {
                    return;
                }
            }
            kind::TERMINATE => return,
            _ => {}
        }
    }
}

/// Connector that records every frame written to its sockets; used
/// for cancel-forwarding assertions
pub struct RecordingConnector {
    pub connects: AtomicUsize,
    pub frames: Arc<AsyncMutex<Vec<Vec<u8>>>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            frames: Arc::new(AsyncMutex::new(Vec::new())),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for RecordingConnector {
    async fn connect(&self, _descriptor: &BackendDescriptor) -> ProtocolResult<BackendIo> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(256);
        let frames = Arc::clone(&self.frames);
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut server = server;
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            while let Ok(n) = server.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            if !buf.is_empty() {
                frames.lock().await.push(buf);
            }
        });
        Ok(Box::new(client) as BackendIo)
    }
}
