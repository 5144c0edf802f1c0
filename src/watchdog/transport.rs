/// Watchdog peer socket plumbing
///
/// Owns nothing long-lived itself: every socket gets a reader task
/// feeding framed packets into the driver's event channel and a
/// writer task draining a per-connection send handle. Inbound
/// connections stay unidentified until their first frame is a valid
/// AddNode; the driver resolves the identity and the reader is told
/// which peer it now speaks for.
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::protocol::stream::PacketStream;
use crate::protocol::ProtocolResult;

use super::packet::{NodeInfoMessage, PacketType, WdPacket};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// An inbound socket must identify itself within this budget
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the socket layer reports to the watchdog driver
#[derive(Debug)]
pub enum TransportEvent {
    /// A framed packet from an identified peer
    PeerPacket { peer_id: usize, packet: WdPacket },
    /// An outbound connect completed; the writer handle is attached
    /// to the peer by the driver
    OutboundEstablished {
        peer_id: usize,
        writer: mpsc::UnboundedSender<WdPacket>,
    },
    OutboundFailed { peer_id: usize },
    /// An inbound socket presented an AddNode; the driver answers
    /// with the matching peer id (or None to drop the socket)
    InboundHandshake {
        info: NodeInfoMessage,
        packet: WdPacket,
        writer: mpsc::UnboundedSender<WdPacket>,
        id_reply: oneshot::Sender<Option<usize>>,
    },
    /// A socket direction died
    ConnectionClosed { peer_id: usize, inbound: bool },
}

fn spawn_writer<W>(mut half: PacketStream<WriteHalf<W>>) -> mpsc::UnboundedSender<WdPacket>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<WdPacket>();
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if half.write_and_flush(&packet.encode()).await.is_err() {
                break;
            }
        }
    });
    tx
}

async fn read_loop<R>(
    mut half: PacketStream<ReadHalf<R>>,
    peer_id: usize,
    inbound: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        match WdPacket::read_from(&mut half).await {
            Ok(packet) => {
                if events
                    .send(TransportEvent::PeerPacket { peer_id, packet })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                debug!(peer_id, inbound, error = %e, "watchdog socket closed");
                let _ = events.send(TransportEvent::ConnectionClosed { peer_id, inbound });
                return;
            }
        }
    }
}

/// Dial a peer. Reports either OutboundEstablished followed by a
/// packet stream, or OutboundFailed.
pub fn spawn_outbound(
    peer_id: usize,
    addr: String,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            _ => {
                debug!(peer_id, addr = addr.as_str(), "watchdog peer unreachable");
                let _ = events.send(TransportEvent::OutboundFailed { peer_id });
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = spawn_writer(PacketStream::new(write_half));
        if events
            .send(TransportEvent::OutboundEstablished { peer_id, writer })
            .is_err()
        {
            return;
        }
        read_loop(PacketStream::new(read_half), peer_id, false, events).await;
    });
}

/// Accept loop for the watchdog port
pub fn spawn_listener(
    listener: TcpListener,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "watchdog accept failed");
                    continue;
                }
            };
            debug!(peer = %peer_addr, "inbound watchdog connection");
            let _ = stream.set_nodelay(true);
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_inbound(stream, events).await {
                    debug!(peer = %peer_addr, error = %e, "inbound watchdog connection ended");
                }
            });
        }
    });
}

/// Handle one inbound socket: require AddNode first, get the peer id
/// from the driver, then pump frames
async fn serve_inbound(
    stream: TcpStream,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> ProtocolResult<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = PacketStream::new(read_half);

    let first = timeout(HANDSHAKE_TIMEOUT, WdPacket::read_from(&mut reader))
        .await
        .map_err(|_| {
            crate::protocol::ProtocolError::malformed("inbound peer did not identify in time")
        })??;

    if first.packet_type != PacketType::AddNode {
        return Err(crate::protocol::ProtocolError::malformed(
            "inbound peer spoke before identifying itself",
        ));
    }
    let info: NodeInfoMessage = first.json()?;

    let writer = spawn_writer(PacketStream::new(write_half));
    let (id_tx, id_rx) = oneshot::channel();
    let _ = events.send(TransportEvent::InboundHandshake {
        info,
        packet: first,
        writer,
        id_reply: id_tx,
    });

    let peer_id = match id_rx.await {
        Ok(Some(peer_id)) => peer_id,
        _ => {
            // Unidentified or rejected; the driver already answered
            // on the wire
            return Ok(());
        }
    };

    read_loop(reader, peer_id, true, events).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::fsm::WdState;
    use crate::watchdog::packet::BeaconMessage;
    use bytes::Bytes;

    fn node_info(name: &str) -> NodeInfoMessage {
        NodeInfoMessage {
            node_name: name.into(),
            hostname: "127.0.0.1".into(),
            wd_port: 9000,
            proxy_port: 9999,
            priority: 50,
            beacon: BeaconMessage {
                state: WdState::Loading.as_u8(),
                seconds_since_startup: 1,
                seconds_since_state_change: 1,
                quorum_status: -1,
                standby_count: 0,
                escalated: false,
            },
            auth_hash: None,
        }
    }

    #[tokio::test]
    async fn test_outbound_to_closed_port_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_outbound(3, "127.0.0.1:1".into(), tx);
        match rx.recv().await.unwrap() {
            TransportEvent::OutboundFailed { peer_id } => assert_eq!(peer_id, 3),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_handshake_and_packet_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_listener(listener, tx);

        // The remote peer dials in and identifies itself
        let mut remote = PacketStream::new(TcpStream::connect(addr).await.unwrap());
        let hello =
            WdPacket::with_json(PacketType::AddNode, 0, &node_info("portero-1")).unwrap();
        remote.write_and_flush(&hello.encode()).await.unwrap();

        let (writer, id_reply) = match rx.recv().await.unwrap() {
            TransportEvent::InboundHandshake {
                info,
                packet,
                writer,
                id_reply,
            } => {
                assert_eq!(info.node_name, "portero-1");
                assert_eq!(packet.packet_type, PacketType::AddNode);
                (writer, id_reply)
            }
            other => panic!("unexpected event {:?}", other),
        };
        id_reply.send(Some(1)).unwrap();

        // Frames after the handshake arrive tagged with the peer id
        let follow_up = WdPacket::new(PacketType::Info, 7, Bytes::from_static(b"{}"));
        remote.write_and_flush(&follow_up.encode()).await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::PeerPacket { peer_id, packet } => {
                assert_eq!(peer_id, 1);
                assert_eq!(packet.packet_type, PacketType::Info);
                assert_eq!(packet.command_id, 7);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // And the writer reaches the remote side
        writer.send(WdPacket::empty(PacketType::Accept, 7)).unwrap();
        let got = WdPacket::read_from(&mut remote).await.unwrap();
        assert_eq!(got.packet_type, PacketType::Accept);

        // Closing the remote surfaces a ConnectionClosed
        drop(remote);
        match rx.recv().await.unwrap() {
            TransportEvent::ConnectionClosed { peer_id, inbound } => {
                assert_eq!(peer_id, 1);
                assert!(inbound);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_without_add_node_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_listener(listener, tx);

        let mut remote = PacketStream::new(TcpStream::connect(addr).await.unwrap());
        remote
            .write_and_flush(&WdPacket::empty(PacketType::Info, 1).encode())
            .await
            .unwrap();

        // No handshake event is delivered for a rude socket
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
