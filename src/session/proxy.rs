/// The inner proxy loop and the end-of-session reset pass
///
/// Messages are forwarded frame-by-frame. The loop watches the
/// ReadyForQuery transaction marker so the caching decision knows the
/// state the backend was left in, and turns backend failures into
/// failover requests.
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::SessionOutcome;
use crate::pool::{BackendSlot, PoolEntry};
use crate::protocol::message::{kind, WireMessage};
use crate::protocol::stream::PacketStream;
use crate::protocol::{message, ProtocolResult, TransactionState};
use crate::registry::{NodeOpKind, NodeOpRequest};

use super::SessionContext;

/// SQLSTATE a backend reports when it chose this session as a
/// deadlock victim
const DEADLOCK_DETECTED: &[u8] = b"40P01";

enum Side {
    Frontend(ProtocolResult<u8>),
    Backend(ProtocolResult<u8>),
}

/// Proxy frontend and backend until one side ends the session
pub async fn run<S>(
    ctx: &SessionContext,
    frontend: &mut PacketStream<S>,
    entry: &mut PoolEntry,
    main_node: usize,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dispatch_all = ctx.settings.dispatch_all;

    loop {
        let side = {
            let Some(main) = entry.slot_mut(main_node) else {
                return SessionOutcome::Error;
            };
            tokio::select! {
                r = frontend.peek_byte() => Side::Frontend(r),
                r = main.stream.peek_byte() => Side::Backend(r),
            }
        };

        match side {
            Side::Frontend(Err(e)) => {
                let idle = entry
                    .slot(main_node)
                    .map(|s| s.tstate == TransactionState::Idle)
                    .unwrap_or(true);
                return if e.is_closed() && idle {
                    SessionOutcome::End
                } else {
                    debug!(error = %e, "frontend left mid-session");
                    SessionOutcome::Error
                };
            }
            Side::Frontend(Ok(_)) => {
                let msg = match WireMessage::read_from(frontend).await {
                    Ok(msg) => msg,
                    Err(_) => return SessionOutcome::Error,
                };

                if msg.kind == kind::TERMINATE {
                    // The client is done; the pooled backend must not
                    // see the Terminate or the cached connection dies
                    return SessionOutcome::End;
                }

                let sent = if dispatch_all {
                    // Writes go to every live backend left-to-right
                    forward_to_all(entry, &msg).await
                } else {
                    forward_to_slot(entry, main_node, &msg).await
                };
                if sent.is_err() {
                    ctx.registry
                        .submit_request(NodeOpRequest::new(NodeOpKind::Down, vec![main_node]));
                    return SessionOutcome::Error;
                }
            }
            Side::Backend(Err(e)) => {
                warn!(node_id = main_node, error = %e, "backend connection lost mid-session");
                ctx.registry
                    .submit_request(NodeOpRequest::new(NodeOpKind::Down, vec![main_node]));
                return SessionOutcome::Error;
            }
            Side::Backend(Ok(_)) => {
                let msg = {
                    let Some(main) = entry.slot_mut(main_node) else {
                        return SessionOutcome::Error;
                    };
                    match WireMessage::read_from(&mut main.stream).await {
                        Ok(msg) => msg,
                        Err(_) => {
                            ctx.registry.submit_request(NodeOpRequest::new(
                                NodeOpKind::Down,
                                vec![main_node],
                            ));
                            return SessionOutcome::Error;
                        }
                    }
                };

                let mut deadlock = false;
                match msg.kind {
                    kind::READY_FOR_QUERY => {
                        if let Ok(tstate) = message::parse_ready_for_query(&msg) {
                            if let Some(main) = entry.slot_mut(main_node) {
                                main.tstate = tstate;
                            }
                        }
                        if dispatch_all {
                            // The session holds the next client message
                            // until every replica acknowledged this one
                            if drain_replicas(entry, main_node).await.is_err() {
                                return SessionOutcome::Error;
                            }
                        }
                    }
                    kind::ERROR_RESPONSE => {
                        if dispatch_all && contains_sqlstate(&msg, DEADLOCK_DETECTED) {
                            deadlock = true;
                        }
                    }
                    _ => {}
                }

                if frontend.write_and_flush(&msg.encode()).await.is_err() {
                    return SessionOutcome::Error;
                }
                if deadlock {
                    return SessionOutcome::Deadlock;
                }
            }
        }
    }
}

async fn forward_to_slot(
    entry: &mut PoolEntry,
    node_id: usize,
    msg: &WireMessage,
) -> ProtocolResult<()> {
    let slot = entry
        .slot_mut(node_id)
        .ok_or_else(|| crate::protocol::ProtocolError::malformed("missing backend slot"))?;
    slot.stream.write_and_flush(&msg.encode()).await
}

async fn forward_to_all(entry: &mut PoolEntry, msg: &WireMessage) -> ProtocolResult<()> {
    for slot in entry.slots_mut() {
        slot.stream.write_and_flush(&msg.encode()).await?;
    }
    Ok(())
}

/// After the main backend reached ReadyForQuery, consume the other
/// backends' replies up to their own ReadyForQuery
async fn drain_replicas(entry: &mut PoolEntry, main_node: usize) -> ProtocolResult<()> {
    let node_ids = entry.slot_node_ids();
    for node_id in node_ids {
        if node_id == main_node {
            continue;
        }
        if let Some(slot) = entry.slot_mut(node_id) {
            drain_to_ready(slot).await?;
        }
    }
    Ok(())
}

/// Read and discard until ReadyForQuery, recording the new state
pub(crate) async fn drain_to_ready(slot: &mut BackendSlot) -> ProtocolResult<TransactionState> {
    loop {
        let msg = WireMessage::read_from(&mut slot.stream).await?;
        if msg.kind == kind::READY_FOR_QUERY {
            let tstate = message::parse_ready_for_query(&msg)?;
            slot.tstate = tstate;
            return Ok(tstate);
        }
    }
}

/// Run one simple query on a slot, discarding the result rows
pub(crate) async fn simple_query(
    slot: &mut BackendSlot,
    sql: &str,
) -> ProtocolResult<TransactionState> {
    let mut payload = bytes::BytesMut::with_capacity(sql.len() + 1);
    payload.extend_from_slice(sql.as_bytes());
    payload.extend_from_slice(&[0]);
    slot.stream
        .write_and_flush(&WireMessage::new(kind::QUERY, payload.freeze()).encode())
        .await?;
    drain_to_ready(slot).await
}

/// Reset backend connection state before the entry returns to the
/// pool: abort any open transaction, then discard session state.
/// Returns false when any backend misbehaved; such entries are not
/// cached.
pub async fn reset_entry(entry: &mut PoolEntry, dispatch_all: bool, main_node: usize) -> bool {
    let node_ids = entry.slot_node_ids();
    for node_id in node_ids {
        if !dispatch_all && node_id != main_node {
            // Untouched slots are still in their cached state
            continue;
        }
        let Some(slot) = entry.slot_mut(node_id) else {
            continue;
        };
        if slot.tstate != TransactionState::Idle {
            if simple_query(slot, "ABORT").await.is_err() {
                return false;
            }
        }
        match simple_query(slot, "DISCARD ALL").await {
            Ok(TransactionState::Idle) => {}
            _ => return false,
        }
    }
    true
}

fn contains_sqlstate(msg: &WireMessage, sqlstate: &[u8]) -> bool {
    msg.payload
        .windows(sqlstate.len())
        .any(|window| window == sqlstate)
}
