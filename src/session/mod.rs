/// Frontend session handling
///
/// One task per accepted client: enforce the connection limit, read
/// the startup packet, authenticate, attach a pooled or fresh set of
/// backend connections, proxy until the client quits, then decide
/// whether the backend entry goes back to the pool.
pub mod proxy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::balancer::SessionBalancer;
use crate::error::SessionOutcome;
use crate::pool::{BackendIo, BackendSlot, ConnectionPool, PoolEntry};
use crate::protocol::auth::{self, ClientAuthMethod};
use crate::protocol::message::{self, ErrorFields};
use crate::protocol::startup::{self, InitialMessage, StartupPacket};
use crate::protocol::stream::PacketStream;
use crate::protocol::{CancelKey, ProtocolError, ProtocolMajor, ProtocolResult};
use crate::registry::{
    BackendDescriptor, ClusterRegistry, NodeOpKind, NodeOpRequest, NodeStatus, SessionCancelInfo,
};

/// Pause between per-backend cancel forwards. Lets each backend's
/// cancel take effect before the next one is targeted.
const CANCEL_FORWARD_PAUSE: Duration = Duration::from_secs(1);

/// Probe window used to detect silently dead pooled sockets
const REUSE_PROBE_WINDOW: Duration = Duration::from_millis(1);

/// How sessions reach backend nodes. Erased behind a trait so tests
/// can wire in-memory backends.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, descriptor: &BackendDescriptor) -> ProtocolResult<BackendIo>;
}

/// Production connector: plain TCP with a connect timeout
pub struct TcpBackendConnector {
    pub connect_timeout: Duration,
}

#[async_trait]
impl BackendConnector for TcpBackendConnector {
    async fn connect(&self, descriptor: &BackendDescriptor) -> ProtocolResult<BackendIo> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(descriptor.addr()))
            .await
            .map_err(|_| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to backend {} timed out", descriptor.addr()),
                ))
            })??;
        stream.set_nodelay(true).map_err(ProtocolError::Io)?;
        Ok(Box::new(stream) as BackendIo)
    }
}

/// Session-level knobs distilled from the configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Hard cap on concurrently served frontends
    pub max_children: usize,
    /// Connections held back from the cap for superuser access
    pub reserved_connections: usize,
    /// Budget for reading the startup packet and authenticating
    pub authentication_timeout: Duration,
    pub client_auth: ClientAuthMethod,
    /// user name to password, used on both sides of the proxy
    pub passwords: HashMap<String, String>,
    /// Forward every frontend message to all live backends
    /// (replication mode) instead of the selected node only
    pub dispatch_all: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_children: 32,
            reserved_connections: 0,
            authentication_timeout: Duration::from_secs(60),
            client_auth: ClientAuthMethod::Trust,
            passwords: HashMap::new(),
            dispatch_all: false,
        }
    }
}

/// Everything a session task needs
pub struct SessionContext {
    pub registry: Arc<ClusterRegistry>,
    pub pool: Arc<Mutex<ConnectionPool>>,
    pub balancer: SessionBalancer,
    pub connector: Arc<dyn BackendConnector>,
    pub settings: SessionSettings,
}

/// Decrements the frontend connection counter when the session ends,
/// whatever path it takes out.
struct ConnectionGuard<'a>(&'a ClusterRegistry);

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.connection_down();
    }
}

/// Serve one accepted frontend connection to completion
pub async fn serve_session<S>(ctx: &SessionContext, io: S, client: &str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut frontend = PacketStream::new(io);

    let count = ctx.registry.connection_up();
    let _guard = ConnectionGuard(ctx.registry.as_ref());

    let limit = ctx
        .settings
        .max_children
        .saturating_sub(ctx.settings.reserved_connections);
    if count > limit {
        warn!(client, count, limit, "refusing frontend, connection limit reached");
        send_fatal(
            &mut frontend,
            ProtocolMajor::V3,
            "53300",
            "sorry, too many clients already",
        )
        .await;
        return;
    }

    // The startup phase runs under the authentication timeout; a
    // stalled client cannot hold the slot open
    let initial = match timeout(
        ctx.settings.authentication_timeout,
        read_startup_phase(&mut frontend),
    )
    .await
    {
        Ok(initial) => initial,
        Err(_) => {
            warn!(client, "authentication timeout while reading startup packet");
            return;
        }
    };

    let startup = match initial {
        Ok(InitialMessage::Startup(packet)) => packet,
        Ok(InitialMessage::Cancel(key)) => {
            handle_cancel_request(ctx, key).await;
            return;
        }
        Ok(InitialMessage::SslRequest) | Ok(InitialMessage::GssEncRequest) => {
            // read_startup_phase answers these itself; reaching here
            // means the client closed after the decline
            return;
        }
        Err(ProtocolError::StreamClosed) => {
            // Routine: clients probe and reconnect during auth setup
            debug!(client, "frontend closed before startup completed");
            return;
        }
        Err(ProtocolError::MissingUser) => {
            send_fatal(
                &mut frontend,
                ProtocolMajor::V3,
                "28000",
                "no PostgreSQL user name specified in startup packet",
            )
            .await;
            return;
        }
        Err(e) => {
            warn!(client, error = %e, "failed while reading startup packet");
            send_fatal(&mut frontend, ProtocolMajor::V3, "08P01", &e.to_string()).await;
            return;
        }
    };

    info!(
        client,
        user = startup.user(),
        database = startup.database(),
        major = startup.major().as_u16(),
        "frontend session starting"
    );

    let snapshot = ctx.registry.snapshot();
    let alive_nodes: Vec<usize> = snapshot
        .iter()
        .filter(|d| d.status.is_alive())
        .map(|d| d.id)
        .collect();
    if alive_nodes.is_empty() {
        send_fatal(
            &mut frontend,
            startup.major(),
            "57000",
            "all backend nodes are down, portero requires at least one valid node",
        )
        .await;
        return;
    }

    // Client authentication, also under the auth timeout
    let auth_result = timeout(
        ctx.settings.authentication_timeout,
        auth::authenticate_frontend(
            &mut frontend,
            startup.user(),
            ctx.settings.client_auth,
            ctx.settings.passwords.get(startup.user()).map(|s| s.as_str()),
        ),
    )
    .await;
    match auth_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(client, user = startup.user(), error = %e, "client authentication failed");
            send_fatal(&mut frontend, startup.major(), "28P01", &e.to_string()).await;
            return;
        }
        Err(_) => {
            warn!(client, "authentication timeout");
            return;
        }
    }

    // V2 clients get a dedicated unpooled pass-through path; the V2
    // message framing carries no lengths to multiplex on
    if startup.major() == ProtocolMajor::V2 {
        serve_pass_through(ctx, frontend, &startup, &snapshot).await;
        return;
    }

    // Attach backends: pooled when the canonical startup bytes match,
    // freshly connected otherwise
    let (mut entry, reused) = match attach_backends(ctx, &startup, &snapshot, &alive_nodes).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(client, error = %e, "could not attach backend connections");
            send_fatal(
                &mut frontend,
                startup.major(),
                "08006",
                "could not connect to backend database nodes",
            )
            .await;
            return;
        }
    };

    // Greet the frontend from the master slot: auth ok, the cached or
    // fresh parameter set, the cancel key, ready-for-query
    if let Err(e) = greet_frontend(&mut frontend, &entry).await {
        warn!(client, error = %e, "failed to greet frontend");
        entry.terminate_all().await;
        return;
    }
    debug!(client, reused, "session wired to backend entry");

    let frontend_key = match entry.master_slot() {
        Some(slot) => slot.cancel_key,
        None => {
            entry.terminate_all().await;
            return;
        }
    };
    ctx.registry.register_cancel_keys(
        frontend_key,
        SessionCancelInfo {
            user: startup.user().to_string(),
            database: startup.database().to_string(),
            backend_keys: entry
                .slot_node_ids()
                .iter()
                .filter_map(|id| entry.slot(*id).map(|s| (*id, s.cancel_key)))
                .collect(),
        },
    );

    let main_node = select_main_node(ctx, &startup, &snapshot, &entry);
    let outcome = proxy::run(ctx, &mut frontend, &mut entry, main_node).await;

    if outcome == SessionOutcome::Deadlock {
        // Forced failover of the backend that reported the deadlock
        ctx.registry
            .submit_request(NodeOpRequest::new(NodeOpKind::Down, vec![main_node]));
    }

    ctx.registry.unregister_cancel_keys(frontend_key);

    // Reset pass, then the caching decision
    let clean = if outcome.allows_caching() {
        proxy::reset_entry(&mut entry, ctx.settings.dispatch_all, main_node).await
    } else {
        false
    };

    if clean && !startup.is_template_like_database() {
        let evicted = {
            let mut pool = ctx.pool.lock().await;
            pool.release(entry, Instant::now())
        };
        if let Some(mut evicted) = evicted {
            evicted.terminate_all().await;
        }
        debug!(client, "backend entry returned to pool");
    } else {
        entry.terminate_all().await;
        debug!(client, ?outcome, "backend entry discarded");
    }

    info!(client, ?outcome, "frontend session finished");
}

/// Read the first real startup packet, declining SSL and GSSAPI
/// negotiation requests along the way
async fn read_startup_phase<S>(
    frontend: &mut PacketStream<S>,
) -> ProtocolResult<InitialMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match startup::read_initial_message(frontend).await? {
            InitialMessage::SslRequest | InitialMessage::GssEncRequest => {
                frontend.write_and_flush(b"N").await?;
            }
            other => return Ok(other),
        }
    }
}

/// Route a cancel request to every backend of the owning session
async fn handle_cancel_request(ctx: &SessionContext, key: CancelKey) {
    let Some(info) = ctx.registry.lookup_cancel_keys(key) else {
        info!(pid = key.pid, "invalid cancel key, request ignored");
        return;
    };
    info!(
        pid = key.pid,
        user = info.user.as_str(),
        database = info.database.as_str(),
        "forwarding cancel request"
    );

    let snapshot = ctx.registry.snapshot();
    for (node_id, backend_key) in &info.backend_keys {
        let Some(descriptor) = snapshot.get(*node_id) else {
            continue;
        };
        if !descriptor.status.is_alive() {
            continue;
        }
        match ctx.connector.connect(descriptor).await {
            Ok(io) => {
                let mut stream = PacketStream::new(io);
                // Each backend gets its own stored key, not the one
                // the client quoted
                if let Err(e) = stream
                    .write_and_flush(&startup::encode_cancel_request(*backend_key))
                    .await
                {
                    warn!(node_id, error = %e, "failed to forward cancel request");
                } else {
                    debug!(
                        node_id,
                        backend_pid = backend_key.pid,
                        "cancel request forwarded"
                    );
                }
            }
            Err(e) => {
                warn!(node_id, error = %e, "could not open cancel socket to backend");
            }
        }
        // Give the backend time to act on the cancel before the next
        // node is targeted
        tokio::time::sleep(CANCEL_FORWARD_PAUSE).await;
    }
}

/// Acquire a pooled entry or build a fresh one
async fn attach_backends(
    ctx: &SessionContext,
    startup: &StartupPacket,
    snapshot: &[BackendDescriptor],
    alive_nodes: &[usize],
) -> ProtocolResult<(PoolEntry, bool)> {
    if let Some(entry) = acquire_checked(ctx, startup, alive_nodes).await {
        return Ok((entry, true));
    }
    let entry = create_entry(ctx, startup, snapshot, alive_nodes).await?;
    Ok((entry, false))
}

/// Pool lookup plus a liveness probe of every cached socket; entries
/// that died while idle are discarded as a whole
async fn acquire_checked(
    ctx: &SessionContext,
    startup: &StartupPacket,
    alive_nodes: &[usize],
) -> Option<PoolEntry> {
    let mut entry = {
        let mut pool = ctx.pool.lock().await;
        pool.acquire(startup, alive_nodes)?
    };

    let mut dead = false;
    for slot in entry.slots_mut() {
        if slot.stream.probe_closed(REUSE_PROBE_WINDOW).await {
            debug!(node_id = slot.node_id, "pooled backend died while idle");
            dead = true;
            break;
        }
    }
    if dead {
        entry.terminate_all().await;
        return None;
    }
    Some(entry)
}

/// Open and authenticate a connection to every alive backend. The
/// per-node connects run concurrently, so setup latency tracks the
/// slowest backend rather than the node count.
async fn create_entry(
    ctx: &SessionContext,
    startup: &StartupPacket,
    snapshot: &[BackendDescriptor],
    alive_nodes: &[usize],
) -> ProtocolResult<PoolEntry> {
    let mut entry = PoolEntry::new(startup.clone(), snapshot.len());

    let connections = join_all(alive_nodes.iter().map(|node_id| {
        let descriptor = &snapshot[*node_id];
        async move { (descriptor, connect_and_auth(ctx, descriptor, startup).await) }
    }))
    .await;

    for (descriptor, result) in connections {
        match result {
            Ok(slot) => {
                if descriptor.status == NodeStatus::ConnectWait {
                    ctx.registry.set_status(descriptor.id, NodeStatus::Up);
                }
                entry.install_slot(slot);
            }
            Err(e) => {
                warn!(node_id = descriptor.id, error = %e, "backend connection failed");
                ctx.registry.submit_request(NodeOpRequest::new(
                    NodeOpKind::Down,
                    vec![descriptor.id],
                ));
            }
        }
    }

    if entry.master_slot().is_none() {
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "no backend node accepted the connection",
        )));
    }
    Ok(entry)
}

async fn connect_and_auth(
    ctx: &SessionContext,
    descriptor: &BackendDescriptor,
    startup: &StartupPacket,
) -> ProtocolResult<BackendSlot> {
    let io = ctx.connector.connect(descriptor).await?;
    let mut stream = PacketStream::new(io);
    stream.write_and_flush(&startup.to_wire_bytes()).await?;

    let greeting = auth::authenticate_backend(
        &mut stream,
        startup,
        ctx.settings.passwords.get(startup.user()).map(|s| s.as_str()),
    )
    .await?;

    Ok(BackendSlot::new(
        descriptor.id,
        stream,
        greeting.cancel_key,
        greeting.parameters,
        greeting.tstate,
    ))
}

/// Send the post-auth greeting the client would have received from a
/// fresh backend: AuthenticationOk, the parameter set, BackendKeyData,
/// ReadyForQuery
async fn greet_frontend<S>(
    frontend: &mut PacketStream<S>,
    entry: &PoolEntry,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let master = entry
        .master_slot()
        .ok_or_else(|| ProtocolError::malformed("entry without a master slot"))?;

    frontend.write_bytes(&message::authentication_ok().encode());
    for (name, value) in &master.parameters {
        frontend.write_bytes(&message::parameter_status(name, value).encode());
    }
    frontend.write_bytes(&message::backend_key_data(master.cancel_key).encode());
    frontend.write_bytes(&message::ready_for_query(master.tstate).encode());
    frontend.flush().await
}

/// Pick the node that serves this session's traffic
fn select_main_node(
    ctx: &SessionContext,
    startup: &StartupPacket,
    snapshot: &[BackendDescriptor],
    entry: &PoolEntry,
) -> usize {
    let mut rng = rand::thread_rng();
    let selected = ctx.balancer.select_node(
        snapshot,
        startup.database(),
        startup.application_name(),
        &mut rng,
    );
    match selected {
        Some(node) if entry.slot(node).is_some() => node,
        _ => entry
            .master_slot()
            .map(|slot| slot.node_id)
            .unwrap_or_default(),
    }
}

/// Legacy V2 sessions: single backend, raw byte relay, never pooled
async fn serve_pass_through<S>(
    ctx: &SessionContext,
    mut frontend: PacketStream<S>,
    startup: &StartupPacket,
    snapshot: &[BackendDescriptor],
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut rng = rand::thread_rng();
    let node = match ctx
        .balancer
        .select_node(snapshot, startup.database(), None, &mut rng)
    {
        Some(node) => node,
        None => return,
    };

    let io = match ctx.connector.connect(&snapshot[node]).await {
        Ok(io) => io,
        Err(e) => {
            warn!(node, error = %e, "pass-through backend connect failed");
            send_fatal(
                &mut frontend,
                ProtocolMajor::V2,
                "08006",
                "could not connect to backend database nodes",
            )
            .await;
            return;
        }
    };

    let mut backend = PacketStream::new(io);
    if backend
        .write_and_flush(&startup.to_wire_bytes())
        .await
        .is_err()
    {
        return;
    }

    let leftover = frontend.drain_buffered();
    let mut frontend_io = frontend.into_inner();
    let mut backend_io = backend.into_inner();
    if !leftover.is_empty() {
        use tokio::io::AsyncWriteExt;
        if backend_io.write_all(&leftover).await.is_err() {
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut frontend_io, &mut backend_io).await {
        Ok((sent, received)) => {
            debug!(node, sent, received, "pass-through session finished");
        }
        Err(e) => {
            debug!(node, error = %e, "pass-through session ended with error");
        }
    }
}

/// Send a FATAL report in the form the client's protocol expects
async fn send_fatal<S>(
    frontend: &mut PacketStream<S>,
    major: ProtocolMajor,
    sqlstate: &str,
    text: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = match major {
        ProtocolMajor::V3 => message::error_response_v3(&ErrorFields::fatal(sqlstate, text)),
        ProtocolMajor::V2 => message::error_response_v2(&format!("FATAL: {}", text)),
    };
    let _ = frontend.write_and_flush(&msg.encode()).await;
}

#[cfg(test)]
pub(crate) mod testing;
