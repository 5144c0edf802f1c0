pub mod balancer;
pub mod config;
pub mod error;
/// Portero - a connection-pooling, load-balancing failover proxy for
/// PostgreSQL clusters
///
/// Portero speaks the PostgreSQL wire protocol on both sides: clients
/// land on a pingora TCP service and are dispatched to a pool of
/// authenticated backend connections, while a watchdog task
/// coordinates failover decisions with peer portero instances to
/// avoid split-brain.
pub mod failover;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod utils;
pub mod watchdog;

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

// Pingora framework imports for the TCP services
use pingora::apps::ServerApp;
use pingora_core::listeners::Listeners;
use pingora_core::protocols::Stream;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::{background_service, BackgroundService};
use pingora_core::services::listening::Service;

use crate::balancer::{RedirectRule, SessionBalancer};
use crate::config::Config;
use crate::failover::{FailoverArbiter, FailoverCoordinator, LocalArbiter};
use crate::health::{HealthCheckManager, HealthThresholds, PgHealthChecker};
use crate::pool::ConnectionPool;
use crate::protocol::auth::ClientAuthMethod;
use crate::registry::{BackendDescriptor, ClusterRegistry, NodeRole, NodeStatus};
use crate::session::{serve_session, SessionContext, SessionSettings, TcpBackendConnector};
use crate::watchdog::{watchdog_channel, WatchdogDriver, WatchdogHandle, WatchdogSettings};

/// Main portero instance wiring the pingora server
pub struct Portero {
    config: Config,
    server: Option<Server>,
}

impl Portero {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            server: None,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize the pingora server
    pub fn initialize(&mut self, opt: Option<Opt>) -> Result<(), Box<dyn Error + Send + Sync>> {
        let server = Server::new(opt)?;
        self.server = Some(server);
        Ok(())
    }

    /// Check if the server is initialized
    pub fn is_initialized(&self) -> bool {
        self.server.is_some()
    }

    pub fn run(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(mut server) = self.server.take() else {
            return Err("Server not initialized. Call initialize() first.".into());
        };
        server.bootstrap();

        let registry = Arc::new(ClusterRegistry::new(
            backend_descriptors(&self.config),
            self.config.status_file_path(),
        ));
        let pool = Arc::new(tokio::sync::Mutex::new(ConnectionPool::new(
            self.config.pool.max_pool,
        )));
        let balancer = session_balancer(&self.config)?;
        let settings = session_settings(&self.config)?;

        // Watchdog-enabled deployments route failover requests through
        // the cluster; standalone ones decide locally
        let (arbiter, watchdog_input): (
            Arc<dyn FailoverArbiter>,
            Option<(
                WatchdogHandle,
                tokio::sync::mpsc::UnboundedReceiver<watchdog::DriverInput>,
            )>,
        ) = if self.config.watchdog.enabled {
            let (handle, input_rx) = watchdog_channel();
            (Arc::new(handle.clone()), Some((handle, input_rx)))
        } else {
            (Arc::new(LocalArbiter), None)
        };

        let coordinator = Arc::new(FailoverCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            arbiter,
        ));

        let (watchdog_handle, watchdog_driver) = match watchdog_input {
            Some((handle, input_rx)) => {
                let driver = WatchdogDriver::new(
                    watchdog_settings(&self.config)?,
                    Arc::clone(&registry),
                    Arc::clone(&coordinator),
                    input_rx,
                );
                (Some(handle), Some(driver))
            }
            None => (None, None),
        };

        let ctx = Arc::new(SessionContext {
            registry: Arc::clone(&registry),
            pool: Arc::clone(&pool),
            balancer,
            connector: Arc::new(TcpBackendConnector {
                connect_timeout: Duration::from_millis(
                    self.config.server.backend_connect_timeout_ms,
                ),
            }),
            settings,
        });

        let runtime = ProxyRuntime {
            registry,
            pool,
            coordinator,
            watchdog_driver: std::sync::Mutex::new(watchdog_driver),
            watchdog_handle,
            health: self.config.health.clone(),
            connection_life_time: Duration::from_secs(self.config.pool.connection_life_time_sec),
        };
        let background = background_service("portero-runtime", runtime);

        let proxy_service = Service::with_listeners(
            "PostgreSQL Proxy".to_string(),
            Listeners::tcp(&self.config.server.listen_addr),
            PgProxyApp { ctx },
        );

        server.add_service(proxy_service);
        server.add_service(background);

        log::info!(
            "portero listening on {} with {} backend node(s)",
            self.config.server.listen_addr,
            self.config.backend.len()
        );

        server.run_forever();
    }
}

/// Pingora app serving one frontend per accepted connection
pub struct PgProxyApp {
    ctx: Arc<SessionContext>,
}

#[async_trait]
impl ServerApp for PgProxyApp {
    async fn process_new(
        self: &Arc<Self>,
        io: Stream,
        _shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        let client_addr = io
            .get_socket_digest()
            .and_then(|digest| digest.peer_addr().cloned())
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| utils::generate_id("client"));

        serve_session(&self.ctx, io, &client_addr).await;
        None
    }
}

/// All long-running internal loops, registered as one pingora
/// background service
struct ProxyRuntime {
    registry: Arc<ClusterRegistry>,
    pool: Arc<tokio::sync::Mutex<ConnectionPool>>,
    coordinator: Arc<FailoverCoordinator>,
    watchdog_driver: std::sync::Mutex<Option<WatchdogDriver>>,
    watchdog_handle: Option<WatchdogHandle>,
    health: config::HealthConfig,
    connection_life_time: Duration,
}

#[async_trait]
impl BackgroundService for ProxyRuntime {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        // Failover coordinator: drains the node-operation queue
        {
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                coordinator.run().await;
            });
        }

        // Watchdog driver, when clustering is enabled
        if let Some(driver) = self.watchdog_driver.lock().ok().and_then(|mut d| d.take()) {
            tokio::spawn(async move {
                if let Err(e) = driver.run().await {
                    // Operating without cluster authority is worse
                    // than restarting
                    log::error!("watchdog terminated: {}", e);
                    std::process::exit(3);
                }
            });
        }

        // Per-node health check workers
        if self.health.interval_sec > 0 {
            for node_id in 0..self.registry.node_count() {
                let manager = HealthCheckManager::new(
                    Box::new(PgHealthChecker::new(
                        Duration::from_secs(self.health.interval_sec),
                        Duration::from_secs(self.health.timeout_sec),
                    )),
                    HealthThresholds {
                        failure_threshold: self.health.failure_threshold,
                        success_threshold: self.health.success_threshold,
                    },
                );
                let registry = Arc::clone(&self.registry);
                tokio::spawn(async move {
                    manager.run_health_checks(registry, node_id).await;
                });
            }
        }

        // Idle pool sweeper
        if !self.connection_life_time.is_zero() {
            let pool = Arc::clone(&self.pool);
            let life_time = self.connection_life_time;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let expired = {
                        let mut pool = pool.lock().await;
                        pool.sweep(life_time, Instant::now())
                    };
                    for mut entry in expired {
                        log::debug!(
                            "closing pooled entry for {} idle longer than {}",
                            entry.startup.user(),
                            utils::format_duration(life_time)
                        );
                        entry.terminate_all().await;
                    }
                }
            });
        }

        let _ = shutdown.changed().await;
        if let Some(handle) = &self.watchdog_handle {
            handle.shutdown();
        }
    }
}

/// Map configured backends into registry descriptors. Nodes start in
/// ConnectWait until their first successful connection.
fn backend_descriptors(config: &Config) -> Vec<BackendDescriptor> {
    config
        .backend
        .iter()
        .enumerate()
        .map(|(id, b)| BackendDescriptor {
            id,
            host: b.host.clone(),
            port: b.port,
            weight: b.weight,
            role: match b.role.as_str() {
                "primary" => NodeRole::Primary,
                "standby" => NodeRole::Standby,
                _ => NodeRole::Unknown,
            },
            status: NodeStatus::ConnectWait,
        })
        .collect()
}

fn session_balancer(config: &Config) -> Result<SessionBalancer, Box<dyn Error + Send + Sync>> {
    let database_rules =
        RedirectRule::parse_list(&config.balancer.database_redirect_preference_list)
            .map_err(|e| format!("database_redirect_preference_list: {}", e))?;
    let app_rules = RedirectRule::parse_list(&config.balancer.app_name_redirect_preference_list)
        .map_err(|e| format!("app_name_redirect_preference_list: {}", e))?;
    Ok(SessionBalancer::new(database_rules, app_rules))
}

fn session_settings(config: &Config) -> Result<SessionSettings, Box<dyn Error + Send + Sync>> {
    let client_auth = match config.auth.method.as_str() {
        "trust" => ClientAuthMethod::Trust,
        "md5" => ClientAuthMethod::Md5,
        other => return Err(format!("unsupported auth method: {}", other).into()),
    };
    Ok(SessionSettings {
        max_children: config.server.max_children,
        reserved_connections: config.server.reserved_connections,
        authentication_timeout: Duration::from_secs(config.server.authentication_timeout_sec),
        client_auth,
        passwords: config.auth.passwords.clone(),
        dispatch_all: config.pool.replication_mode,
    })
}

fn watchdog_settings(config: &Config) -> Result<WatchdogSettings, Box<dyn Error + Send + Sync>> {
    let wd = &config.watchdog;
    let proxy_port = config
        .server
        .listen_addr
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or("listen_addr must carry a port for watchdog identity")?;
    let node_name = if wd.node_name.is_empty() {
        wd.hostname.clone()
    } else {
        wd.node_name.clone()
    };
    Ok(WatchdogSettings {
        node_name,
        hostname: wd.hostname.clone(),
        wd_port: wd.wd_port,
        proxy_port,
        priority: wd.priority,
        auth_key: wd.auth_key.clone(),
        peers: wd
            .peers
            .iter()
            .map(|p| watchdog::peer::PeerAddress {
                hostname: p.hostname.clone(),
                wd_port: p.wd_port,
                proxy_port: p.proxy_port,
            })
            .collect(),
        listen_addr: Some(format!("0.0.0.0:{}", wd.wd_port)),
        ipc_socket_path: if wd.ipc_socket_path.is_empty() {
            None
        } else {
            Some(wd.ipc_socket_path.clone().into())
        },
        escalation_command: if wd.escalation_command.is_empty() {
            None
        } else {
            Some(wd.escalation_command.clone())
        },
        de_escalation_command: if wd.de_escalation_command.is_empty() {
            None
        } else {
            Some(wd.de_escalation_command.clone())
        },
        consensus: watchdog::consensus::ConsensusSettings {
            failover_when_quorum_exists: wd.failover_when_quorum_exists,
            failover_require_consensus: wd.failover_require_consensus,
            allow_multiple_failover_requests_from_node: wd
                .allow_multiple_failover_requests_from_node,
            enable_consensus_with_half_votes: wd.enable_consensus_with_half_votes,
        },
    })
}
