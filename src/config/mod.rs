/// Configuration management for portero
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main portero configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Backend PostgreSQL nodes, indexed by position
    pub backend: Vec<BackendConfig>,
    /// Connection pool configuration
    pub pool: PoolConfig,
    /// Load balancing configuration
    #[serde(default)]
    pub balancer: BalancerConfig,
    /// Client authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Watchdog cluster configuration
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Backend health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on for PostgreSQL clients
    pub listen_addr: String,
    /// Maximum number of concurrently served frontends
    pub max_children: usize,
    /// Connections held back from the limit; going over answers
    /// FATAL 53300
    pub reserved_connections: usize,
    /// Seconds a client may spend in startup and authentication
    pub authentication_timeout_sec: u64,
    /// Backend TCP connect timeout in milliseconds
    pub backend_connect_timeout_ms: u64,
    /// Path of the backend status file; empty disables persistence
    #[serde(default)]
    pub status_file: String,
}

/// One backend PostgreSQL node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// Load balancing weight
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// "primary", "standby", or "unknown"
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_weight() -> f64 {
    1.0
}

fn default_role() -> String {
    "unknown".to_string()
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle pool entries kept per proxy
    pub max_pool: usize,
    /// Seconds an idle entry survives before the sweeper closes it;
    /// zero disables the sweep
    pub connection_life_time_sec: u64,
    /// Forward every client message to all live backends instead of
    /// the selected node only
    #[serde(default)]
    pub replication_mode: bool,
}

/// Load balancing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Comma-separated `database:target(weight)` preferences
    #[serde(default)]
    pub database_redirect_preference_list: String,
    /// Comma-separated `application:target(weight)` preferences;
    /// wins over the database list when both match
    #[serde(default)]
    pub app_name_redirect_preference_list: String,
}

/// Client authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// "trust" or "md5"
    pub method: String,
    /// user name to password; used to answer backend auth challenges
    /// and to verify md5 clients
    #[serde(default)]
    pub passwords: std::collections::HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: "trust".to_string(),
            passwords: std::collections::HashMap::new(),
        }
    }
}

/// Watchdog cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Name this node advertises to its peers
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub hostname: String,
    pub wd_port: u16,
    /// Election priority; larger wins
    pub priority: i32,
    /// Shared key authenticating peer handshakes; empty disables
    #[serde(default)]
    pub auth_key: String,
    /// Unix socket for local IPC commands; empty disables
    #[serde(default)]
    pub ipc_socket_path: String,
    /// Helper command run on escalation / de-escalation
    #[serde(default)]
    pub escalation_command: String,
    #[serde(default)]
    pub de_escalation_command: String,
    /// Other proxy instances in the cluster
    #[serde(default)]
    pub peers: Vec<WatchdogPeerConfig>,
    /// Failover executes only while quorum holds
    #[serde(default = "default_true")]
    pub failover_when_quorum_exists: bool,
    /// Failover needs a majority of votes
    #[serde(default = "default_true")]
    pub failover_require_consensus: bool,
    /// The same node may vote repeatedly for one failover
    #[serde(default)]
    pub allow_multiple_failover_requests_from_node: bool,
    /// Even-sized clusters may decide on exactly half the votes
    #[serde(default)]
    pub enable_consensus_with_half_votes: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_name: String::new(),
            hostname: String::new(),
            wd_port: 9000,
            priority: 1,
            auth_key: String::new(),
            ipc_socket_path: String::new(),
            escalation_command: String::new(),
            de_escalation_command: String::new(),
            peers: Vec::new(),
            failover_when_quorum_exists: true,
            failover_require_consensus: true,
            allow_multiple_failover_requests_from_node: false,
            enable_consensus_with_half_votes: false,
        }
    }
}

/// One remote watchdog peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogPeerConfig {
    pub hostname: String,
    pub wd_port: u16,
    /// The peer proxy's client-facing port, part of its identity
    pub proxy_port: u16,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Health check interval in seconds; zero disables the workers
    pub interval_sec: u64,
    /// Health check timeout in seconds
    pub timeout_sec: u64,
    /// Number of consecutive failures before requesting failover
    pub failure_threshold: u32,
    /// Number of consecutive successes before logging recovery
    pub success_threshold: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:9999".to_string(),
                max_children: 32,
                reserved_connections: 0,
                authentication_timeout_sec: 60,
                backend_connect_timeout_ms: 5000,
                status_file: String::new(),
            },
            backend: vec![BackendConfig {
                host: "127.0.0.1".to_string(),
                port: 5432,
                weight: 1.0,
                role: "primary".to_string(),
            }],
            pool: PoolConfig {
                max_pool: 4,
                connection_life_time_sec: 0,
                replication_mode: false,
            },
            balancer: BalancerConfig::default(),
            auth: AuthConfig::default(),
            watchdog: WatchdogConfig::default(),
            health: HealthConfig {
                interval_sec: 10,
                timeout_sec: 5,
                failure_threshold: 3,
                success_threshold: 2,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_children == 0 {
            return Err(ConfigError::ValidationError(
                "max_children must be greater than 0".to_string(),
            ));
        }
        if self.server.reserved_connections >= self.server.max_children {
            return Err(ConfigError::ValidationError(
                "reserved_connections must be less than max_children".to_string(),
            ));
        }
        if self.server.authentication_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "authentication_timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.backend.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one backend node is required".to_string(),
            ));
        }
        for backend in &self.backend {
            if backend.host.is_empty() {
                return Err(ConfigError::ValidationError(
                    "backend host cannot be empty".to_string(),
                ));
            }
            if backend.weight < 0.0 {
                return Err(ConfigError::ValidationError(
                    "backend weight cannot be negative".to_string(),
                ));
            }
            match backend.role.as_str() {
                "primary" | "standby" | "unknown" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "invalid backend role: {}",
                        other
                    )))
                }
            }
        }

        if self.pool.max_pool == 0 {
            return Err(ConfigError::ValidationError(
                "max_pool must be greater than 0".to_string(),
            ));
        }

        match self.auth.method.as_str() {
            "trust" | "md5" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "invalid auth method: {}",
                    other
                )))
            }
        }

        if self.watchdog.enabled {
            if self.watchdog.hostname.is_empty() {
                return Err(ConfigError::ValidationError(
                    "watchdog.hostname is required when the watchdog is enabled".to_string(),
                ));
            }
            for peer in &self.watchdog.peers {
                if peer.hostname.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "watchdog peer hostname cannot be empty".to_string(),
                    ));
                }
            }
        }

        if self.health.interval_sec > 0 && self.health.timeout_sec >= self.health.interval_sec {
            return Err(ConfigError::ValidationError(
                "health check timeout_sec must be less than interval_sec".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "health failure_threshold must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    pub fn status_file_path(&self) -> Option<PathBuf> {
        if self.server.status_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.server.status_file))
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "single" => Config::default(),
            "cluster" => Config {
                backend: vec![
                    BackendConfig {
                        host: "10.0.1.10".to_string(),
                        port: 5432,
                        weight: 1.0,
                        role: "primary".to_string(),
                    },
                    BackendConfig {
                        host: "10.0.1.11".to_string(),
                        port: 5432,
                        weight: 1.0,
                        role: "standby".to_string(),
                    },
                    BackendConfig {
                        host: "10.0.1.12".to_string(),
                        port: 5432,
                        weight: 2.0,
                        role: "standby".to_string(),
                    },
                ],
                watchdog: WatchdogConfig {
                    enabled: true,
                    node_name: "portero-1".to_string(),
                    hostname: "10.0.2.10".to_string(),
                    wd_port: 9000,
                    priority: 50,
                    auth_key: "change-me".to_string(),
                    ipc_socket_path: "/tmp/portero-watchdog.sock".to_string(),
                    peers: vec![
                        WatchdogPeerConfig {
                            hostname: "10.0.2.11".to_string(),
                            wd_port: 9000,
                            proxy_port: 9999,
                        },
                        WatchdogPeerConfig {
                            hostname: "10.0.2.12".to_string(),
                            wd_port: 9000,
                            proxy_port: 9999,
                        },
                    ],
                    ..Default::default()
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'single' or 'cluster'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.server.max_children = 0;
        assert!(config.validate().is_err());

        config.server.max_children = 32;
        assert!(config.validate().is_ok());

        config.backend.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reserved_connections_must_fit_under_the_limit() {
        let mut config = Config::default();
        config.server.reserved_connections = config.server.max_children;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_backend_role_is_rejected() {
        let mut config = Config::default();
        config.backend[0].role = "leader".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watchdog_requires_hostname_when_enabled() {
        let mut config = Config::default();
        config.watchdog.enabled = true;
        assert!(config.validate().is_err());

        config.watchdog.hostname = "10.0.0.1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());
    }

    #[test]
    fn test_example_cluster_config_round_trips() {
        let temp_file = NamedTempFile::new().unwrap();
        Config::create_example_config(temp_file.path(), "cluster").unwrap();

        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded.watchdog.enabled);
        assert_eq!(loaded.backend.len(), 3);
        assert_eq!(loaded.watchdog.peers.len(), 2);

        assert!(Config::create_example_config(temp_file.path(), "bogus").is_err());
    }
}
