/// Health checking for backend PostgreSQL nodes
///
/// One worker per configured node probes it on an interval. A probe
/// opens a TCP connection, sends a startup packet, waits for any
/// server response, and terminates. Sustained failure publishes a
/// Down request to the failover channel; the consensus machinery
/// decides what happens from there.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::protocol::message;
use crate::protocol::stream::PacketStream;
use crate::registry::{BackendDescriptor, ClusterRegistry, NodeOpKind, NodeOpRequest};

/// Health status of a backend
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy backend
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform health check on a backend
    async fn check_health(&self, backend: &BackendDescriptor) -> HealthStatus;

    /// Get the check interval for this health checker
    fn check_interval(&self) -> Duration;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// PostgreSQL startup-exchange health checker
pub struct PgHealthChecker {
    interval: Duration,
    probe_timeout: Duration,
}

impl PgHealthChecker {
    pub fn new(interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            interval,
            probe_timeout,
        }
    }

    async fn probe(&self, backend: &BackendDescriptor) -> HealthStatus {
        let stream = match TcpStream::connect(backend.addr()).await {
            Ok(stream) => stream,
            Err(e) => {
                return HealthStatus::Unhealthy {
                    reason: format!("connect failed: {}", e),
                }
            }
        };
        let mut stream = PacketStream::new(stream);

        // A minimal V3 startup; any authentication answer proves the
        // postmaster is alive
        let mut body = BytesMut::new();
        body.put_i32(196608);
        body.put_slice(b"user\0portero_health\0\0");
        let mut framed = BytesMut::with_capacity(body.len() + 4);
        framed.put_i32(body.len() as i32 + 4);
        framed.put_slice(&body);

        if let Err(e) = stream.write_and_flush(&framed).await {
            return HealthStatus::Unhealthy {
                reason: format!("startup write failed: {}", e),
            };
        }
        match stream.read_u8().await {
            Ok(_) => {
                let _ = stream
                    .write_and_flush(&message::terminate().encode())
                    .await;
                HealthStatus::Healthy
            }
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("no response to startup: {}", e),
            },
        }
    }
}

#[async_trait]
impl HealthChecker for PgHealthChecker {
    async fn check_health(&self, backend: &BackendDescriptor) -> HealthStatus {
        self.probe(backend).await
    }

    fn check_interval(&self) -> Duration {
        self.interval
    }

    fn check_timeout(&self) -> Duration {
        self.probe_timeout
    }
}

/// Failure accounting thresholds
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

/// Generic health check manager for one backend node
pub struct HealthCheckManager {
    checker: Box<dyn HealthChecker>,
    thresholds: HealthThresholds,
}

impl HealthCheckManager {
    pub fn new(checker: Box<dyn HealthChecker>, thresholds: HealthThresholds) -> Self {
        Self {
            checker,
            thresholds,
        }
    }

    /// Perform one health check with timeout
    pub async fn check_backend_health(&self, backend: &BackendDescriptor) -> HealthStatus {
        match timeout(
            self.checker.check_timeout(),
            self.checker.check_health(backend),
        )
        .await
        {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        }
    }

    /// Run continuous health checking for one node. Consecutive
    /// failures past the threshold publish a Down request; recovery
    /// of a downed node is logged for the operator, not auto-applied.
    pub async fn run_health_checks(&self, registry: Arc<ClusterRegistry>, node_id: usize) {
        let mut interval = tokio::time::interval(self.checker.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;
        let mut consecutive_successes = 0u32;
        let mut reported_down = false;

        loop {
            interval.tick().await;

            let Some(descriptor) = registry.snapshot().into_iter().find(|d| d.id == node_id)
            else {
                return;
            };

            let status = self.check_backend_health(&descriptor).await;
            match &status {
                HealthStatus::Healthy => {
                    consecutive_failures = 0;
                    consecutive_successes += 1;
                    debug!(node_id, "backend is healthy");
                    if !descriptor.status.is_alive()
                        && consecutive_successes >= self.thresholds.success_threshold
                    {
                        // Reattachment needs operator intent; a node
                        // that failed over may hold stale data
                        info!(
                            node_id,
                            "downed backend answers again; attach it back explicitly when ready"
                        );
                        consecutive_successes = 0;
                        reported_down = false;
                    }
                }
                _ => {
                    consecutive_successes = 0;
                    consecutive_failures += 1;
                    warn!(node_id, status = %status, failures = consecutive_failures, "backend health check failed");
                    if consecutive_failures >= self.thresholds.failure_threshold
                        && descriptor.status.is_alive()
                        && !reported_down
                    {
                        warn!(node_id, "failure threshold reached, requesting failover");
                        registry
                            .submit_request(NodeOpRequest::new(NodeOpKind::Down, vec![node_id]));
                        reported_down = true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_descriptors;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Mock health checker for testing
    struct MockHealthChecker {
        should_pass: bool,
        calls: AtomicU32,
    }

    impl MockHealthChecker {
        fn new(should_pass: bool) -> Self {
            Self {
                should_pass,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthChecker for MockHealthChecker {
        async fn check_health(&self, _backend: &BackendDescriptor) -> HealthStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.should_pass {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy {
                    reason: "Mock failure".to_string(),
                }
            }
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn check_interval(&self) -> Duration {
            Duration::from_secs(5)
        }
    }

    struct HangingChecker;

    #[async_trait]
    impl HealthChecker for HangingChecker {
        async fn check_health(&self, _backend: &BackendDescriptor) -> HealthStatus {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            HealthStatus::Healthy
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        fn check_interval(&self) -> Duration {
            Duration::from_secs(5)
        }
    }

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            failure_threshold: 3,
            success_threshold: 2,
        }
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy {
                reason: "test".to_string()
            }
            .to_string(),
            "Unhealthy: test"
        );
        assert_eq!(HealthStatus::Timeout.to_string(), "Timeout");
    }

    #[test]
    fn test_health_status_is_healthy() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Unhealthy {
            reason: "test".to_string()
        }
        .is_healthy());
        assert!(!HealthStatus::Timeout.is_healthy());
    }

    #[tokio::test]
    async fn test_health_check_success() {
        let manager =
            HealthCheckManager::new(Box::new(MockHealthChecker::new(true)), thresholds());
        let backend = &test_descriptors(1)[0];

        let status = manager.check_backend_health(backend).await;
        assert!(status.is_healthy());
    }

    #[tokio::test]
    async fn test_health_check_failure() {
        let manager =
            HealthCheckManager::new(Box::new(MockHealthChecker::new(false)), thresholds());
        let backend = &test_descriptors(1)[0];

        let status = manager.check_backend_health(backend).await;
        assert!(!status.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out() {
        let manager = HealthCheckManager::new(Box::new(HangingChecker), thresholds());
        let backend = &test_descriptors(1)[0];

        let status = manager.check_backend_health(backend).await;
        assert_eq!(status, HealthStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_failure_requests_failover_once() {
        let registry = Arc::new(ClusterRegistry::new(test_descriptors(2), None));
        let manager =
            HealthCheckManager::new(Box::new(MockHealthChecker::new(false)), thresholds());

        let worker = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                manager.run_health_checks(registry, 1).await;
            })
        };

        // Three intervals of failure reach the threshold
        tokio::time::sleep(Duration::from_secs(16)).await;
        let requests = registry.take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, NodeOpKind::Down);
        assert_eq!(requests[0].nodes, vec![1]);

        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_backend_stays_quiet() {
        let registry = Arc::new(ClusterRegistry::new(test_descriptors(1), None));
        let manager =
            HealthCheckManager::new(Box::new(MockHealthChecker::new(true)), thresholds());

        let worker = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                manager.run_health_checks(registry, 0).await;
            })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.take_requests().is_empty());
        worker.abort();
    }

    #[tokio::test]
    async fn test_pg_checker_reports_refused_connection() {
        let checker = PgHealthChecker::new(Duration::from_secs(10), Duration::from_secs(1));
        let mut backend = test_descriptors(1).remove(0);
        backend.port = 1;

        let status = checker.check_health(&backend).await;
        assert!(matches!(status, HealthStatus::Unhealthy { .. }));
    }
}
