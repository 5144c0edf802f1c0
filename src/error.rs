/// Unified error handling for the portero proxy
///
/// One crate-level error enum with per-area sub-errors, plus the
/// session outcome taxonomy that drives the per-session recovery
/// boundary.
use std::fmt;
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;

/// Main error type for portero operations
#[derive(Debug, Error)]
pub enum PorteroError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Backend connection errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Watchdog cluster errors
    #[error("Watchdog error: {message}")]
    Watchdog { message: String },

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for portero operations
pub type PorteroResult<T> = Result<T, PorteroError>;

impl PorteroError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        PorteroError::Backend {
            message: message.into(),
        }
    }

    pub fn watchdog<S: Into<String>>(message: S) -> Self {
        PorteroError::Watchdog {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        PorteroError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        PorteroError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            PorteroError::Network(_) => true,
            PorteroError::Backend { .. } => true,
            PorteroError::Timeout { .. } => true,
            PorteroError::Protocol(e) => e.is_closed(),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PorteroError::Config(_) => ErrorSeverity::Critical,
            PorteroError::Internal { .. } => ErrorSeverity::Critical,
            PorteroError::Network(_) => ErrorSeverity::Warning,
            PorteroError::Backend { .. } => ErrorSeverity::Warning,
            PorteroError::Timeout { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

/// How one session loop iteration ended. Every iteration is an
/// independent recovery boundary; the outcome decides whether the
/// backend entry goes back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Keep looping
    Continue,
    /// Session handed back to the pool
    Idle,
    /// Clean session termination
    End,
    /// Recoverable; close the session, backend may still be cached
    Error,
    /// The serving task must not be reused
    Fatal,
    /// A backend reported a deadlock; force failover of that node
    Deadlock,
}

impl SessionOutcome {
    /// Whether the backend entry is eligible for pool caching
    pub fn allows_caching(&self) -> bool {
        matches!(self, SessionOutcome::Idle | SessionOutcome::End)
    }
}
