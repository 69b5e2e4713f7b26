//! Error handling for the polling service
//!
//! Two layers: [`TransportError`] is what a bus read produces and what the
//! health state machine classifies; [`PollError`] is what the engine's
//! public operations return.

use errors::{ErrorCategory, GatewayError, GatewayErrorTrait};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure class used by the health state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No response within the device timeout
    Timeout,
    /// Link or framing problem (I/O error, refused connection, bad CRC)
    Transport,
    /// The device answered with a Modbus exception
    Exception,
    /// Local resource limit (pool exhausted, unknown serial line)
    Resource,
}

/// Errors produced by a single bus transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Read timed out after {0} ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Device exception: code 0x{code:02X}")]
    Exception { code: u8 },

    #[error("Malformed frame: {0}")]
    Codec(String),

    #[error("Connection pool exhausted: {capacity} connections in use")]
    PoolExhausted { capacity: usize },

    #[error("Serial line not configured: port {0}")]
    UnknownLine(u8),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Io(_) | TransportError::ConnectionFailed(_) | TransportError::Codec(_) => {
                FailureKind::Transport
            },
            TransportError::Exception { .. } => FailureKind::Exception,
            TransportError::PoolExhausted { .. } | TransportError::UnknownLine(_) => {
                FailureKind::Resource
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    /// The underlying link can no longer be trusted and must be reopened
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Io(_)
                | TransportError::ConnectionFailed(_)
                | TransportError::Codec(_)
        )
    }

    /// Worth another attempt inside the same poll
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Transport
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(0),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => TransportError::ConnectionFailed(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

impl From<tokio_serial::Error> for TransportError {
    fn from(err: tokio_serial::Error) -> Self {
        TransportError::Io(format!("serial: {}", err))
    }
}

/// Errors returned by the engine's control surface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid device {device_id}: {reason}")]
    InvalidDevice { device_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Worker startup failed: {0}")]
    Startup(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PollError {
    pub fn invalid_device(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        PollError::InvalidDevice {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }
}

impl GatewayErrorTrait for PollError {
    fn error_code(&self) -> &'static str {
        match self {
            PollError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            PollError::InvalidDevice { .. } => "INVALID_DEVICE",
            PollError::Config(_) => "CONFIGURATION_ERROR",
            PollError::Transport(TransportError::Timeout(_)) => "TIMEOUT",
            PollError::Transport(TransportError::Exception { .. }) => "DEVICE_EXCEPTION",
            PollError::Transport(TransportError::PoolExhausted { .. }) => "POOL_EXHAUSTED",
            PollError::Transport(TransportError::UnknownLine(_)) => "UNKNOWN_LINE",
            PollError::Transport(_) => "LINK_ERROR",
            PollError::Startup(_) => "STARTUP_FAILED",
            PollError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            PollError::DeviceNotFound(_) => ErrorCategory::NotFound,
            PollError::InvalidDevice { .. } | PollError::Config(_) => ErrorCategory::Configuration,
            PollError::Transport(err) => match err.kind() {
                FailureKind::Timeout => ErrorCategory::Timeout,
                FailureKind::Transport => ErrorCategory::Link,
                FailureKind::Exception => ErrorCategory::Device,
                FailureKind::Resource => ErrorCategory::ResourceExhausted,
            },
            PollError::Startup(_) | PollError::Internal(_) => ErrorCategory::Internal,
        }
    }
}

/// Result type alias for the polling service
pub type Result<T> = std::result::Result<T, PollError>;

impl From<PollError> for GatewayError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::DeviceNotFound(id) => GatewayError::DeviceNotFound(id),
            PollError::InvalidDevice { device_id, reason } => GatewayError::InvalidConfig {
                field: format!("devices.{}", device_id),
                reason,
            },
            PollError::Config(msg) => GatewayError::Configuration(msg),
            PollError::Transport(TransportError::Timeout(ms)) => {
                GatewayError::Timeout(format!("{} ms", ms))
            },
            PollError::Transport(TransportError::Exception { code }) => GatewayError::Protocol {
                protocol: "modbus".to_string(),
                message: format!("exception 0x{:02X}", code),
            },
            PollError::Transport(TransportError::PoolExhausted { capacity }) => {
                GatewayError::ResourceExhausted(format!("{} pooled connections", capacity))
            },
            PollError::Transport(other) => GatewayError::Communication(other.to_string()),
            PollError::Startup(msg) => GatewayError::StartupFailed(msg),
            PollError::Internal(msg) => GatewayError::Internal(msg),
        }
    }
}
