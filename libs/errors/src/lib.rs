//! Shared error types for the field gateway services
//!
//! Each service keeps its own domain error enum and converts into
//! [`GatewayError`] at the process boundary (startup, shutdown, exit codes).
//! [`GatewayErrorTrait`] gives both layers the same classification, so a
//! failure is logged at the same level whichever type carries it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification used for log routing and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    /// Serial line or network gateway unreachable
    Link,
    Timeout,
    /// The field device answered, but with an error
    Device,
    NotFound,
    ResourceExhausted,
    Internal,
    Unknown,
}

impl ErrorCategory {
    /// Transient categories; the same request may succeed later
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCategory::Link | ErrorCategory::Timeout | ErrorCategory::ResourceExhausted
        )
    }
}

/// Classification shared by every service error type
pub trait GatewayErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Stable code for logs and the local-control channel
    fn error_code(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;

    fn is_retryable(&self) -> bool {
        self.category().is_transient()
    }

    /// Level a failure of this kind is reported at
    fn log_level(&self) -> tracing::Level {
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Unknown => tracing::Level::ERROR,
            ErrorCategory::Configuration
            | ErrorCategory::ResourceExhausted
            | ErrorCategory::Device => tracing::Level::WARN,
            ErrorCategory::NotFound => tracing::Level::INFO,
            ErrorCategory::Link | ErrorCategory::Timeout => tracing::Level::DEBUG,
        }
    }
}

/// Process-level error for the gateway services
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Device error ({protocol}): {message}")]
    Protocol { protocol: String, message: String },

    #[error("Field bus error: {0}")]
    Communication(String),

    #[error("No response within {0}")]
    Timeout(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Startup failed: {0}")]
    StartupFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<figment::Error> for GatewayError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON encoding: {}", err))
    }
}

impl GatewayErrorTrait for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Protocol { .. } => "DEVICE_EXCEPTION",
            Self::Communication(_) => "LINK_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::Protocol { .. } => ErrorCategory::Device,
            Self::Communication(_) => ErrorCategory::Link,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::DeviceNotFound(_) => ErrorCategory::NotFound,
            Self::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
            Self::StartupFailed(_) | Self::Internal(_) | Self::Io(_) => ErrorCategory::Internal,
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}
