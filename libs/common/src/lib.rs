//! Field gateway basic library
//!
//! Provides bootstrap functions shared by all services, including:
//! - logging initialisation
//! - configuration loading with environment overrides
//! - graceful shutdown signalling

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::load_config;
pub use logging::{init_logging, LogConfig, LogGuard};
pub use shutdown::{shutdown_token, wait_for_shutdown};

// Re-export common dependencies
pub use errors::{GatewayError, GatewayResult};
pub use tokio;
