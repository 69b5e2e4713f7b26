//! Polling engine core
//!
//! Health tracking, the two bus polling loops, the network connection pool,
//! auto-recovery and the local-control priority flag.

pub mod health;
pub mod network_poller;
pub mod polling;
pub mod pool;
pub mod priority;
pub mod recovery;
pub mod registry;
pub mod serial_poller;

pub use health::{DeviceHealthState, DisableReason, HealthMetrics};
pub use network_poller::{NetworkDomain, NetworkPoller};
pub use polling::{PassSummary, PollContext, PollDomain, PollLoop, PollOutcome, PollSettings};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use priority::{PriorityFlag, PriorityGuard};
pub use recovery::AutoRecoveryScheduler;
pub use registry::{DeviceStatus, HealthEntry, HealthRegistry};
pub use serial_poller::{SerialDomain, SerialPoller};
