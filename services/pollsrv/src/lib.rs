//! Device polling and health management for the field gateway
//!
//! Two independent loops read holding registers from field devices: one
//! drives the multi-drop serial lines, the other reaches devices behind
//! network gateways through a small LRU connection pool. Every read feeds a
//! per-device health record; devices that keep failing are disabled and
//! later re-enabled by the auto-recovery scheduler. Local control can pause
//! both loops through the priority flag.
//!
//! ```text
//!  DeviceStore ──► SerialPoller ──► SerialBus
//!       │                │
//!       └──────► NetworkPoller ──► ConnectionPool ──► NetworkBus
//!                        │
//!                HealthRegistry ◄── AutoRecoveryScheduler
//!                        │
//!                    ValueSink
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod runtime;
pub mod sink;
pub mod transport;

pub use config::{AppConfig, ChangeFlags, DeviceConfig, DeviceStore, EngineConfig, MemoryDeviceStore};
pub use crate::core::{DeviceHealthState, DeviceStatus, DisableReason, PriorityFlag, PriorityGuard};
pub use error::{PollError, Result};
pub use runtime::{DeviceStatusReport, EngineHandles, EngineParts, PollingEngine};
pub use sink::{ChannelSink, RegisterBatch, RegisterValue, ValueSink};
