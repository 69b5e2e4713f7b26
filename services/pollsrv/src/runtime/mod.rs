//! Engine assembly and worker orchestration

pub mod engine;
pub mod lifecycle;

pub use engine::{DeviceStatusReport, EngineParts, PollingEngine};
pub use lifecycle::{spawn_worker, CorePlan, EngineHandles};
