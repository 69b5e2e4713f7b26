//! Configuration model and device store

pub mod store;
pub mod types;

pub use store::{ChangeFlags, ConfigChangeFlag, DeviceStore, MemoryDeviceStore};
pub use types::{
    AppConfig, DeviceAddress, DeviceConfig, Endpoint, EngineConfig, NetworkAddress, Protocol,
    RegisterConfig, SerialAddress, SerialLineConfig, ServiceConfig, MAX_REGISTERS_PER_READ,
};
