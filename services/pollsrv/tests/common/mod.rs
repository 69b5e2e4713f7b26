//! Shared fixtures for the pollsrv integration tests

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

use pollsrv::config::{ChangeFlags, DeviceConfig, EngineConfig, Endpoint, MemoryDeviceStore};
use pollsrv::runtime::{EngineParts, PollingEngine};
use pollsrv::sink::{ChannelSink, RegisterBatch};
use pollsrv::transport::{SimulatedNetworkBus, SimulatedSerialBus};

/// Simulated field wired to an engine
pub struct Field {
    pub store: Arc<MemoryDeviceStore>,
    pub serial: Arc<SimulatedSerialBus>,
    pub network: Arc<SimulatedNetworkBus>,
    pub engine: PollingEngine<SimulatedNetworkBus>,
    pub values: mpsc::Receiver<RegisterBatch>,
}

pub fn field(devices: Vec<DeviceConfig>) -> Field {
    field_with(devices, test_engine_config())
}

pub fn field_with(devices: Vec<DeviceConfig>, config: EngineConfig) -> Field {
    let flags = ChangeFlags::new();
    let serial = Arc::new(SimulatedSerialBus::seeded(&devices));
    let network = Arc::new(SimulatedNetworkBus::seeded(&devices));
    let store = Arc::new(MemoryDeviceStore::with_devices(devices, flags.clone()));
    let (sink, values) = ChannelSink::channel(256);

    let engine = PollingEngine::new(EngineParts {
        store: store.clone(),
        flags,
        serial_bus: serial.clone(),
        network_bus: network.clone(),
        sink: Arc::new(sink),
        config,
    });
    Field {
        store,
        serial,
        network,
        engine,
        values,
    }
}

pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        tick_ms: 10,
        priority_backoff_ms: 50,
        baud_settle_ms: 5,
        pin_cores: false,
        ..EngineConfig::default()
    }
}

pub fn meter(id: &str, slave_id: u8) -> DeviceConfig {
    DeviceConfig::serial(id, 1, slave_id, 9600)
        .with_register("voltage", 0, 2)
        .with_timing(200, 1000)
}

pub fn inverter(id: &str, gateway: u8) -> DeviceConfig {
    DeviceConfig::network(id, gateway_host(gateway), 502, 1)
        .with_register("power", 100, 1)
        .with_timing(200, 1000)
}

pub fn gateway_host(gateway: u8) -> String {
    format!("192.168.10.{}", gateway)
}

pub fn gateway(n: u8) -> Endpoint {
    Endpoint::new(gateway_host(n), 502)
}
