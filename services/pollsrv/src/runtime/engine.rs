//! Polling engine façade
//!
//! Owns the shared state (health registry, priority flag, connection pool),
//! builds the polling loops and the recovery scheduler, and exposes the
//! local-control and dashboard operations.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::lifecycle::{spawn_worker, CorePlan, EngineHandles};
use crate::config::{ChangeFlags, DeviceConfig, DeviceStore, EngineConfig, Protocol};
use crate::core::{
    AutoRecoveryScheduler, ConnectionPool, DeviceHealthState, DeviceStatus, HealthRegistry,
    NetworkPoller, PollContext, PollSettings, PoolConfig, PoolStats, PriorityFlag, SerialPoller,
};
use crate::error::{PollError, Result};
use crate::sink::ValueSink;
use crate::transport::{NetworkBus, SerialBus};

/// Collaborators injected into the engine
pub struct EngineParts<B: NetworkBus> {
    pub store: Arc<dyn DeviceStore>,
    pub flags: ChangeFlags,
    pub serial_bus: Arc<dyn SerialBus>,
    pub network_bus: Arc<B>,
    pub sink: Arc<dyn ValueSink>,
    pub config: EngineConfig,
}

/// Every configured device's health, split by bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusReport {
    pub serial: Vec<DeviceStatus>,
    pub network: Vec<DeviceStatus>,
}

impl DeviceStatusReport {
    pub fn all(&self) -> impl Iterator<Item = &DeviceStatus> {
        self.serial.iter().chain(self.network.iter())
    }

    pub fn disabled(&self) -> usize {
        self.all().filter(|status| !status.health.is_enabled()).count()
    }
}

pub struct PollingEngine<B: NetworkBus> {
    store: Arc<dyn DeviceStore>,
    flags: ChangeFlags,
    serial_bus: Arc<dyn SerialBus>,
    pool: Arc<ConnectionPool<B>>,
    sink: Arc<dyn ValueSink>,
    registry: Arc<HealthRegistry>,
    priority: Arc<PriorityFlag>,
    config: EngineConfig,
}

impl<B: NetworkBus> PollingEngine<B> {
    pub fn new(parts: EngineParts<B>) -> Self {
        let pool = ConnectionPool::new(
            parts.network_bus,
            PoolConfig {
                capacity: parts.config.pool_capacity,
                connect_timeout: parts.config.connect_timeout(),
            },
        );
        Self {
            store: parts.store,
            flags: parts.flags,
            serial_bus: parts.serial_bus,
            pool: Arc::new(pool),
            sink: parts.sink,
            registry: Arc::new(HealthRegistry::new()),
            priority: Arc::new(PriorityFlag::new()),
            config: parts.config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    /// Local-control priority handle; hold a guard while writing to devices
    pub fn priority(&self) -> &Arc<PriorityFlag> {
        &self.priority
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn configured(&self, device_id: &str) -> Result<DeviceConfig> {
        self.store
            .get_device(device_id)
            .ok_or_else(|| PollError::DeviceNotFound(device_id.to_string()))
    }

    pub fn get_device_status(&self, device_id: &str) -> Result<DeviceStatus> {
        let device = self.configured(device_id)?;
        let entry = self.registry.ensure(&device);
        Ok(DeviceStatus::new(device_id, entry.protocol(), entry.snapshot()))
    }

    /// Re-enable a device regardless of why it was disabled
    pub fn enable_device(&self, device_id: &str, clear_metrics: bool) -> Result<DeviceStatus> {
        let device = self.configured(device_id)?;
        let entry = self.registry.ensure(&device);
        let health = {
            let mut state = entry.lock();
            state.enable(clear_metrics);
            state.clone()
        };
        info!(device_id, clear_metrics, "Device enabled by operator");
        Ok(DeviceStatus::new(device_id, entry.protocol(), health))
    }

    /// Disable a device until an operator enables it again
    pub fn disable_device(&self, device_id: &str, detail: &str) -> Result<DeviceStatus> {
        let device = self.configured(device_id)?;
        let entry = self.registry.ensure(&device);
        let health = {
            let mut state = entry.lock();
            state.disable_manual(detail, Utc::now());
            state.clone()
        };
        info!(device_id, detail, "Device disabled by operator");
        Ok(DeviceStatus::new(device_id, entry.protocol(), health))
    }

    pub fn reset_metrics(&self, device_id: &str) -> Result<DeviceStatus> {
        let device = self.configured(device_id)?;
        let entry = self.registry.ensure(&device);
        let health = {
            let mut state = entry.lock();
            state.reset_metrics();
            state.clone()
        };
        info!(device_id, "Device metrics reset");
        Ok(DeviceStatus::new(device_id, entry.protocol(), health))
    }

    /// Health of every configured device; devices not yet polled report a
    /// fresh record.
    pub fn get_all_device_status(&self) -> DeviceStatusReport {
        let mut report = DeviceStatusReport::default();
        for device in self.store.list_devices() {
            let protocol = device.protocol();
            let status = self.registry.status(&device.id).unwrap_or_else(|| {
                DeviceStatus::new(
                    &device.id,
                    protocol,
                    DeviceHealthState::new(device.retry_count, device.max_consecutive_timeouts),
                )
            });
            match protocol {
                Protocol::Serial => report.serial.push(status),
                Protocol::Network => report.network.push(status),
            }
        }
        report.serial.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        report.network.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        report
    }

    fn context(&self, protocol: Protocol) -> PollContext {
        PollContext {
            store: self.store.clone(),
            changes: self.flags.for_protocol(protocol).clone(),
            registry: self.registry.clone(),
            priority: self.priority.clone(),
            sink: self.sink.clone(),
            settings: PollSettings::from(&self.config),
        }
    }

    pub fn serial_poller(&self) -> SerialPoller {
        SerialPoller::new(self.context(Protocol::Serial), self.serial_bus.clone())
    }

    pub fn network_poller(&self) -> NetworkPoller<B> {
        NetworkPoller::new(self.context(Protocol::Network), self.pool.clone())
    }

    pub fn recovery_scheduler(&self) -> AutoRecoveryScheduler {
        AutoRecoveryScheduler::new(
            self.registry.clone(),
            self.config.recovery_interval(),
            self.config.recovery_cooldown(),
        )
    }

    /// Start both polling loops and the recovery scheduler.
    ///
    /// Must be called from within a tokio runtime; the scheduler runs there
    /// while each loop gets a dedicated thread.
    pub fn spawn(&self, cancel: CancellationToken) -> Result<EngineHandles> {
        let cores = CorePlan::detect(self.config.pin_cores);

        let serial = spawn_worker(
            "serial-poll",
            cores.serial,
            self.serial_poller().run(cancel.clone()),
        )?;
        let network = match spawn_worker(
            "network-poll",
            cores.network,
            self.network_poller().run(cancel.clone()),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            },
        };
        let recovery = tokio::spawn(self.recovery_scheduler().run(cancel));

        info!(
            pool_capacity = self.pool.capacity(),
            "Polling engine started"
        );
        Ok(EngineHandles {
            serial,
            network,
            recovery,
        })
    }

    /// Close idle pooled connections; used on shutdown
    pub fn close_connections(&self) -> usize {
        self.pool.close_idle()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::MemoryDeviceStore;
    use crate::core::DisableReason;
    use crate::sink::ChannelSink;
    use crate::transport::{SimulatedNetworkBus, SimulatedSerialBus};

    fn engine(devices: Vec<DeviceConfig>) -> PollingEngine<SimulatedNetworkBus> {
        let flags = ChangeFlags::new();
        let (sink, _rx) = ChannelSink::channel(16);
        PollingEngine::new(EngineParts {
            store: Arc::new(MemoryDeviceStore::with_devices(devices, flags.clone())),
            flags,
            serial_bus: Arc::new(SimulatedSerialBus::new()),
            network_bus: Arc::new(SimulatedNetworkBus::new()),
            sink: Arc::new(sink),
            config: EngineConfig::default(),
        })
    }

    fn meter() -> DeviceConfig {
        DeviceConfig::serial("meter", 1, 1, 9600).with_register("v", 0, 1)
    }

    fn inverter() -> DeviceConfig {
        DeviceConfig::network("inverter", "10.0.0.5", 502, 1).with_register("p", 0, 1)
    }

    #[test]
    fn test_unknown_device_is_reported() {
        let engine = engine(vec![meter()]);
        assert_eq!(
            engine.get_device_status("ghost"),
            Err(PollError::DeviceNotFound("ghost".into()))
        );
        assert!(engine.enable_device("ghost", false).is_err());
        assert!(engine.disable_device("ghost", "x").is_err());
    }

    #[test]
    fn test_manual_disable_then_enable() {
        let engine = engine(vec![meter()]);

        let status = engine.disable_device("meter", "maintenance").unwrap();
        assert!(!status.health.is_enabled());
        assert_eq!(status.health.disable_reason(), DisableReason::Manual);
        assert_eq!(status.health.disable_detail(), "maintenance");

        let status = engine.enable_device("meter", true).unwrap();
        assert!(status.health.is_enabled());
        assert_eq!(status.health.disable_reason(), DisableReason::None);
        assert!(status.health.disabled_at().is_none());
    }

    #[test]
    fn test_report_splits_by_bus() {
        let engine = engine(vec![meter(), inverter()]);
        engine.disable_device("inverter", "swap").unwrap();

        let report = engine.get_all_device_status();
        assert_eq!(report.serial.len(), 1);
        assert_eq!(report.network.len(), 1);
        assert_eq!(report.serial[0].device_id, "meter");
        assert!(report.serial[0].health.is_enabled());
        assert_eq!(report.disabled(), 1);
    }

    #[test]
    fn test_report_encodes_for_dashboard() {
        let engine = engine(vec![meter(), inverter()]);
        engine.disable_device("meter", "calibration").unwrap();

        let json = serde_json::to_value(engine.get_all_device_status()).unwrap();
        let meter = &json["serial"][0];
        assert_eq!(meter["device_id"], "meter");
        assert_eq!(meter["protocol"], "serial");
        assert_eq!(meter["health"]["disable_reason"], "manual");
        assert_eq!(meter["health"]["is_enabled"], false);
        assert_eq!(json["network"][0]["success_rate"], 0.0);
    }

    #[test]
    fn test_pool_uses_configured_capacity() {
        let flags = ChangeFlags::new();
        let (sink, _rx) = ChannelSink::channel(1);
        let engine = PollingEngine::new(EngineParts {
            store: Arc::new(MemoryDeviceStore::new(flags.clone())),
            flags,
            serial_bus: Arc::new(SimulatedSerialBus::new()),
            network_bus: Arc::new(SimulatedNetworkBus::new()),
            sink: Arc::new(sink),
            config: EngineConfig {
                pool_capacity: 2,
                ..EngineConfig::default()
            },
        });
        assert_eq!(engine.pool_stats().capacity, 2);
        assert_eq!(engine.pool_stats().open, 0);
    }
}
