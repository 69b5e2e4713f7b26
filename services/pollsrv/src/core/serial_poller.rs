//! Serial bus polling
//!
//! Devices on one physical line may run at different baud rates. The line is
//! switched only when the next device differs from the last applied rate,
//! followed by a short settle delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::polling::{
    read_device, record_failure, with_timeout, PollContext, PollDomain, PollLoop, PollOutcome,
    RegisterReader,
};
use super::registry::HealthEntry;
use crate::config::{DeviceAddress, DeviceConfig, Protocol, SerialAddress};
use crate::error::TransportError;
use crate::transport::SerialBus;

struct SerialReader<'a> {
    bus: &'a dyn SerialBus,
    address: &'a SerialAddress,
}

#[async_trait]
impl<'a> RegisterReader for SerialReader<'a> {
    async fn read(&mut self, start: u16, count: u16, timeout: Duration) -> Result<Vec<u16>, TransportError> {
        with_timeout(timeout, self.bus.read_registers(self.address, start, count)).await
    }
}

/// Serial half of the polling engine
pub struct SerialDomain {
    bus: Arc<dyn SerialBus>,
    /// Last rate successfully applied per line
    line_baud: HashMap<u8, u32>,
    settle: Duration,
}

impl SerialDomain {
    pub fn new(bus: Arc<dyn SerialBus>, settle: Duration) -> Self {
        Self {
            bus,
            line_baud: HashMap::new(),
            settle,
        }
    }

    pub fn applied_baud(&self, port: u8) -> Option<u32> {
        self.line_baud.get(&port).copied()
    }

    async fn ensure_baud(&mut self, address: &SerialAddress, timeout: Duration) -> Result<(), TransportError> {
        if self.line_baud.get(&address.port) == Some(&address.baud_rate) {
            return Ok(());
        }

        let result = match tokio::time::timeout(
            timeout,
            self.bus.set_baud_rate(address.port, address.baud_rate),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(()) => {
                debug!(port = address.port, baud_rate = address.baud_rate, "Line speed changed");
                self.line_baud.insert(address.port, address.baud_rate);
                tokio::time::sleep(self.settle).await;
                Ok(())
            },
            Err(e) => {
                // line state unknown, force a switch before the next device
                self.line_baud.remove(&address.port);
                Err(e)
            },
        }
    }
}

#[async_trait]
impl PollDomain for SerialDomain {
    fn protocol(&self) -> Protocol {
        Protocol::Serial
    }

    async fn poll_device(
        &mut self,
        ctx: &PollContext,
        device: &DeviceConfig,
        entry: &HealthEntry,
    ) -> PollOutcome {
        let DeviceAddress::Serial(address) = &device.address else {
            return PollOutcome::Failed(TransportError::Codec(format!(
                "{} is not a serial device",
                device.id
            )));
        };

        if let Err(error) = self.ensure_baud(address, device.timeout()).await {
            return match record_failure(entry, &device.id, &error) {
                Some(reason) => PollOutcome::Disabled(reason),
                None => PollOutcome::Failed(error),
            };
        }

        let mut reader = SerialReader {
            bus: self.bus.as_ref(),
            address,
        };
        read_device(ctx, device, entry, &mut reader).await
    }
}

/// Polling loop for the serial domain
pub type SerialPoller = PollLoop<SerialDomain>;

impl PollLoop<SerialDomain> {
    pub fn new(ctx: PollContext, bus: Arc<dyn SerialBus>) -> Self {
        let settle = ctx.settings.baud_settle;
        Self::with_domain(ctx, SerialDomain::new(bus, settle))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::{ChangeFlags, MemoryDeviceStore};
    use crate::core::health::DisableReason;
    use crate::core::polling::PollSettings;
    use crate::core::priority::PriorityFlag;
    use crate::core::registry::HealthRegistry;
    use crate::sink::{ChannelSink, RegisterBatch};
    use crate::transport::simulator::{SerialCall, SimulatedSerialBus};
    use tokio::sync::mpsc::Receiver;

    struct Harness {
        store: Arc<MemoryDeviceStore>,
        bus: Arc<SimulatedSerialBus>,
        registry: Arc<HealthRegistry>,
        priority: Arc<PriorityFlag>,
        rx: Receiver<RegisterBatch>,
        poller: SerialPoller,
    }

    fn harness(devices: Vec<DeviceConfig>) -> Harness {
        let flags = ChangeFlags::new();
        let store = Arc::new(MemoryDeviceStore::with_devices(devices, flags.clone()));
        let bus = Arc::new(SimulatedSerialBus::new());
        let registry = Arc::new(HealthRegistry::new());
        let priority = Arc::new(PriorityFlag::new());
        let (sink, rx) = ChannelSink::channel(64);
        let ctx = PollContext {
            store: store.clone(),
            changes: flags.serial.clone(),
            registry: registry.clone(),
            priority: priority.clone(),
            sink: Arc::new(sink),
            settings: PollSettings::default(),
        };
        let poller = SerialPoller::new(ctx, bus.clone());
        Harness {
            store,
            bus,
            registry,
            priority,
            rx,
            poller,
        }
    }

    fn meter(id: &str, slave_id: u8, baud_rate: u32) -> DeviceConfig {
        DeviceConfig::serial(id, 1, slave_id, baud_rate)
            .with_register("voltage", 100, 2)
            .with_timing(500, 1000)
    }

    fn baud_switches(bus: &SimulatedSerialBus) -> Vec<u32> {
        bus.journal()
            .into_iter()
            .filter_map(|call| match call {
                SerialCall::SetBaud { baud_rate, .. } => Some(baud_rate),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_poll_emits_batch() {
        let mut h = harness(vec![meter("m1", 1, 9600)]);
        h.bus.set_registers(1, 1, 100, &[2301, 2299]);

        let summary = h.poller.run_pass().await;
        assert_eq!(summary.completed, 1);

        let batch = h.rx.try_recv().unwrap();
        assert_eq!(batch.device_id, "m1");
        let raws: Vec<u16> = batch.values.iter().map(|v| v.raw).collect();
        assert_eq!(raws, vec![2301, 2299]);
        assert_eq!(batch.values[1].address, 101);

        let status = h.registry.status("m1").unwrap();
        assert_eq!(status.health.metrics().successful_reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_baud_switch_only_on_change() {
        let mut h = harness(vec![
            meter("a", 1, 9600),
            meter("b", 2, 9600),
            meter("c", 3, 19_200),
        ]);
        for slave in 1..=3 {
            h.bus.set_registers(1, slave, 100, &[1, 2]);
        }

        let summary = h.poller.run_pass().await;
        assert_eq!(summary.completed, 3);
        assert_eq!(baud_switches(&h.bus), vec![9600, 19_200]);

        // every read happened at the device's own rate
        for call in h.bus.journal() {
            if let SerialCall::Read {
                slave_id,
                baud_rate,
                ..
            } = call
            {
                let expected = if slave_id == 3 { 19_200 } else { 9600 };
                assert_eq!(baud_rate, Some(expected));
            }
        }
        assert_eq!(h.poller.domain().applied_baud(1), Some(19_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_baud_change_clears_cache() {
        let mut h = harness(vec![meter("a", 1, 9600)]);
        h.bus.set_registers(1, 1, 100, &[1, 2]);
        h.bus.fail_baud_changes(1, true);

        let summary = h.poller.run_pass().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(h.poller.domain().applied_baud(1), None);
        assert_eq!(h.bus.reads(1, 1), 0);

        h.bus.fail_baud_changes(1, false);
        tokio::time::advance(Duration::from_millis(1000)).await;
        let summary = h.poller.run_pass().await;
        assert_eq!(summary.completed, 1);
        assert_eq!(baud_switches(&h.bus), vec![9600, 9600]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_retry_within_poll_until_disabled() {
        let mut h = harness(vec![meter("a", 1, 9600)]);
        h.bus.set_registers(1, 1, 100, &[1, 2]);
        h.bus
            .set_fault(1, 1, TransportError::Io("framing error".into()));

        let summary = h.poller.run_pass().await;
        assert_eq!(summary.disabled, 1);
        assert_eq!(h.bus.reads(1, 1), 3);

        let health = h.registry.status("a").unwrap().health;
        assert_eq!(health.disable_reason(), DisableReason::AutoRetry);
        assert_eq!(health.consecutive_failures(), 3);
        assert_eq!(health.retry_count(), 3);
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_within_poll() {
        let mut h = harness(vec![meter("a", 1, 9600)]);
        h.bus.set_registers(1, 1, 100, &[7, 8]);
        h.bus
            .fail_next(1, 1, TransportError::Codec("crc".into()), 1);

        let summary = h.poller.run_pass().await;
        assert_eq!(summary.completed, 1);

        let health = h.registry.status("a").unwrap().health;
        assert!(health.is_enabled());
        assert_eq!(health.consecutive_failures(), 0);
        assert_eq!(health.metrics().total_reads, 2);
        assert_eq!(health.metrics().failed_reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_disable_across_polls() {
        let mut h = harness(vec![meter("a", 1, 9600).with_thresholds(5, 3)]);
        h.bus.set_registers(1, 1, 100, &[1, 2]);
        h.bus.set_latency(1, 1, Duration::from_secs(5));

        for poll in 1..=3 {
            let summary = h.poller.run_pass().await;
            if poll < 3 {
                assert_eq!(summary.failed, 1, "poll {}", poll);
            } else {
                assert_eq!(summary.disabled, 1);
            }
            tokio::time::advance(Duration::from_millis(1000)).await;
        }

        let health = h.registry.status("a").unwrap().health;
        assert_eq!(health.disable_reason(), DisableReason::AutoTimeout);
        assert_eq!(health.consecutive_timeouts(), 3);
        // timeouts are not retried inside a poll
        assert_eq!(h.bus.reads(1, 1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_rate_gates_polls() {
        let mut h = harness(vec![meter("a", 1, 9600)]);
        h.bus.set_registers(1, 1, 100, &[1, 2]);

        assert_eq!(h.poller.run_pass().await.completed, 1);
        assert_eq!(h.poller.run_pass().await.completed, 0);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(h.poller.run_pass().await.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_device_is_skipped() {
        let mut h = harness(vec![meter("a", 1, 9600)]);
        h.registry
            .ensure(&meter("a", 1, 9600))
            .lock()
            .disable_manual("maintenance", chrono::Utc::now());

        let summary = h.poller.run_pass().await;
        assert_eq!(summary.skipped, 1);
        assert!(h.bus.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_pauses_before_next_device() {
        let mut h = harness(vec![meter("a", 1, 9600)]);
        h.bus.set_registers(1, 1, 100, &[1, 2]);
        let guard = h.priority.hold();

        let released = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            drop(guard);
        });

        let summary = h.poller.run_pass().await;
        released.await.unwrap();
        assert_eq!(summary.yields, 3);
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_mid_pass_reloads_working_set() {
        let mut h = harness(vec![meter("a", 1, 9600)]);
        h.bus.set_registers(1, 1, 100, &[1, 2]);
        h.bus.set_registers(1, 2, 100, &[3, 4]);

        assert_eq!(h.poller.run_pass().await.completed, 1);

        h.store.upsert(meter("b", 2, 9600));
        let summary = h.poller.run_pass().await;
        assert_eq!(summary.reloads, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(h.poller.working_set().devices().len(), 2);

        h.store.remove("a");
        h.poller.run_pass().await;
        assert!(h.registry.get("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_and_config_disabled_devices_are_not_polled() {
        let broken = DeviceConfig::serial("broken", 1, 4, 9600);
        let mut h = harness(vec![meter("off", 1, 9600).disabled(), broken]);

        let summary = h.poller.run_pass().await;
        assert_eq!(summary.polled(), 0);
        assert!(h.poller.working_set().devices().is_empty());
        assert!(h.bus.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_change_mid_device_restarts_it() {
        let three = meter("m1", 1, 9600)
            .with_register("current", 101, 1)
            .with_register("power", 102, 1);
        let Harness {
            store,
            bus,
            mut rx,
            poller,
            ..
        } = harness(vec![three.clone()]);
        bus.set_registers(1, 1, 100, &[1, 2, 3, 4]);
        bus.set_latency(1, 1, Duration::from_millis(100));

        let pass = tokio::spawn(async move {
            let mut poller = poller;
            poller.run_pass().await
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        store.upsert(three.with_register("energy", 103, 1));

        let summary = pass.await.unwrap();
        assert_eq!(summary.interrupted, 1);
        assert_eq!(summary.reloads, 2);
        assert_eq!(summary.completed, 1);

        // the abandoned partial read never reaches the sink
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.values.len(), 5);
        assert!(rx.try_recv().is_err());
    }
}
