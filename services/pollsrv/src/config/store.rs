//! Device configuration store and change notification

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::types::{DeviceConfig, Protocol};

/// Source of device configuration
///
/// Implementations must return a consistent snapshot; the polling loops copy
/// it into their own working set and never hold on to the store.
pub trait DeviceStore: Send + Sync {
    fn list_devices(&self) -> Vec<DeviceConfig>;

    fn get_device(&self, device_id: &str) -> Option<DeviceConfig> {
        self.list_devices().into_iter().find(|d| d.id == device_id)
    }
}

/// "Configuration changed" notification for one polling domain
///
/// Set by whoever edits the configuration, consumed by the domain's polling
/// loop at its next device boundary.
#[derive(Debug, Default)]
pub struct ConfigChangeFlag {
    pending: AtomicBool,
}

impl ConfigChangeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

/// One change flag per polling domain
#[derive(Debug, Clone, Default)]
pub struct ChangeFlags {
    pub serial: Arc<ConfigChangeFlag>,
    pub network: Arc<ConfigChangeFlag>,
}

impl ChangeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_protocol(&self, protocol: Protocol) -> &Arc<ConfigChangeFlag> {
        match protocol {
            Protocol::Serial => &self.serial,
            Protocol::Network => &self.network,
        }
    }

    pub fn mark_all(&self) {
        self.serial.mark();
        self.network.mark();
    }
}

/// In-memory [`DeviceStore`]
///
/// Every mutation marks the change flag of each protocol domain it touched.
pub struct MemoryDeviceStore {
    devices: RwLock<Vec<DeviceConfig>>,
    flags: ChangeFlags,
}

impl MemoryDeviceStore {
    pub fn new(flags: ChangeFlags) -> Self {
        Self::with_devices(Vec::new(), flags)
    }

    pub fn with_devices(devices: Vec<DeviceConfig>, flags: ChangeFlags) -> Self {
        Self {
            devices: RwLock::new(devices),
            flags,
        }
    }

    pub fn flags(&self) -> &ChangeFlags {
        &self.flags
    }

    pub fn replace_all(&self, devices: Vec<DeviceConfig>) {
        let touched = {
            let mut current = self.devices.write();
            let touched: HashSet<Protocol> = current
                .iter()
                .chain(devices.iter())
                .map(DeviceConfig::protocol)
                .collect();
            *current = devices;
            touched
        };
        debug!("Device configuration replaced ({} domains)", touched.len());
        self.notify(touched);
    }

    /// Insert or replace by id
    pub fn upsert(&self, device: DeviceConfig) {
        let mut touched = HashSet::from([device.protocol()]);
        {
            let mut current = self.devices.write();
            match current.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => {
                    touched.insert(existing.protocol());
                    *existing = device;
                },
                None => current.push(device),
            }
        }
        self.notify(touched);
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceConfig> {
        let removed = {
            let mut current = self.devices.write();
            let index = current.iter().position(|d| d.id == device_id)?;
            current.remove(index)
        };
        self.notify(HashSet::from([removed.protocol()]));
        Some(removed)
    }

    fn notify(&self, touched: HashSet<Protocol>) {
        for protocol in touched {
            self.flags.for_protocol(protocol).mark();
        }
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn list_devices(&self) -> Vec<DeviceConfig> {
        self.devices.read().clone()
    }

    fn get_device(&self, device_id: &str) -> Option<DeviceConfig> {
        self.devices.read().iter().find(|d| d.id == device_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(id: &str) -> DeviceConfig {
        DeviceConfig::serial(id, 1, 1, 9600).with_register("r", 0, 1)
    }

    fn network(id: &str) -> DeviceConfig {
        DeviceConfig::network(id, "10.0.0.1", 502, 1).with_register("r", 0, 1)
    }

    #[test]
    fn test_take_clears_flag() {
        let flag = ConfigChangeFlag::new();
        assert!(!flag.take());
        flag.mark();
        assert!(flag.is_pending());
        assert!(flag.take());
        assert!(!flag.is_pending());
    }

    #[test]
    fn test_upsert_marks_only_touched_domain() {
        let store = MemoryDeviceStore::new(ChangeFlags::new());
        store.upsert(serial("s1"));

        assert!(store.flags().serial.take());
        assert!(!store.flags().network.take());
        assert_eq!(store.get_device("s1"), Some(serial("s1")));
    }

    #[test]
    fn test_protocol_move_marks_both_domains() {
        let store = MemoryDeviceStore::with_devices(vec![serial("d1")], ChangeFlags::new());
        store.upsert(network("d1"));

        assert!(store.flags().serial.take());
        assert!(store.flags().network.take());
        assert_eq!(store.list_devices().len(), 1);
    }

    #[test]
    fn test_remove_and_replace() {
        let store =
            MemoryDeviceStore::with_devices(vec![serial("s1"), network("n1")], ChangeFlags::new());

        assert!(store.remove("missing").is_none());
        assert!(!store.flags().serial.is_pending());

        assert!(store.remove("n1").is_some());
        assert!(store.flags().network.take());

        store.replace_all(vec![network("n2")]);
        assert!(store.flags().serial.take());
        assert!(store.flags().network.take());
        assert_eq!(store.list_devices(), vec![network("n2")]);
    }
}
