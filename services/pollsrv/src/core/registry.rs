//! Shared device health registry
//!
//! One entry per configured device, each behind its own lock so the two
//! polling loops, the recovery scheduler and the control API never contend
//! on unrelated devices. Locks are never held across an await point.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use super::health::DeviceHealthState;
use crate::config::{DeviceConfig, Protocol};

#[derive(Debug)]
pub struct HealthEntry {
    protocol: Protocol,
    state: Mutex<DeviceHealthState>,
}

impl HealthEntry {
    fn new(device: &DeviceConfig) -> Self {
        Self {
            protocol: device.protocol(),
            state: Mutex::new(DeviceHealthState::new(
                device.retry_count,
                device.max_consecutive_timeouts,
            )),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceHealthState> {
        self.state.lock()
    }

    pub fn snapshot(&self) -> DeviceHealthState {
        self.state.lock().clone()
    }
}

/// Health record plus identity, as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub protocol: Protocol,
    pub success_rate: f64,
    pub health: DeviceHealthState,
}

impl DeviceStatus {
    pub fn new(device_id: impl Into<String>, protocol: Protocol, health: DeviceHealthState) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            success_rate: health.success_rate(),
            health,
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    entries: DashMap<String, Arc<HealthEntry>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `device`, created on first use.
    ///
    /// Thresholds follow the current configuration. A device that moved to the
    /// other polling domain starts over with a fresh record.
    pub fn ensure(&self, device: &DeviceConfig) -> Arc<HealthEntry> {
        let mut slot = self
            .entries
            .entry(device.id.clone())
            .or_insert_with(|| Arc::new(HealthEntry::new(device)));

        if slot.protocol != device.protocol() {
            *slot = Arc::new(HealthEntry::new(device));
        } else {
            slot.lock()
                .set_thresholds(device.retry_count, device.max_consecutive_timeouts);
        }
        Arc::clone(slot.value())
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<HealthEntry>> {
        self.entries.get(device_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn status(&self, device_id: &str) -> Option<DeviceStatus> {
        let entry = self.get(device_id)?;
        Some(DeviceStatus::new(device_id, entry.protocol, entry.snapshot()))
    }

    /// Drop entries of `protocol` whose device is no longer configured
    pub fn retain_configured(&self, protocol: Protocol, configured: &HashSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.protocol == protocol && !configured.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for device_id in &stale {
            self.entries
                .remove_if(device_id, |_, entry| entry.protocol == protocol);
        }
        stale
    }

    /// Snapshot of every entry; used by the recovery pass
    pub fn entries(&self) -> Vec<(String, Arc<HealthEntry>)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
