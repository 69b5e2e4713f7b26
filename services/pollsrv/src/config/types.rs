//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PollError, Result};

/// Largest register block a single Modbus 0x03 request may ask for
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Polling domain a device belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Serial,
    Network,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Serial => write!(f, "serial"),
            Protocol::Network => write!(f, "network"),
        }
    }
}

/// Network endpoint shared by every device behind the same gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialAddress {
    /// Serial line number, resolved to a device path through `serial_lines`
    pub port: u8,
    pub slave_id: u8,
    pub baud_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

impl NetworkAddress {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Protocol-specific address; the tag doubles as the polling domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum DeviceAddress {
    Serial(SerialAddress),
    Network(NetworkAddress),
}

/// One holding-register block read per poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub id: String,
    pub address: u16,
    #[serde(default = "default_register_count")]
    pub count: u16,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,

    pub address: DeviceAddress,

    /// Per-read response timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures tolerated before automatic disable
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Minimum interval between successive polls
    #[serde(default = "default_refresh_rate_ms")]
    pub refresh_rate_ms: u64,

    /// Operator intent; `false` keeps the device out of the polling set
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive timeouts tolerated before automatic disable
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,

    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

impl DeviceConfig {
    pub fn serial(id: impl Into<String>, port: u8, slave_id: u8, baud_rate: u32) -> Self {
        Self::with_address(
            id,
            DeviceAddress::Serial(SerialAddress {
                port,
                slave_id,
                baud_rate,
            }),
        )
    }

    pub fn network(id: impl Into<String>, host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self::with_address(
            id,
            DeviceAddress::Network(NetworkAddress {
                host: host.into(),
                port,
                unit_id,
            }),
        )
    }

    fn with_address(id: impl Into<String>, address: DeviceAddress) -> Self {
        Self {
            id: id.into(),
            address,
            timeout_ms: default_timeout_ms(),
            retry_count: default_retry_count(),
            refresh_rate_ms: default_refresh_rate_ms(),
            enabled: true,
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
            registers: Vec::new(),
        }
    }

    pub fn with_register(mut self, id: impl Into<String>, address: u16, count: u16) -> Self {
        self.registers.push(RegisterConfig {
            id: id.into(),
            address,
            count,
        });
        self
    }

    pub fn with_timing(mut self, timeout_ms: u64, refresh_rate_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self.refresh_rate_ms = refresh_rate_ms;
        self
    }

    pub fn with_thresholds(mut self, retry_count: u32, max_consecutive_timeouts: u32) -> Self {
        self.retry_count = retry_count;
        self.max_consecutive_timeouts = max_consecutive_timeouts;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn protocol(&self) -> Protocol {
        match self.address {
            DeviceAddress::Serial(_) => Protocol::Serial,
            DeviceAddress::Network(_) => Protocol::Network,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn refresh_rate(&self) -> Duration {
        Duration::from_millis(self.refresh_rate_ms)
    }

    /// Check the entry is pollable
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| Err(PollError::invalid_device(&self.id, reason));

        if self.id.trim().is_empty() {
            return fail("device id is empty");
        }
        if self.timeout_ms == 0 {
            return fail("timeout_ms must be greater than zero");
        }
        if self.refresh_rate_ms < self.timeout_ms {
            return fail("refresh_rate_ms must not be shorter than timeout_ms");
        }
        if self.retry_count == 0 {
            return fail("retry_count must be at least 1");
        }
        if self.max_consecutive_timeouts == 0 {
            return fail("max_consecutive_timeouts must be at least 1");
        }
        if self.registers.is_empty() {
            return fail("no registers configured");
        }
        for register in &self.registers {
            if register.count == 0 || register.count > MAX_REGISTERS_PER_READ {
                return Err(PollError::invalid_device(
                    &self.id,
                    format!(
                        "register {} count {} outside 1..={}",
                        register.id, register.count, MAX_REGISTERS_PER_READ
                    ),
                ));
            }
        }

        match &self.address {
            DeviceAddress::Serial(addr) => {
                if addr.baud_rate == 0 {
                    return fail("baud_rate must be greater than zero");
                }
            },
            DeviceAddress::Network(addr) => {
                if addr.host.trim().is_empty() {
                    return fail("host is empty");
                }
                if addr.port == 0 {
                    return fail("port must be greater than zero");
                }
            },
        }
        Ok(())
    }
}

/// Physical serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialLineConfig {
    pub port: u8,
    /// OS device path, e.g. `/dev/ttyS1`
    pub path: String,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// `none`, `even` or `odd`
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause between polling passes
    pub tick_ms: u64,
    /// Re-check interval while local control holds the priority flag
    pub priority_backoff_ms: u64,
    /// Line settle delay after a baud-rate change
    pub baud_settle_ms: u64,
    /// Interval between auto-recovery passes
    pub recovery_interval_secs: u64,
    /// Minimum time an automatically disabled device stays disabled
    pub recovery_cooldown_secs: u64,
    pub pool_capacity: usize,
    pub connect_timeout_ms: u64,
    /// Queue depth between the polling loops and the publisher
    pub sink_capacity: usize,
    /// Pin each polling loop to its own CPU core
    pub pin_cores: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            priority_backoff_ms: 50,
            baud_settle_ms: 50,
            recovery_interval_secs: 30,
            recovery_cooldown_secs: 30,
            pool_capacity: 4,
            connect_timeout_ms: 3000,
            sink_capacity: 1024,
            pin_cores: true,
        }
    }
}

impl EngineConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn priority_backoff(&self) -> Duration {
        Duration::from_millis(self.priority_backoff_ms)
    }

    pub fn baud_settle(&self) -> Duration {
        Duration::from_millis(self.baud_settle_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(PollError::Config("engine.pool_capacity must be at least 1".into()));
        }
        if self.sink_capacity == 0 {
            return Err(PollError::Config("engine.sink_capacity must be at least 1".into()));
        }
        if self.tick_ms == 0 || self.priority_backoff_ms == 0 {
            return Err(PollError::Config(
                "engine.tick_ms and engine.priority_backoff_ms must be greater than zero".into(),
            ));
        }
        if self.recovery_interval_secs == 0 {
            return Err(PollError::Config(
                "engine.recovery_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Service section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    /// Interval for the periodic device status summary, 0 disables it
    pub status_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "pollsrv".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            status_interval_secs: 60,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub engine: EngineConfig,
    pub serial_lines: Vec<SerialLineConfig>,
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Devices that fail validation, with the reason.
    pub fn invalid_devices(&self) -> Vec<PollError> {
        let mut problems: Vec<PollError> = self
            .devices
            .iter()
            .filter_map(|device| device.validate().err())
            .collect();

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                problems.push(PollError::invalid_device(&device.id, "duplicate device id"));
            }
        }

        let lines: std::collections::HashSet<u8> =
            self.serial_lines.iter().map(|line| line.port).collect();
        for device in &self.devices {
            if let DeviceAddress::Serial(addr) = &device.address {
                if !lines.contains(&addr.port) {
                    problems.push(PollError::invalid_device(
                        &device.id,
                        format!("serial port {} has no serial_lines entry", addr.port),
                    ));
                }
            }
        }
        problems
    }
}

fn default_unit_id() -> u8 {
    1
}

fn default_register_count() -> u16 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retry_count() -> u32 {
    3
}

fn default_refresh_rate_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_max_consecutive_timeouts() -> u32 {
    3
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}
