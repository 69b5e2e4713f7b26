//! In-memory field simulators
//!
//! Scriptable stand-ins for the serial and network buses: per-device register
//! maps, fault injection, artificial latency and a call journal. Used by the
//! test-suite and by `pollsrv --simulate`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{NetworkBus, SerialBus};
use crate::config::{DeviceAddress, DeviceConfig, Endpoint, SerialAddress};
use crate::error::TransportError;

/// Modbus exception 0x02: illegal data address
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Modbus exception 0x0B: gateway target device failed to respond
const TARGET_NO_RESPONSE: u8 = 0x0B;

#[derive(Debug, Default)]
struct SimDevice {
    registers: HashMap<u16, u16>,
    fault: Option<TransportError>,
    queued: VecDeque<TransportError>,
    latency: Duration,
    reads: u64,
}

impl SimDevice {
    fn respond(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        self.reads += 1;
        if let Some(err) = self.queued.pop_front() {
            return Err(err);
        }
        if let Some(err) = &self.fault {
            return Err(err.clone());
        }
        (0..count)
            .map(|offset| {
                start
                    .checked_add(offset)
                    .and_then(|addr| self.registers.get(&addr).copied())
                    .ok_or(TransportError::Exception {
                        code: ILLEGAL_DATA_ADDRESS,
                    })
            })
            .collect()
    }

    fn load(&mut self, start: u16, values: &[u16]) {
        for (offset, value) in values.iter().enumerate() {
            self.registers
                .insert(start.wrapping_add(offset as u16), *value);
        }
    }

    fn seed(&mut self, device: &DeviceConfig) {
        for register in &device.registers {
            let values: Vec<u16> = (0..register.count)
                .map(|offset| register.address.wrapping_add(offset))
                .collect();
            self.load(register.address, &values);
        }
    }
}

async fn settle(latency: Duration, result: Result<Vec<u16>, TransportError>) -> Result<Vec<u16>, TransportError> {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
    result
}

/// Call recorded by [`SimulatedSerialBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialCall {
    SetBaud {
        port: u8,
        baud_rate: u32,
    },
    Read {
        port: u8,
        slave_id: u8,
        /// Line speed at the time of the read
        baud_rate: Option<u32>,
        start: u16,
        count: u16,
    },
}

#[derive(Default)]
struct SerialState {
    devices: HashMap<(u8, u8), SimDevice>,
    line_baud: HashMap<u8, u32>,
    failing_lines: HashSet<u8>,
    journal: Vec<SerialCall>,
}

/// Simulated multi-drop serial field
///
/// A device only answers when the line runs at its configured baud rate;
/// otherwise the frame is garbled and the read fails with a codec error.
#[derive(Default)]
pub struct SimulatedSerialBus {
    state: Mutex<SerialState>,
}

impl SimulatedSerialBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every serial device in `devices` with deterministic values
    /// (each register holds its own address).
    pub fn seeded(devices: &[DeviceConfig]) -> Self {
        let bus = Self::new();
        {
            let mut state = bus.state.lock();
            for device in devices {
                if let DeviceAddress::Serial(addr) = &device.address {
                    state
                        .devices
                        .entry((addr.port, addr.slave_id))
                        .or_default()
                        .seed(device);
                }
            }
        }
        bus
    }

    pub fn set_registers(&self, port: u8, slave_id: u8, start: u16, values: &[u16]) {
        self.state
            .lock()
            .devices
            .entry((port, slave_id))
            .or_default()
            .load(start, values);
    }

    /// Fail every read until [`clear_fault`](Self::clear_fault)
    pub fn set_fault(&self, port: u8, slave_id: u8, error: TransportError) {
        self.state
            .lock()
            .devices
            .entry((port, slave_id))
            .or_default()
            .fault = Some(error);
    }

    pub fn clear_fault(&self, port: u8, slave_id: u8) {
        if let Some(device) = self.state.lock().devices.get_mut(&(port, slave_id)) {
            device.fault = None;
            device.queued.clear();
        }
    }

    /// Fail the next `times` reads, then answer normally
    pub fn fail_next(&self, port: u8, slave_id: u8, error: TransportError, times: usize) {
        let mut state = self.state.lock();
        let device = state.devices.entry((port, slave_id)).or_default();
        device.queued.extend(std::iter::repeat(error).take(times));
    }

    pub fn set_latency(&self, port: u8, slave_id: u8, latency: Duration) {
        self.state
            .lock()
            .devices
            .entry((port, slave_id))
            .or_default()
            .latency = latency;
    }

    /// Make baud-rate changes on `port` fail
    pub fn fail_baud_changes(&self, port: u8, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_lines.insert(port);
        } else {
            state.failing_lines.remove(&port);
        }
    }

    pub fn line_baud(&self, port: u8) -> Option<u32> {
        self.state.lock().line_baud.get(&port).copied()
    }

    pub fn journal(&self) -> Vec<SerialCall> {
        self.state.lock().journal.clone()
    }

    pub fn reads(&self, port: u8, slave_id: u8) -> u64 {
        self.state
            .lock()
            .devices
            .get(&(port, slave_id))
            .map_or(0, |device| device.reads)
    }
}

#[async_trait]
impl SerialBus for SimulatedSerialBus {
    async fn set_baud_rate(&self, port: u8, baud_rate: u32) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.journal.push(SerialCall::SetBaud { port, baud_rate });
        if state.failing_lines.contains(&port) {
            state.line_baud.remove(&port);
            return Err(TransportError::Io(format!(
                "port {} rejected baud rate {}",
                port, baud_rate
            )));
        }
        state.line_baud.insert(port, baud_rate);
        Ok(())
    }

    async fn read_registers(
        &self,
        address: &SerialAddress,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let (latency, result) = {
            let mut state = self.state.lock();
            let line_baud = state.line_baud.get(&address.port).copied();
            state.journal.push(SerialCall::Read {
                port: address.port,
                slave_id: address.slave_id,
                baud_rate: line_baud,
                start,
                count,
            });
            match state.devices.get_mut(&(address.port, address.slave_id)) {
                Some(device) if line_baud == Some(address.baud_rate) => {
                    (device.latency, device.respond(start, count))
                },
                Some(device) => {
                    device.reads += 1;
                    (
                        device.latency,
                        Err(TransportError::Codec(format!(
                            "garbled frame: line at {:?}, device at {}",
                            line_baud, address.baud_rate
                        ))),
                    )
                },
                // nobody on the bus answers
                None => (Duration::ZERO, Err(TransportError::Timeout(0))),
            }
        };
        settle(latency, result).await
    }
}

/// Connection handed out by [`SimulatedNetworkBus`]
#[derive(Debug)]
pub struct SimConnection {
    id: u64,
    endpoint: Endpoint,
    live: Arc<AtomicUsize>,
}

impl SimConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct NetworkState {
    devices: HashMap<(Endpoint, u8), SimDevice>,
    refused: HashSet<Endpoint>,
    /// Gateways whose connect never completes
    stalled: HashSet<Endpoint>,
    connects: Vec<Endpoint>,
    /// (connection id, endpoint, unit id) per read
    reads: Vec<(u64, Endpoint, u8)>,
}

/// Simulated network field
#[derive(Default)]
pub struct SimulatedNetworkBus {
    state: Mutex<NetworkState>,
    next_id: AtomicU64,
    live: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl SimulatedNetworkBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every network device in `devices` with deterministic values
    /// (each register holds its own address).
    pub fn seeded(devices: &[DeviceConfig]) -> Self {
        let bus = Self::new();
        {
            let mut state = bus.state.lock();
            for device in devices {
                if let DeviceAddress::Network(addr) = &device.address {
                    state
                        .devices
                        .entry((addr.endpoint(), addr.unit_id))
                        .or_default()
                        .seed(device);
                }
            }
        }
        bus
    }

    pub fn set_registers(&self, endpoint: &Endpoint, unit_id: u8, start: u16, values: &[u16]) {
        self.state
            .lock()
            .devices
            .entry((endpoint.clone(), unit_id))
            .or_default()
            .load(start, values);
    }

    pub fn set_fault(&self, endpoint: &Endpoint, unit_id: u8, error: TransportError) {
        self.state
            .lock()
            .devices
            .entry((endpoint.clone(), unit_id))
            .or_default()
            .fault = Some(error);
    }

    pub fn clear_fault(&self, endpoint: &Endpoint, unit_id: u8) {
        if let Some(device) = self
            .state
            .lock()
            .devices
            .get_mut(&(endpoint.clone(), unit_id))
        {
            device.fault = None;
            device.queued.clear();
        }
    }

    pub fn fail_next(&self, endpoint: &Endpoint, unit_id: u8, error: TransportError, times: usize) {
        let mut state = self.state.lock();
        let device = state
            .devices
            .entry((endpoint.clone(), unit_id))
            .or_default();
        device.queued.extend(std::iter::repeat(error).take(times));
    }

    pub fn set_latency(&self, endpoint: &Endpoint, unit_id: u8, latency: Duration) {
        self.state
            .lock()
            .devices
            .entry((endpoint.clone(), unit_id))
            .or_default()
            .latency = latency;
    }

    pub fn refuse_connections(&self, endpoint: &Endpoint, refused: bool) {
        let mut state = self.state.lock();
        if refused {
            state.refused.insert(endpoint.clone());
        } else {
            state.refused.remove(endpoint);
        }
    }

    /// Make connection attempts to `endpoint` hang until cancelled
    pub fn stall_connections(&self, endpoint: &Endpoint, stalled: bool) {
        let mut state = self.state.lock();
        if stalled {
            state.stalled.insert(endpoint.clone());
        } else {
            state.stalled.remove(endpoint);
        }
    }

    /// Endpoints in connect order
    pub fn connects(&self) -> Vec<Endpoint> {
        self.state.lock().connects.clone()
    }

    /// Connection ids used for reads against `endpoint`, in order
    pub fn read_connections(&self, endpoint: &Endpoint) -> Vec<u64> {
        self.state
            .lock()
            .reads
            .iter()
            .filter(|(_, ep, _)| ep == endpoint)
            .map(|(id, _, _)| *id)
            .collect()
    }

    pub fn reads(&self, endpoint: &Endpoint, unit_id: u8) -> u64 {
        self.state
            .lock()
            .devices
            .get(&(endpoint.clone(), unit_id))
            .map_or(0, |device| device.reads)
    }

    /// Connections currently open
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections seen
    pub fn peak_connections(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkBus for SimulatedNetworkBus {
    type Connection = SimConnection;

    async fn connect(&self, endpoint: &Endpoint) -> Result<SimConnection, TransportError> {
        let stalled = {
            let mut state = self.state.lock();
            state.connects.push(endpoint.clone());
            if state.refused.contains(endpoint) {
                return Err(TransportError::ConnectionFailed(format!(
                    "{}: connection refused",
                    endpoint
                )));
            }
            state.stalled.contains(endpoint)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(SimConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            endpoint: endpoint.clone(),
            live: Arc::clone(&self.live),
        })
    }

    async fn read_registers(
        &self,
        connection: &mut SimConnection,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let (latency, result) = {
            let mut state = self.state.lock();
            state
                .reads
                .push((connection.id, connection.endpoint.clone(), unit_id));
            if state.refused.contains(&connection.endpoint) {
                (
                    Duration::ZERO,
                    Err(TransportError::Io("connection reset by peer".to_string())),
                )
            } else {
                match state
                    .devices
                    .get_mut(&(connection.endpoint.clone(), unit_id))
                {
                    Some(device) => (device.latency, device.respond(start, count)),
                    None => (
                        Duration::ZERO,
                        Err(TransportError::Exception {
                            code: TARGET_NO_RESPONSE,
                        }),
                    ),
                }
            }
        };
        settle(latency, result).await
    }
}
