//! Transport layer
//!
//! The polling loops only see the [`SerialBus`] and [`NetworkBus`] traits.
//! Modbus RTU/TCP implementations and in-memory simulators live alongside.

use async_trait::async_trait;

use crate::config::{Endpoint, SerialAddress};

pub mod frame;
pub mod rtu;
pub mod simulator;
pub mod tcp;

pub use crate::error::{FailureKind, TransportError};
pub use rtu::RtuSerialBus;
pub use simulator::{SerialCall, SimulatedNetworkBus, SimulatedSerialBus};
pub use tcp::{TcpConnection, TcpNetworkBus};

/// Shared multi-drop serial bus
///
/// All devices on one line share a baud rate; the caller switches it before
/// talking to a device configured differently.
#[async_trait]
pub trait SerialBus: Send + Sync {
    async fn set_baud_rate(&self, port: u8, baud_rate: u32) -> Result<(), TransportError>;

    async fn read_registers(
        &self,
        address: &SerialAddress,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;
}

/// Connection-oriented network bus
///
/// Connections are owned by the pool; dropping one closes it.
#[async_trait]
pub trait NetworkBus: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, TransportError>;

    async fn read_registers(
        &self,
        connection: &mut Self::Connection,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;
}
