//! Network bus polling
//!
//! Each read transaction borrows a connection from the shared pool and hands
//! it back as soon as the transaction ends. A connection whose transaction
//! failed at the link level (or was cut short by the device timeout) is
//! closed rather than returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::polling::{read_device, PollContext, PollDomain, PollLoop, PollOutcome, RegisterReader};
use super::pool::ConnectionPool;
use super::registry::HealthEntry;
use crate::config::{DeviceAddress, DeviceConfig, Endpoint, Protocol};
use crate::error::TransportError;
use crate::transport::NetworkBus;

struct PooledReader<'a, B: NetworkBus> {
    pool: &'a ConnectionPool<B>,
    endpoint: &'a Endpoint,
    unit_id: u8,
}

#[async_trait]
impl<'a, B: NetworkBus> RegisterReader for PooledReader<'a, B> {
    async fn read(&mut self, start: u16, count: u16, timeout: Duration) -> Result<Vec<u16>, TransportError> {
        // connecting counts against the device timeout
        let deadline = Instant::now() + timeout;
        let mut connection = self.pool.acquire_within(self.endpoint, timeout).await?;
        // closed on drop unless the transaction completes
        connection.invalidate();

        let result = match tokio::time::timeout_at(
            deadline,
            self.pool
                .bus()
                .read_registers(&mut *connection, self.unit_id, start, count),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        };

        match &result {
            Err(e) if e.is_connection_fault() => {},
            _ => connection.revalidate(),
        }
        result
    }
}

/// Network half of the polling engine
pub struct NetworkDomain<B: NetworkBus> {
    pool: Arc<ConnectionPool<B>>,
}

impl<B: NetworkBus> NetworkDomain<B> {
    pub fn new(pool: Arc<ConnectionPool<B>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<B>> {
        &self.pool
    }
}

#[async_trait]
impl<B: NetworkBus> PollDomain for NetworkDomain<B> {
    fn protocol(&self) -> Protocol {
        Protocol::Network
    }

    async fn poll_device(
        &mut self,
        ctx: &PollContext,
        device: &DeviceConfig,
        entry: &HealthEntry,
    ) -> PollOutcome {
        let DeviceAddress::Network(address) = &device.address else {
            return PollOutcome::Failed(TransportError::Codec(format!(
                "{} is not a network device",
                device.id
            )));
        };

        let endpoint = address.endpoint();
        let mut reader = PooledReader {
            pool: self.pool.as_ref(),
            endpoint: &endpoint,
            unit_id: address.unit_id,
        };
        read_device(ctx, device, entry, &mut reader).await
    }
}

/// Polling loop for the network domain
pub type NetworkPoller<B> = PollLoop<NetworkDomain<B>>;

impl<B: NetworkBus> PollLoop<NetworkDomain<B>> {
    pub fn new(ctx: PollContext, pool: Arc<ConnectionPool<B>>) -> Self {
        Self::with_domain(ctx, NetworkDomain::new(pool))
    }
}
