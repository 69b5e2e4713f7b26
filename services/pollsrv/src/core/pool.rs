//! Bounded network connection pool
//!
//! At most `capacity` connections exist at once, counting those being
//! established. When every slot is taken and the caller needs a new
//! endpoint, the least recently used idle connection is closed to make room;
//! connections that are lent out are never evicted. Bookkeeping happens
//! under a short synchronous lock that is never held across I/O.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::Endpoint;
use crate::error::TransportError;
use crate::transport::NetworkBus;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// One capacity slot. `idle` is `Some` while the connection sits in the
/// pool and `None` while it is lent out or still connecting.
struct Slot<C> {
    id: u64,
    endpoint: Endpoint,
    idle: Option<C>,
    /// Logical clock value of the last hand-back
    last_used: u64,
}

struct PoolState<C> {
    slots: Vec<Slot<C>>,
    next_id: u64,
    clock: u64,
    opened: u64,
    evicted: u64,
    discarded: u64,
    exhausted: u64,
}

enum Plan<C> {
    Reuse { slot_id: u64, connection: C },
    Open { slot_id: u64, evicted: Option<(Endpoint, C)> },
}

impl<C> PoolState<C> {
    fn reserve(&mut self, endpoint: &Endpoint) -> u64 {
        self.next_id += 1;
        self.slots.push(Slot {
            id: self.next_id,
            endpoint: endpoint.clone(),
            idle: None,
            last_used: 0,
        });
        self.next_id
    }

    fn plan(&mut self, endpoint: &Endpoint, capacity: usize) -> Result<Plan<C>, TransportError> {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.idle.is_some() && &slot.endpoint == endpoint)
        {
            if let Some(connection) = slot.idle.take() {
                return Ok(Plan::Reuse {
                    slot_id: slot.id,
                    connection,
                });
            }
        }

        if self.slots.len() < capacity {
            return Ok(Plan::Open {
                slot_id: self.reserve(endpoint),
                evicted: None,
            });
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.idle.is_some())
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(index, _)| index);

        match victim {
            Some(index) => {
                let slot = self.slots.swap_remove(index);
                self.evicted += 1;
                let evicted = slot.idle.map(|connection| (slot.endpoint, connection));
                Ok(Plan::Open {
                    slot_id: self.reserve(endpoint),
                    evicted,
                })
            },
            None => {
                self.exhausted += 1;
                Err(TransportError::PoolExhausted { capacity })
            },
        }
    }

    fn release(&mut self, slot_id: u64, connection: C) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == slot_id) {
            self.clock += 1;
            slot.idle = Some(connection);
            slot.last_used = self.clock;
        }
    }

    fn discard(&mut self, slot_id: u64) {
        self.slots.retain(|slot| slot.id != slot_id);
    }
}

/// Pool occupancy and lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    /// Slots taken, including connections being established
    pub open: usize,
    pub in_use: usize,
    pub idle: usize,
    pub opened: u64,
    pub evicted: u64,
    pub discarded: u64,
    pub exhausted: u64,
}

pub struct ConnectionPool<B: NetworkBus> {
    bus: Arc<B>,
    config: PoolConfig,
    state: parking_lot::Mutex<PoolState<B::Connection>>,
}

impl<B: NetworkBus> ConnectionPool<B> {
    pub fn new(bus: Arc<B>, config: PoolConfig) -> Self {
        Self {
            bus,
            config: PoolConfig {
                capacity: config.capacity.max(1),
                ..config
            },
            state: parking_lot::Mutex::new(PoolState {
                slots: Vec::new(),
                next_id: 0,
                clock: 0,
                opened: 0,
                evicted: 0,
                discarded: 0,
                exhausted: 0,
            }),
        }
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Borrow a connection to `endpoint`, opening one if no idle connection
    /// to that endpoint exists.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledConnection<'_, B>, TransportError> {
        self.acquire_within(endpoint, self.config.connect_timeout).await
    }

    /// Like [`acquire`](Self::acquire), but a new connection must be
    /// established within `limit` (capped at the pool's connect timeout).
    ///
    /// Cancel-safe: dropping the future mid-connect gives the reserved slot
    /// back.
    pub async fn acquire_within(
        &self,
        endpoint: &Endpoint,
        limit: Duration,
    ) -> Result<PooledConnection<'_, B>, TransportError> {
        let plan = self.state.lock().plan(endpoint, self.config.capacity)?;

        let (slot_id, evicted) = match plan {
            Plan::Reuse {
                slot_id,
                connection,
            } => {
                trace!(%endpoint, slot_id, "Reusing pooled connection");
                return Ok(PooledConnection::new(self, slot_id, endpoint, connection));
            },
            Plan::Open { slot_id, evicted } => (slot_id, evicted),
        };
        let mut reservation = Reservation {
            pool: self,
            slot_id,
            armed: true,
        };

        if let Some((old_endpoint, connection)) = evicted {
            debug!(evicted = %old_endpoint, %endpoint, "Pool full, closing least recently used connection");
            drop(connection);
        }

        let limit = limit.min(self.config.connect_timeout);
        let connected = match timeout(limit, self.bus.connect(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit.as_millis() as u64)),
        };

        match connected {
            Ok(connection) => {
                reservation.armed = false;
                self.state.lock().opened += 1;
                debug!(%endpoint, slot_id, "Opened pooled connection");
                Ok(PooledConnection::new(self, slot_id, endpoint, connection))
            },
            Err(e) => {
                drop(reservation);
                debug!(%endpoint, "Connect failed: {}", e);
                Err(e)
            },
        }
    }

    /// Close every idle connection
    pub fn close_idle(&self) -> usize {
        let closed: Vec<B::Connection> = {
            let mut state = self.state.lock();
            let (idle, busy): (Vec<_>, Vec<_>) =
                state.slots.drain(..).partition(|slot| slot.idle.is_some());
            state.slots = busy;
            idle.into_iter().filter_map(|slot| slot.idle).collect()
        };
        closed.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let idle = state.slots.iter().filter(|slot| slot.idle.is_some()).count();
        PoolStats {
            capacity: self.config.capacity,
            open: state.slots.len(),
            in_use: state.slots.len() - idle,
            idle,
            opened: state.opened,
            evicted: state.evicted,
            discarded: state.discarded,
            exhausted: state.exhausted,
        }
    }

    /// Endpoints with an idle connection, least recently used first
    pub fn idle_endpoints(&self) -> Vec<Endpoint> {
        let state = self.state.lock();
        let mut idle: Vec<&Slot<B::Connection>> =
            state.slots.iter().filter(|slot| slot.idle.is_some()).collect();
        idle.sort_by_key(|slot| slot.last_used);
        idle.into_iter().map(|slot| slot.endpoint.clone()).collect()
    }
}

/// Slot held while a connection is being established; freed on drop
struct Reservation<'a, B: NetworkBus> {
    pool: &'a ConnectionPool<B>,
    slot_id: u64,
    armed: bool,
}

impl<B: NetworkBus> Drop for Reservation<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().discard(self.slot_id);
        }
    }
}

/// Connection on loan from a [`ConnectionPool`]
///
/// Returned to the pool on drop; call [`invalidate`](Self::invalidate) first
/// when the link is broken so it is closed instead.
pub struct PooledConnection<'a, B: NetworkBus> {
    pool: &'a ConnectionPool<B>,
    slot_id: u64,
    endpoint: Endpoint,
    connection: Option<B::Connection>,
    broken: bool,
}

impl<'a, B: NetworkBus> PooledConnection<'a, B> {
    fn new(pool: &'a ConnectionPool<B>, slot_id: u64, endpoint: &Endpoint, connection: B::Connection) -> Self {
        Self {
            pool,
            slot_id,
            endpoint: endpoint.clone(),
            connection: Some(connection),
            broken: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Close the connection when the loan ends
    pub fn invalidate(&mut self) {
        self.broken = true;
    }

    /// Undo [`invalidate`](Self::invalidate)
    pub fn revalidate(&mut self) {
        self.broken = false;
    }
}

impl<B: NetworkBus> std::fmt::Debug for PooledConnection<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot_id", &self.slot_id)
            .field("endpoint", &self.endpoint)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<B: NetworkBus> std::ops::Deref for PooledConnection<'_, B> {
    type Target = B::Connection;

    fn deref(&self) -> &Self::Target {
        match self.connection.as_ref() {
            Some(connection) => connection,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<B: NetworkBus> std::ops::DerefMut for PooledConnection<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.connection.as_mut() {
            Some(connection) => connection,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<B: NetworkBus> Drop for PooledConnection<'_, B> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let mut state = self.pool.state.lock();
        if self.broken {
            state.discard(self.slot_id);
            state.discarded += 1;
            drop(state);
            drop(connection);
            debug!(endpoint = %self.endpoint, "Closed broken connection");
        } else {
            state.release(self.slot_id, connection);
        }
    }
}
