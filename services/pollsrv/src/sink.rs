//! Hand-off of polled values to downstream publishers

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterValue {
    /// Configured register id
    pub register_id: String,
    /// Modbus address of this word
    pub address: u16,
    pub raw: u16,
}

/// All values read from one device in one successful poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterBatch {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<RegisterValue>,
}

/// Consumer of polled values
///
/// Called from the polling loops; implementations must not block.
pub trait ValueSink: Send + Sync {
    fn emit(&self, batch: RegisterBatch);
}

/// Bounded channel sink; a full queue drops the batch rather than stalling a bus
pub struct ChannelSink {
    tx: mpsc::Sender<RegisterBatch>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RegisterBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ValueSink for ChannelSink {
    fn emit(&self, batch: RegisterBatch) {
        match self.tx.try_send(batch) {
            Ok(()) => {},
            Err(TrySendError::Full(batch)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    device_id = %batch.device_id,
                    dropped,
                    "Value queue full, batch dropped"
                );
            },
            Err(TrySendError::Closed(batch)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(device_id = %batch.device_id, "Value queue closed, batch dropped");
            },
        }
    }
}
