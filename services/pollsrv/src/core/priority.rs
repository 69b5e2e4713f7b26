//! Local-control priority flag
//!
//! While any [`PriorityGuard`] is alive the polling loops stop issuing new
//! reads at their next device boundary. The guard clears its hold on drop,
//! so an early return or a panic in the control path cannot leave polling
//! paused.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

#[derive(Debug, Default)]
pub struct PriorityFlag {
    holders: AtomicUsize,
    yields: AtomicU64,
}

impl PriorityFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the bus for local control
    pub fn hold(self: &Arc<Self>) -> PriorityGuard {
        self.holders.fetch_add(1, Ordering::AcqRel);
        PriorityGuard {
            flag: Arc::clone(self),
        }
    }

    pub fn is_set(&self) -> bool {
        self.holders.load(Ordering::Acquire) > 0
    }

    /// Total backoff sleeps taken by the polling loops
    pub fn yields(&self) -> u64 {
        self.yields.load(Ordering::Relaxed)
    }

    /// Sleep in `backoff` steps until the flag clears.
    ///
    /// Returns the number of sleeps taken.
    pub async fn wait_clear(&self, backoff: Duration) -> u32 {
        let mut waits = 0;
        while self.is_set() {
            trace!("Local control active, polling yields for {:?}", backoff);
            self.yields.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(backoff).await;
            waits += 1;
        }
        waits
    }
}

/// Active claim on a [`PriorityFlag`]
#[must_use = "polling resumes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PriorityGuard {
    flag: Arc<PriorityFlag>,
}

impl PriorityGuard {
    pub fn release(self) {}
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        self.flag.holders.fetch_sub(1, Ordering::AcqRel);
    }
}
