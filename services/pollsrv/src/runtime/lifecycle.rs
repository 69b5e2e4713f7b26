//! Worker placement and shutdown
//!
//! Each polling loop gets its own OS thread driving a single-threaded tokio
//! runtime so a stalled bus never delays the other one. When more than one
//! core is available the two threads are pinned to different cores.

use std::future::Future;
use std::thread::JoinHandle;

use core_affinity::CoreId;
use tracing::{debug, error, info, warn};

use crate::error::{PollError, Result};

/// Which core each bus thread should run on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorePlan {
    pub serial: Option<CoreId>,
    pub network: Option<CoreId>,
}

impl CorePlan {
    /// First two cores for the serial and network loops; no pinning on a
    /// single-core machine or when disabled.
    pub fn detect(pin_cores: bool) -> Self {
        if !pin_cores {
            return Self::default();
        }
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        match cores.as_slice() {
            [serial, network, ..] => Self {
                serial: Some(*serial),
                network: Some(*network),
            },
            _ => {
                debug!("Fewer than two cores available, bus threads left unpinned");
                Self::default()
            },
        }
    }
}

/// Run `task` to completion on a dedicated thread with its own runtime
pub fn spawn_worker<F>(name: &str, core: Option<CoreId>, task: F) -> Result<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| PollError::Startup(format!("{} runtime: {}", name, e)))?;

    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            if let Some(core) = core {
                if core_affinity::set_for_current(core) {
                    info!(thread = %thread_name, core = core.id, "Worker pinned");
                } else {
                    warn!(thread = %thread_name, core = core.id, "Core pinning refused");
                }
            }
            runtime.block_on(task);
        })
        .map_err(|e| PollError::Startup(format!("{} thread: {}", name, e)))
}

/// Join handles of a running engine
pub struct EngineHandles {
    pub(crate) serial: JoinHandle<()>,
    pub(crate) network: JoinHandle<()>,
    pub(crate) recovery: tokio::task::JoinHandle<()>,
}

impl EngineHandles {
    /// Wait for every worker to stop. Call after cancelling the engine token.
    pub async fn join(self) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(e) = self.recovery.await {
            failures.push(format!("recovery task: {}", e));
        }
        for (name, handle) in [("serial", self.serial), ("network", self.network)] {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => debug!("{} worker joined", name),
                Ok(Err(_)) => failures.push(format!("{} worker panicked", name)),
                Err(e) => failures.push(format!("{} join: {}", name, e)),
            }
        }

        if failures.is_empty() {
            info!("Polling engine stopped");
            Ok(())
        } else {
            for failure in &failures {
                error!("{}", failure);
            }
            Err(PollError::Internal(failures.join("; ")))
        }
    }
}
