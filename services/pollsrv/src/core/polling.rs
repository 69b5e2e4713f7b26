//! Polling loop driver shared by the serial and network domains
//!
//! A [`PollLoop`] owns a working copy of its domain's device list, walks the
//! devices that are due, and hands each one to its [`PollDomain`] for the
//! protocol-specific part. Between devices it yields to local control and
//! picks up configuration changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::health::DisableReason;
use super::priority::PriorityFlag;
use super::registry::{HealthEntry, HealthRegistry};
use crate::config::{ConfigChangeFlag, DeviceConfig, DeviceStore, EngineConfig, Protocol};
use crate::error::TransportError;
use crate::sink::{RegisterBatch, RegisterValue, ValueSink};

/// Loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub tick: Duration,
    pub priority_backoff: Duration,
    pub baud_settle: Duration,
}

impl From<&EngineConfig> for PollSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            tick: config.tick(),
            priority_backoff: config.priority_backoff(),
            baud_settle: config.baud_settle(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Collaborators of one polling loop
#[derive(Clone)]
pub struct PollContext {
    pub store: Arc<dyn DeviceStore>,
    /// Change flag of this loop's domain
    pub changes: Arc<ConfigChangeFlag>,
    pub registry: Arc<HealthRegistry>,
    pub priority: Arc<PriorityFlag>,
    pub sink: Arc<dyn ValueSink>,
    pub settings: PollSettings,
}

/// Result of polling one device once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every register read; the batch went to the sink
    Completed { values: usize },
    /// A read failed below the disable thresholds
    Failed(TransportError),
    /// A read failure crossed a threshold
    Disabled(DisableReason),
    /// Configuration changed mid-device; partial values discarded
    Interrupted,
}

/// Counters for one pass over the device list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub completed: usize,
    pub failed: usize,
    pub disabled: usize,
    /// Due devices skipped because their health record is disabled
    pub skipped: usize,
    pub interrupted: usize,
    pub reloads: usize,
    pub yields: u32,
}

impl PassSummary {
    pub fn polled(&self) -> usize {
        self.completed + self.failed + self.disabled
    }
}

/// One register-block transaction against a device
#[async_trait]
pub trait RegisterReader: Send {
    async fn read(&mut self, start: u16, count: u16, timeout: Duration) -> Result<Vec<u16>, TransportError>;
}

/// Protocol-specific half of a polling loop
#[async_trait]
pub trait PollDomain: Send {
    fn protocol(&self) -> Protocol;

    async fn poll_device(
        &mut self,
        ctx: &PollContext,
        device: &DeviceConfig,
        entry: &HealthEntry,
    ) -> PollOutcome;
}

/// Run `future` under the device timeout
pub async fn with_timeout<F>(timeout: Duration, future: F) -> Result<Vec<u16>, TransportError>
where
    F: std::future::Future<Output = Result<Vec<u16>, TransportError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Record a failed read, logging any resulting disable
pub fn record_failure(
    entry: &HealthEntry,
    device_id: &str,
    error: &TransportError,
) -> Option<DisableReason> {
    let (reason, detail) = {
        let mut state = entry.lock();
        let reason = state.record_failure(error.kind(), &error.to_string(), Utc::now());
        (reason, state.disable_detail().to_string())
    };
    match reason {
        Some(reason) => warn!(device_id, ?reason, "Device disabled: {}", detail),
        None => debug!(device_id, "Read failed: {}", error),
    }
    reason
}

/// Read every configured register of `device` through `reader`.
///
/// Stops at the first failure. Transport-class failures are retried at once
/// while the device stays enabled, local control is idle, no configuration
/// change is pending and the attempt budget (`retry_count`) lasts.
pub async fn read_device<R: RegisterReader>(
    ctx: &PollContext,
    device: &DeviceConfig,
    entry: &HealthEntry,
    reader: &mut R,
) -> PollOutcome {
    let mut values = Vec::new();

    for register in &device.registers {
        entry.lock().begin_read();
        loop {
            if ctx.changes.is_pending() {
                debug!(device_id = %device.id, "Configuration changed, abandoning device");
                return PollOutcome::Interrupted;
            }

            let attempt = entry.lock().begin_attempt();
            let started = Instant::now();
            let result = reader
                .read(register.address, register.count, device.timeout())
                .await
                .and_then(|words| {
                    if words.len() == usize::from(register.count) {
                        Ok(words)
                    } else {
                        Err(TransportError::Codec(format!(
                            "{} words returned, {} requested",
                            words.len(),
                            register.count
                        )))
                    }
                });

            match result {
                Ok(words) => {
                    entry.lock().record_success(started.elapsed(), Utc::now());
                    values.extend(words.into_iter().enumerate().map(|(offset, raw)| {
                        RegisterValue {
                            register_id: register.id.clone(),
                            address: register.address.wrapping_add(offset as u16),
                            raw,
                        }
                    }));
                    break;
                },
                Err(error) => {
                    if let Some(reason) = record_failure(entry, &device.id, &error) {
                        return PollOutcome::Disabled(reason);
                    }
                    let retry = error.is_retryable()
                        && attempt < device.retry_count
                        && entry.lock().is_enabled()
                        && !ctx.priority.is_set();
                    if !retry {
                        return PollOutcome::Failed(error);
                    }
                    trace!(device_id = %device.id, attempt, "Retrying {}", register.id);
                },
            }
        }
    }

    let count = values.len();
    ctx.sink.emit(RegisterBatch {
        device_id: device.id.clone(),
        timestamp: Utc::now(),
        values,
    });
    PollOutcome::Completed { values: count }
}

/// Working copy of one domain's configuration plus its poll schedule
#[derive(Debug)]
pub struct WorkingSet {
    protocol: Protocol,
    devices: Vec<DeviceConfig>,
    last_poll: HashMap<String, Instant>,
    loaded: bool,
}

impl WorkingSet {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            devices: Vec::new(),
            last_poll: HashMap::new(),
            loaded: false,
        }
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Rebuild from the store.
    ///
    /// Keeps well-formed devices of this domain that the operator has not
    /// disabled in configuration, drops health records of deleted devices and
    /// preserves the schedule of devices that remain.
    pub fn reload(&mut self, store: &dyn DeviceStore, registry: &HealthRegistry) {
        let protocol = self.protocol;
        let configured: Vec<DeviceConfig> = store
            .list_devices()
            .into_iter()
            .filter(|device| device.protocol() == protocol)
            .collect();
        let ids: HashSet<String> = configured.iter().map(|device| device.id.clone()).collect();

        let removed = registry.retain_configured(protocol, &ids);
        for device_id in &removed {
            debug!(device_id = %device_id, "Device removed from configuration");
        }
        self.last_poll.retain(|id, _| ids.contains(id));

        let mut seen = HashSet::new();
        let mut devices = Vec::with_capacity(configured.len());
        let mut inactive = 0;
        for device in configured {
            if !seen.insert(device.id.clone()) {
                warn!(device_id = %device.id, "Duplicate device id, keeping the first entry");
                continue;
            }
            if let Err(e) = device.validate() {
                warn!(device_id = %device.id, "Skipping malformed device: {}", e);
                continue;
            }
            if !device.enabled {
                inactive += 1;
                continue;
            }
            if let Some(entry) = registry.get(&device.id) {
                entry
                    .lock()
                    .set_thresholds(device.retry_count, device.max_consecutive_timeouts);
            }
            devices.push(device);
        }

        info!(
            %protocol,
            active = devices.len(),
            inactive,
            removed = removed.len(),
            "Device list loaded"
        );
        self.devices = devices;
        self.loaded = true;
    }

    pub fn is_due(&self, device: &DeviceConfig, now: Instant) -> bool {
        self.last_poll
            .get(&device.id)
            .map_or(true, |last| now.saturating_duration_since(*last) >= device.refresh_rate())
    }

    /// First due device not yet visited in this pass
    pub fn next_due(&self, now: Instant, visited: &HashSet<String>) -> Option<DeviceConfig> {
        self.devices
            .iter()
            .find(|device| !visited.contains(&device.id) && self.is_due(device, now))
            .cloned()
    }

    pub fn mark_polled(&mut self, device_id: &str, at: Instant) {
        self.last_poll.insert(device_id.to_string(), at);
    }
}

/// Polling loop for one domain
pub struct PollLoop<D: PollDomain> {
    ctx: PollContext,
    working: WorkingSet,
    domain: D,
}

impl<D: PollDomain> PollLoop<D> {
    pub(crate) fn with_domain(ctx: PollContext, domain: D) -> Self {
        let working = WorkingSet::new(domain.protocol());
        Self {
            ctx,
            working,
            domain,
        }
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working
    }

    pub fn domain(&self) -> &D {
        &self.domain
    }

    fn reload(&mut self) {
        self.working
            .reload(self.ctx.store.as_ref(), &self.ctx.registry);
    }

    /// Walk the due devices once
    pub async fn run_pass(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();
        if !self.working.is_loaded() {
            self.ctx.changes.take();
            self.reload();
            summary.reloads += 1;
        }

        let mut visited = HashSet::new();
        loop {
            summary.yields += self
                .ctx
                .priority
                .wait_clear(self.ctx.settings.priority_backoff)
                .await;

            if self.ctx.changes.take() {
                self.reload();
                summary.reloads += 1;
            }

            let now = Instant::now();
            let Some(device) = self.working.next_due(now, &visited) else {
                break;
            };
            visited.insert(device.id.clone());

            let entry = self.ctx.registry.ensure(&device);
            if !entry.lock().is_enabled() {
                summary.skipped += 1;
                continue;
            }

            match self.domain.poll_device(&self.ctx, &device, &entry).await {
                PollOutcome::Completed { .. } => summary.completed += 1,
                PollOutcome::Failed(_) => summary.failed += 1,
                PollOutcome::Disabled(_) => summary.disabled += 1,
                PollOutcome::Interrupted => {
                    summary.interrupted += 1;
                    visited.remove(&device.id);
                    continue;
                },
            }
            self.working.mark_polled(&device.id, now);
        }
        summary
    }

    /// Poll until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        let protocol = self.domain.protocol();
        let tick = self.ctx.settings.tick;
        info!(%protocol, "Polling loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                summary = self.run_pass() => {
                    if summary.polled() > 0 || summary.reloads > 0 {
                        trace!(%protocol, ?summary, "Pass complete");
                    }
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {},
            }
        }
        info!(%protocol, "Polling loop stopped");
    }
}
