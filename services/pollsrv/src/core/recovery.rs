//! Automatic recovery of devices disabled by the failure thresholds

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::HealthRegistry;

/// Shortest pass interval; a zero period would stall the ticker
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Periodically re-enables automatically disabled devices once their
/// cooldown has elapsed. Manually disabled devices are never touched.
pub struct AutoRecoveryScheduler {
    registry: Arc<HealthRegistry>,
    interval: Duration,
    cooldown: Duration,
}

impl AutoRecoveryScheduler {
    pub fn new(registry: Arc<HealthRegistry>, interval: Duration, cooldown: Duration) -> Self {
        Self {
            registry,
            interval: interval.max(MIN_INTERVAL),
            cooldown,
        }
    }

    /// One recovery pass evaluated at `now`; returns the recovered device ids
    pub fn run_pass_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut recovered = Vec::new();
        for (device_id, entry) in self.registry.entries() {
            let reason = {
                let mut state = entry.lock();
                let reason = state.disable_reason();
                state.try_recover(now, self.cooldown).then_some(reason)
            };
            if let Some(reason) = reason {
                info!(device_id = %device_id, ?reason, "Device re-enabled by auto-recovery");
                recovered.push(device_id);
            }
        }
        if !recovered.is_empty() {
            debug!("Recovery pass re-enabled {} device(s)", recovered.len());
        }
        recovered
    }

    pub fn run_pass(&self) -> Vec<String> {
        self.run_pass_at(Utc::now())
    }

    /// Run passes every `interval` until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            cooldown_secs = self.cooldown.as_secs(),
            "Auto-recovery started"
        );
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_pass();
                },
            }
        }
        info!("Auto-recovery stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::core::health::DisableReason;
    use crate::error::FailureKind;
    use chrono::TimeZone;
    use tracing_test::traced_test;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn device(id: &str) -> DeviceConfig {
        DeviceConfig::serial(id, 1, 1, 9600)
            .with_register("r", 0, 1)
            .with_thresholds(1, 1)
    }

    fn scheduler(registry: &Arc<HealthRegistry>) -> AutoRecoveryScheduler {
        AutoRecoveryScheduler::new(
            registry.clone(),
            Duration::from_secs(30),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_recovers_only_automatic_after_cooldown() {
        let registry = Arc::new(HealthRegistry::new());
        registry
            .ensure(&device("auto-retry"))
            .lock()
            .record_failure(FailureKind::Exception, "x", t(0));
        registry
            .ensure(&device("auto-timeout"))
            .lock()
            .record_failure(FailureKind::Timeout, "t", t(10));
        registry
            .ensure(&device("manual"))
            .lock()
            .disable_manual("operator", t(0));
        registry.ensure(&device("healthy"));

        let scheduler = scheduler(&registry);
        assert_eq!(scheduler.run_pass_at(t(31)), vec!["auto-retry".to_string()]);

        let mut later = scheduler.run_pass_at(t(40));
        later.sort();
        assert_eq!(later, vec!["auto-timeout".to_string()]);

        let manual = registry.status("manual").unwrap().health;
        assert_eq!(manual.disable_reason(), DisableReason::Manual);
        assert!(scheduler.run_pass_at(t(10_000)).is_empty());
    }

    #[test]
    #[traced_test]
    fn test_recovery_is_logged() {
        let registry = Arc::new(HealthRegistry::new());
        registry
            .ensure(&device("pump"))
            .lock()
            .record_failure(FailureKind::Timeout, "no answer", t(0));

        scheduler(&registry).run_pass_at(t(30));
        assert!(logs_contain("Device re-enabled by auto-recovery"));
        assert!(logs_contain("pump"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_recovers() {
        let registry = Arc::new(HealthRegistry::new());
        let long_ago = Utc::now() - chrono::Duration::minutes(5);
        registry
            .ensure(&device("pump"))
            .lock()
            .record_failure(FailureKind::Timeout, "no answer", long_ago);

        let cancel = CancellationToken::new();
        let scheduler =
            AutoRecoveryScheduler::new(registry.clone(), Duration::ZERO, Duration::from_secs(30));
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.status("pump").unwrap().health.is_enabled());

        cancel.cancel();
        assert!(task.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let registry = Arc::new(HealthRegistry::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler(&registry).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        assert!(task.await.is_ok());
    }
}
