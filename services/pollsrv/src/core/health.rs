//! Per-device health state machine
//!
//! ```text
//!            failures >= retry_count            cooldown elapsed
//!  Enabled ─────────────────────────► AutoRetry ───────────────► Enabled
//!     │      timeouts >= max_timeouts                (recovery)
//!     ├─────────────────────────────► AutoTimeout ──────────────► Enabled
//!     │      operator
//!     └─────────────────────────────► Manual ── operator only ──► Enabled
//! ```
//!
//! `is_enabled == true` always implies `disable_reason == None`, and every
//! disabled state carries a reason and a `disabled_at` timestamp.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Why a device is not being polled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    #[default]
    None,
    /// Operator action; only an operator re-enables
    Manual,
    /// Consecutive failures reached the retry threshold
    AutoRetry,
    /// Consecutive timeouts reached the timeout threshold
    AutoTimeout,
}

impl DisableReason {
    /// Eligible for automatic recovery
    pub fn is_automatic(self) -> bool {
        matches!(self, DisableReason::AutoRetry | DisableReason::AutoTimeout)
    }
}

/// Accumulated read statistics
///
/// Response-time fields are milliseconds over successful reads only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub total_reads: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub avg_response_ms: f64,
    pub min_response_ms: u64,
    pub max_response_ms: u64,
    pub last_response_ms: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    /// Successful reads as a percentage of all reads, `0.0` before the first read
    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            return 0.0;
        }
        self.successful_reads as f64 * 100.0 / self.total_reads as f64
    }

    fn record_success(&mut self, response: Duration, now: DateTime<Utc>) {
        let ms = response.as_millis() as u64;
        self.total_reads += 1;
        self.successful_reads += 1;
        self.avg_response_ms += (ms as f64 - self.avg_response_ms) / self.successful_reads as f64;
        self.min_response_ms = if self.successful_reads == 1 {
            ms
        } else {
            self.min_response_ms.min(ms)
        };
        self.max_response_ms = self.max_response_ms.max(ms);
        self.last_response_ms = ms;
        self.last_success_at = Some(now);
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.total_reads += 1;
        self.failed_reads += 1;
        self.last_failure_at = Some(now);
    }
}

/// Health record of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHealthState {
    consecutive_failures: u32,
    consecutive_timeouts: u32,
    /// Attempt index within the current read's retry sequence
    retry_count: u32,
    is_enabled: bool,
    disable_reason: DisableReason,
    disable_detail: String,
    disabled_at: Option<DateTime<Utc>>,
    /// Failure threshold (the device's configured `retry_count`)
    max_retries: u32,
    max_consecutive_timeouts: u32,
    last_error: Option<String>,
    metrics: HealthMetrics,
}

impl DeviceHealthState {
    pub fn new(max_retries: u32, max_consecutive_timeouts: u32) -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_timeouts: 0,
            retry_count: 0,
            is_enabled: true,
            disable_reason: DisableReason::None,
            disable_detail: String::new(),
            disabled_at: None,
            max_retries: max_retries.max(1),
            max_consecutive_timeouts: max_consecutive_timeouts.max(1),
            last_error: None,
            metrics: HealthMetrics::default(),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn disable_reason(&self) -> DisableReason {
        self.disable_reason
    }

    pub fn disable_detail(&self) -> &str {
        &self.disable_detail
    }

    pub fn disabled_at(&self) -> Option<DateTime<Utc>> {
        self.disabled_at
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_consecutive_timeouts(&self) -> u32 {
        self.max_consecutive_timeouts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.metrics
    }

    pub fn success_rate(&self) -> f64 {
        self.metrics.success_rate()
    }

    /// Pick up threshold changes from a configuration reload
    pub fn set_thresholds(&mut self, max_retries: u32, max_consecutive_timeouts: u32) {
        self.max_retries = max_retries.max(1);
        self.max_consecutive_timeouts = max_consecutive_timeouts.max(1);
    }

    /// Start the retry sequence of a new register read
    pub fn begin_read(&mut self) {
        self.retry_count = 0;
    }

    /// Count one more attempt of the current read
    pub fn begin_attempt(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    pub fn record_success(&mut self, response: Duration, now: DateTime<Utc>) {
        self.metrics.record_success(response, now);
        self.consecutive_failures = 0;
        self.consecutive_timeouts = 0;
        self.last_error = None;
    }

    /// Record a failed read and apply the disable thresholds.
    ///
    /// Returns the reason when this failure disabled the device. A device
    /// that is already disabled keeps its reason; the counters still move.
    pub fn record_failure(
        &mut self,
        kind: FailureKind,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Option<DisableReason> {
        self.metrics.record_failure(now);
        self.consecutive_failures += 1;
        if kind == FailureKind::Timeout {
            self.consecutive_timeouts += 1;
        }
        self.last_error = Some(detail.to_string());

        if !self.is_enabled {
            return None;
        }

        // a timeout streak is the more specific diagnosis when both trip
        let (reason, summary) = if self.consecutive_timeouts >= self.max_consecutive_timeouts {
            (
                DisableReason::AutoTimeout,
                format!("{} consecutive timeouts", self.consecutive_timeouts),
            )
        } else if self.consecutive_failures >= self.max_retries {
            (
                DisableReason::AutoRetry,
                format!("{} consecutive failures", self.consecutive_failures),
            )
        } else {
            return None;
        };

        self.disable(reason, format!("{} (last: {})", summary, detail), now);
        Some(reason)
    }

    /// Operator disable; overrides any automatic reason
    pub fn disable_manual(&mut self, detail: impl Into<String>, now: DateTime<Utc>) {
        self.disable(DisableReason::Manual, detail.into(), now);
    }

    fn disable(&mut self, reason: DisableReason, detail: String, now: DateTime<Utc>) {
        self.is_enabled = false;
        self.disable_reason = reason;
        self.disable_detail = detail;
        self.disabled_at = Some(now);
    }

    /// Return to service and start a fresh failure window
    pub fn enable(&mut self, clear_metrics: bool) {
        self.is_enabled = true;
        self.disable_reason = DisableReason::None;
        self.disable_detail.clear();
        self.disabled_at = None;
        self.consecutive_failures = 0;
        self.consecutive_timeouts = 0;
        self.retry_count = 0;
        if clear_metrics {
            self.reset_metrics();
        }
    }

    /// Automatic recovery: re-enable if automatically disabled for at least `cooldown`
    pub fn try_recover(&mut self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        if self.is_enabled || !self.disable_reason.is_automatic() {
            return false;
        }
        let Some(disabled_at) = self.disabled_at else {
            return false;
        };
        let elapsed = now.signed_duration_since(disabled_at).to_std().unwrap_or_default();
        if elapsed < cooldown {
            return false;
        }
        self.enable(false);
        true
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = HealthMetrics::default();
        self.last_error = None;
    }

    /// `is_enabled` and `disable_reason` agree
    pub fn is_consistent(&self) -> bool {
        if self.is_enabled {
            self.disable_reason == DisableReason::None && self.disabled_at.is_none()
        } else {
            self.disable_reason != DisableReason::None && self.disabled_at.is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).single().unwrap_or_default()
    }

    fn secs(s: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(s)
    }

    #[test]
    fn test_retry_threshold_disables_on_nth_failure() {
        let mut state = DeviceHealthState::new(3, 3);

        assert_eq!(state.record_failure(FailureKind::Exception, "0x02", t0()), None);
        assert_eq!(state.record_failure(FailureKind::Transport, "crc", t0()), None);
        assert!(state.is_enabled());

        let reason = state.record_failure(FailureKind::Exception, "0x02", secs(1));
        assert_eq!(reason, Some(DisableReason::AutoRetry));
        assert!(!state.is_enabled());
        assert_eq!(state.disabled_at(), Some(secs(1)));
        assert!(state.disable_detail().contains("3 consecutive failures"));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_timeout_threshold_wins_tie() {
        let mut state = DeviceHealthState::new(2, 2);
        state.record_failure(FailureKind::Timeout, "t", t0());

        let reason = state.record_failure(FailureKind::Timeout, "t", t0());
        assert_eq!(reason, Some(DisableReason::AutoTimeout));
        assert_eq!(state.consecutive_timeouts(), 2);
    }

    #[test]
    fn test_timeout_streak_survives_other_failures() {
        let mut state = DeviceHealthState::new(10, 3);
        state.record_failure(FailureKind::Timeout, "t", t0());
        state.record_failure(FailureKind::Transport, "io", t0());
        state.record_failure(FailureKind::Timeout, "t", t0());
        assert_eq!(state.consecutive_timeouts(), 2);

        state.record_success(Duration::from_millis(5), t0());
        assert_eq!(state.consecutive_timeouts(), 0);
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn test_failure_while_manually_disabled_keeps_reason() {
        let mut state = DeviceHealthState::new(1, 1);
        state.disable_manual("maintenance", t0());

        assert_eq!(state.record_failure(FailureKind::Timeout, "t", secs(1)), None);
        assert_eq!(state.disable_reason(), DisableReason::Manual);
        assert_eq!(state.disable_detail(), "maintenance");
        assert_eq!(state.disabled_at(), Some(t0()));
    }

    #[test]
    fn test_manual_is_never_recovered() {
        let mut state = DeviceHealthState::new(3, 3);
        state.disable_manual("operator", t0());

        assert!(!state.try_recover(secs(3600), Duration::from_secs(30)));
        assert_eq!(state.disable_reason(), DisableReason::Manual);
    }

    #[test]
    fn test_recovery_respects_cooldown() {
        let mut state = DeviceHealthState::new(1, 5);
        state.record_failure(FailureKind::Transport, "io", t0());
        assert_eq!(state.disable_reason(), DisableReason::AutoRetry);

        assert!(!state.try_recover(secs(29), Duration::from_secs(30)));
        assert!(state.try_recover(secs(31), Duration::from_secs(30)));
        assert!(state.is_enabled());
        assert_eq!(state.disable_reason(), DisableReason::None);
        assert_eq!(state.consecutive_failures(), 0);
        // metrics survive recovery
        assert_eq!(state.metrics().failed_reads, 1);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_enable_optionally_clears_metrics() {
        let mut state = DeviceHealthState::new(3, 3);
        state.record_success(Duration::from_millis(10), t0());
        state.record_failure(FailureKind::Timeout, "t", t0());
        state.disable_manual("x", t0());

        state.enable(false);
        assert_eq!(state.metrics().total_reads, 2);
        assert_eq!(state.consecutive_timeouts(), 0);

        state.disable_manual("x", t0());
        state.enable(true);
        assert_eq!(state.metrics(), &HealthMetrics::default());
    }

    #[test]
    fn test_response_statistics() {
        let mut state = DeviceHealthState::new(3, 3);
        assert_eq!(state.success_rate(), 0.0);

        state.record_success(Duration::from_millis(20), t0());
        state.record_success(Duration::from_millis(10), t0());
        state.record_success(Duration::from_millis(30), t0());
        state.record_failure(FailureKind::Exception, "x", t0());

        let metrics = state.metrics();
        assert_eq!(metrics.total_reads, 4);
        assert_eq!(metrics.min_response_ms, 10);
        assert_eq!(metrics.max_response_ms, 30);
        assert_eq!(metrics.last_response_ms, 30);
        assert!((metrics.avg_response_ms - 20.0).abs() < f64::EPSILON);
        assert!((state.success_rate() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_attempt_counter() {
        let mut state = DeviceHealthState::new(3, 3);
        state.begin_read();
        assert_eq!(state.begin_attempt(), 1);
        assert_eq!(state.begin_attempt(), 2);
        state.begin_read();
        assert_eq!(state.retry_count(), 0);
    }
}
