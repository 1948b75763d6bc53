//! Health of the monitor itself, kept apart from the health of its targets.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Outcome counts of one check cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Subset of `failed` abandoned at the cycle deadline.
    pub timed_out: usize,
}

/// Why the monitor considers itself degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    /// No cycle finished within two check intervals.
    Stalled,
    /// The ledger rejected the most recent write.
    PersistenceFailing,
    /// Every probe of the last cycle failed; the monitor's own egress is suspect.
    AllProbesFailing,
    /// The most recent alert could not be delivered.
    AlertDeliveryFailing,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub reasons: Vec<DegradedReason>,
    pub started_at: DateTime<Utc>,
    pub last_cycle: Option<CycleSummary>,
    pub persistence_failures: u64,
    pub alert_failures: u64,
}

#[derive(Debug, Default)]
struct WriteMarks {
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

/// Shared, lock-light health counters updated by the scheduler, the target
/// workers and the alert dispatcher.
#[derive(Debug)]
pub struct MonitorHealth {
    started_at: DateTime<Utc>,
    check_interval_secs: AtomicU64,
    last_cycle: Mutex<Option<CycleSummary>>,
    writes: Mutex<WriteMarks>,
    persistence_failures: AtomicU64,
    alert_failures: AtomicU64,
    last_alert_failed: AtomicBool,
}

impl MonitorHealth {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            started_at: Utc::now(),
            check_interval_secs: AtomicU64::new(check_interval.as_secs()),
            last_cycle: Mutex::new(None),
            writes: Mutex::new(WriteMarks::default()),
            persistence_failures: AtomicU64::new(0),
            alert_failures: AtomicU64::new(0),
            last_alert_failed: AtomicBool::new(false),
        }
    }

    pub fn set_check_interval(&self, interval: Duration) {
        self.check_interval_secs.store(interval.as_secs(), Ordering::Relaxed);
    }

    pub fn record_cycle(&self, summary: CycleSummary) {
        *self.last_cycle.lock().unwrap_or_else(|p| p.into_inner()) = Some(summary);
    }

    pub fn record_write_ok(&self, at: DateTime<Utc>) {
        self.writes.lock().unwrap_or_else(|p| p.into_inner()).last_success = Some(at);
    }

    pub fn record_write_failure(&self, at: DateTime<Utc>) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        self.writes.lock().unwrap_or_else(|p| p.into_inner()).last_failure = Some(at);
    }

    pub fn record_alert_delivered(&self) {
        self.last_alert_failed.store(false, Ordering::Relaxed);
    }

    pub fn record_alert_failed(&self) {
        self.alert_failures.fetch_add(1, Ordering::Relaxed);
        self.last_alert_failed.store(true, Ordering::Relaxed);
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn report(&self, now: DateTime<Utc>) -> HealthReport {
        let last_cycle = self.last_cycle();
        let mut reasons = Vec::new();

        let interval = self.check_interval_secs.load(Ordering::Relaxed);
        let stall_after = i64::try_from(interval.saturating_mul(2))
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX);
        let since = last_cycle.as_ref().map(|c| c.finished_at).unwrap_or(self.started_at);
        if now - since > stall_after {
            reasons.push(DegradedReason::Stalled);
        }

        {
            let writes = self.writes.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(failed_at) = writes.last_failure {
                if writes.last_success.map_or(true, |ok_at| ok_at < failed_at) {
                    reasons.push(DegradedReason::PersistenceFailing);
                }
            }
        }

        if let Some(cycle) = &last_cycle {
            if cycle.total > 1 && cycle.succeeded == 0 {
                reasons.push(DegradedReason::AllProbesFailing);
            }
        }

        if self.last_alert_failed.load(Ordering::Relaxed) {
            reasons.push(DegradedReason::AlertDeliveryFailing);
        }

        HealthReport {
            healthy: reasons.is_empty(),
            reasons,
            started_at: self.started_at,
            last_cycle,
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
        }
    }
}
