//! Debounced online/offline state machine for a single target.
//!
//! | Current | Result  | Next    | Alert             |
//! |---------|---------|---------|-------------------|
//! | Online  | success | Online  |                   |
//! | Online  | failure | Suspect |                   |
//! | Suspect | success | Online  |                   |
//! | Suspect | failure | Suspect | before `retest_at`|
//! | Suspect | failure | Offline | confirmed-offline |
//! | Offline | success | Online  | recovered         |
//! | Offline | failure | Offline |                   |
//!
//! Transitions are keyed on the probe timestamp, never on the wall clock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::db::{AlertKind, ProbeResult, Status, TargetState};

/// Result of applying one probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Status,
    pub to: Status,
    pub alert: Option<AlertKind>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

impl TargetState {
    /// Fresh state for a newly registered target: optimistically Online.
    pub fn new(target_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            target_name: target_name.to_string(),
            status: Status::Online,
            status_changed_at: now,
            online_since: Some(now),
            last_checked_at: None,
            last_identity: None,
            suspect_since: None,
            retest_at: None,
            consecutive_failures: 0,
        }
    }

    /// Apply one probe result. Total over every (status, result) pair.
    pub fn apply(&mut self, result: &ProbeResult, retest_delay: Duration) -> Transition {
        let now = result.timestamp;
        let from = self.status;

        self.last_checked_at = Some(now);
        if result.success {
            self.consecutive_failures = 0;
            if result.identity.is_some() {
                self.last_identity = result.identity.clone();
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        let (to, alert) = match (from, result.success) {
            (Status::Online, true) => (Status::Online, None),
            (Status::Online, false) => {
                self.suspect_since = Some(now);
                self.retest_at = Some(retest_deadline(now, retest_delay));
                (Status::Suspect, None)
            }
            (Status::Suspect, true) => {
                self.clear_retest();
                (Status::Online, None)
            }
            (Status::Suspect, false) => match self.retest_at {
                Some(retest_at) if now < retest_at => (Status::Suspect, None),
                _ => {
                    self.clear_retest();
                    self.online_since = None;
                    (Status::Offline, Some(AlertKind::ConfirmedOffline))
                }
            },
            (Status::Offline, true) => {
                self.online_since = Some(now);
                (Status::Online, Some(AlertKind::Recovered))
            }
            (Status::Offline, false) => (Status::Offline, None),
        };

        if to != from {
            self.status = to;
            self.status_changed_at = now;
        }

        Transition { from, to, alert }
    }

    /// Seconds of continuous uptime as of `now`; zero while Offline.
    pub fn streak_seconds(&self, now: DateTime<Utc>) -> i64 {
        match (self.status, self.online_since) {
            (Status::Offline, _) | (_, None) => 0,
            (_, Some(since)) => (now - since).num_seconds().max(0),
        }
    }

    fn clear_retest(&mut self) {
        self.suspect_since = None;
        self.retest_at = None;
    }
}

fn retest_deadline(from: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(delay)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RETEST: Duration = Duration::from_secs(30);

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn ok(at: i64) -> ProbeResult {
        ProbeResult::success("x", t(at), Duration::from_millis(80), Some("192.0.2.1".into()))
    }

    fn fail(at: i64) -> ProbeResult {
        ProbeResult::failure("x", t(at), Duration::from_millis(80), "connection refused")
    }

    fn state_in(status: Status) -> TargetState {
        let mut state = TargetState::new("x", t(-1000));
        match status {
            Status::Online => {}
            Status::Suspect => {
                state.apply(&fail(-10), RETEST);
            }
            Status::Offline => {
                state.apply(&fail(-100), RETEST);
                state.apply(&fail(-50), RETEST);
            }
        }
        assert_eq!(state.status, status);
        state
    }

    #[test]
    fn test_new_target_is_online() {
        let state = TargetState::new("x", t(0));
        assert_eq!(state.status, Status::Online);
        assert_eq!(state.online_since, Some(t(0)));
        assert_eq!(state.retest_at, None);
    }

    #[test]
    fn test_single_failure_only_suspects() {
        let mut state = state_in(Status::Online);
        let tr = state.apply(&fail(0), RETEST);

        assert_eq!(tr, Transition { from: Status::Online, to: Status::Suspect, alert: None });
        assert_eq!(state.suspect_since, Some(t(0)));
        assert_eq!(state.retest_at, Some(t(30)));
        // Streak keeps running while merely suspect.
        assert_eq!(state.online_since, Some(t(-1000)));
    }

    #[test]
    fn test_every_pair_of_the_table() {
        let cases = [
            (Status::Online, true, Status::Online, None),
            (Status::Online, false, Status::Suspect, None),
            (Status::Suspect, true, Status::Online, None),
            (Status::Offline, true, Status::Online, Some(AlertKind::Recovered)),
            (Status::Offline, false, Status::Offline, None),
        ];

        for (from, success, to, alert) in cases {
            let mut state = state_in(from);
            let result = if success { ok(100) } else { fail(100) };
            let tr = state.apply(&result, RETEST);
            assert_eq!((tr.from, tr.to, tr.alert), (from, to, alert), "{:?} + {}", from, success);
            assert_eq!(state.status, to);
            assert_eq!(state.last_checked_at, Some(t(100)));
        }
    }

    #[test]
    fn test_suspect_failure_before_retest_window_stays_suspect() {
        let mut state = state_in(Status::Online);
        state.apply(&fail(0), RETEST);

        let tr = state.apply(&fail(29), RETEST);
        assert_eq!(tr.to, Status::Suspect);
        assert_eq!(tr.alert, None);
        // The retest window is anchored to the first failure.
        assert_eq!(state.retest_at, Some(t(30)));
    }

    #[test]
    fn test_suspect_failure_at_retest_time_confirms_offline() {
        let mut state = state_in(Status::Online);
        state.apply(&fail(0), RETEST);

        let tr = state.apply(&fail(30), RETEST);
        assert_eq!(tr.to, Status::Offline);
        assert_eq!(tr.alert, Some(AlertKind::ConfirmedOffline));
        assert_eq!(state.online_since, None);
        assert_eq!(state.retest_at, None);
        assert_eq!(state.streak_seconds(t(100)), 0);
    }

    #[test]
    fn test_flap_scenario_produces_no_alert() {
        let mut state = TargetState::new("x", t(0));
        let mut statuses = Vec::new();
        let mut alerts = 0;

        for i in 0..10 {
            let tr = state.apply(&ok(i * 10), RETEST);
            statuses.push(tr.to);
            alerts += tr.alert.is_some() as usize;
        }
        let tr = state.apply(&fail(100), RETEST);
        statuses.push(tr.to);
        alerts += tr.alert.is_some() as usize;
        let tr = state.apply(&ok(110), RETEST);
        statuses.push(tr.to);
        alerts += tr.alert.is_some() as usize;

        let mut expected = vec![Status::Online; 10];
        expected.push(Status::Suspect);
        expected.push(Status::Online);
        assert_eq!(statuses, expected);
        assert_eq!(alerts, 0);
    }

    #[test]
    fn test_confirmed_outage_alerts_exactly_once() {
        let mut state = TargetState::new("y", t(-60));

        assert_eq!(state.apply(&fail(0), RETEST).to, Status::Suspect);
        let tr = state.apply(&fail(45), RETEST);
        assert_eq!(tr.to, Status::Offline);
        assert_eq!(tr.alert, Some(AlertKind::ConfirmedOffline));
        assert_eq!(state.status_changed_at, t(45));

        let repeats: Vec<_> = (1..=5).map(|i| state.apply(&fail(45 + i * 60), RETEST)).collect();
        assert!(repeats.iter().all(|tr| tr.to == Status::Offline && tr.alert.is_none()));
        assert_eq!(state.consecutive_failures, 7);
    }

    #[test]
    fn test_recovery_resets_streak_start() {
        let mut state = state_in(Status::Offline);

        let tr = state.apply(&ok(500), RETEST);
        assert_eq!(tr.alert, Some(AlertKind::Recovered));
        assert_eq!(state.status, Status::Online);
        assert_eq!(state.online_since, Some(t(500)));
        assert_eq!(state.streak_seconds(t(560)), 60);
        assert_eq!(state.last_identity.as_deref(), Some("192.0.2.1"));
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_zero_retest_delay_confirms_on_second_failure() {
        let mut state = TargetState::new("x", t(0));
        assert_eq!(state.apply(&fail(1), Duration::ZERO).to, Status::Suspect);
        assert_eq!(state.apply(&fail(1), Duration::ZERO).to, Status::Offline);
    }
}
