//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Role a monitored endpoint plays in the outproxy setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Load-balancer frontend.
    Frontend,
    /// Forward-proxy backend behind a frontend.
    Backend,
    /// End-to-end check through the path a user would take.
    UserTest,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Frontend => "frontend",
            Category::Backend => "backend",
            Category::UserTest => "user-test",
        }
    }
}

/// A monitored proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    /// Proxy URL the verification request is routed through.
    pub url: String,
    #[serde(default = "default_category")]
    pub category: Category,
}

fn default_category() -> Category {
    Category::Frontend
}

/// Outcome of a single probe attempt. Never edited once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub target_name: String,
    /// Probe start time.
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency: Duration,
    /// Egress address reported by the verification endpoint.
    pub identity: Option<String>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(
        target_name: &str,
        timestamp: DateTime<Utc>,
        latency: Duration,
        identity: Option<String>,
    ) -> Self {
        Self {
            target_name: target_name.to_string(),
            timestamp,
            success: true,
            latency,
            identity,
            error: None,
        }
    }

    pub fn failure(
        target_name: &str,
        timestamp: DateTime<Utc>,
        latency: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            target_name: target_name.to_string(),
            timestamp,
            success: false,
            latency,
            identity: None,
            error: Some(error.into()),
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Debounced health status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    /// Failed once, waiting for the retest to confirm.
    Suspect,
    Offline,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => "online",
            Status::Suspect => "suspect",
            Status::Offline => "offline",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Status::Online),
            "suspect" => Ok(Status::Suspect),
            "offline" => Ok(Status::Offline),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Per-target state owned by that target's worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetState {
    pub target_name: String,
    pub status: Status,
    pub status_changed_at: DateTime<Utc>,
    /// Start of the current online streak; `None` while Offline.
    pub online_since: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_identity: Option<String>,
    /// When the target entered Suspect.
    pub suspect_since: Option<DateTime<Utc>>,
    /// Pending retest; only set while Suspect.
    pub retest_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Uptime figures for a target, derived from the history ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UptimeAggregate {
    pub target_name: String,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub uptime_percentage: f64,
    pub streak_seconds: i64,
    /// Time of the first recorded check; `None` before any check.
    pub first_seen: Option<DateTime<Utc>>,
}

impl UptimeAggregate {
    pub fn new(target_name: &str, total_checks: i64, successful_checks: i64, streak_seconds: i64) -> Self {
        Self {
            target_name: target_name.to_string(),
            total_checks,
            successful_checks,
            uptime_percentage: uptime_percentage(total_checks, successful_checks),
            streak_seconds,
            first_seen: None,
        }
    }
}

/// Successful checks over total checks, as a percentage. Zero checks yield 0.
pub fn uptime_percentage(total_checks: i64, successful_checks: i64) -> f64 {
    if total_checks <= 0 {
        0.0
    } else {
        successful_checks as f64 / total_checks as f64 * 100.0
    }
}

/// Kind of confirmed transition that produces an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    ConfirmedOffline,
    Recovered,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ConfirmedOffline => "confirmed-offline",
            AlertKind::Recovered => "recovered",
        }
    }

    /// Status the target is in once this alert fires.
    pub fn status(&self) -> Status {
        match self {
            AlertKind::ConfirmedOffline => Status::Offline,
            AlertKind::Recovered => Status::Online,
        }
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed-offline" => Ok(AlertKind::ConfirmedOffline),
            "recovered" => Ok(AlertKind::Recovered),
            other => Err(format!("unknown alert kind: {}", other)),
        }
    }
}

/// Delivery state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertOutcome {
    Pending,
    Delivered,
    Failed,
    /// No webhook configured.
    Skipped,
}

impl AlertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertOutcome::Pending => "pending",
            AlertOutcome::Delivered => "delivered",
            AlertOutcome::Failed => "failed",
            AlertOutcome::Skipped => "skipped",
        }
    }
}

impl FromStr for AlertOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertOutcome::Pending),
            "delivered" => Ok(AlertOutcome::Delivered),
            "failed" => Ok(AlertOutcome::Failed),
            "skipped" => Ok(AlertOutcome::Skipped),
            other => Err(format!("unknown alert outcome: {}", other)),
        }
    }
}

/// Audit record of one confirmed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    pub target_name: String,
    pub kind: AlertKind,
    pub timestamp: DateTime<Utc>,
    pub outcome: AlertOutcome,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime_percentage() {
        assert_eq!(uptime_percentage(0, 0), 0.0);
        assert_eq!(uptime_percentage(4, 3), 75.0);
        assert_eq!(uptime_percentage(12, 11), 11.0 / 12.0 * 100.0);
    }

    #[test]
    fn test_category_serde() {
        let target: Target =
            serde_json::from_str(r#"{"name":"u","url":"http://127.0.0.1:4444","category":"user-test"}"#)
                .unwrap();
        assert_eq!(target.category, Category::UserTest);

        let defaulted: Target = serde_json::from_str(r#"{"name":"f","url":"http://x:1"}"#).unwrap();
        assert_eq!(defaulted.category, Category::Frontend);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [Status::Online, Status::Suspect, Status::Offline] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("down".parse::<Status>().is_err());
    }
}
