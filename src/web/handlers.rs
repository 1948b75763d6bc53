//! HTTP request handlers.

use super::AppState;
use crate::db::{AlertRecord, ProbeResult};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_HISTORY_LIMIT: usize = 1000;
const DEFAULT_ALERT_LIMIT: i64 = 50;

// ============================================================================
// API: Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiTargetStatus {
    pub name: String,
    pub category: &'static str,
    pub status: &'static str,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_ip: Option<String>,
    pub uptime_percentage: f64,
    pub uptime_duration_seconds: i64,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub first_seen: Option<DateTime<Utc>>,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let now = Utc::now();
    let mut statuses = Vec::with_capacity(snapshot.targets().len());

    for target in snapshot.targets() {
        // Worker not started yet; nothing to report for this target.
        let Some(current) = state.board.get(&target.name) else {
            continue;
        };
        let uptime = match state.store.uptime(&target.name, current.streak_seconds(now)) {
            Ok(u) => u,
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        };

        statuses.push(ApiTargetStatus {
            name: target.name.clone(),
            category: target.category.as_str(),
            status: current.status.as_str(),
            last_checked: current.last_checked_at,
            last_ip: current.last_identity,
            uptime_percentage: round2(uptime.uptime_percentage),
            uptime_duration_seconds: uptime.streak_seconds,
            total_checks: uptime.total_checks,
            successful_checks: uptime.successful_checks,
            first_seen: uptime.first_seen,
        });
    }

    Json(statuses).into_response()
}

fn round2(f: f64) -> f64 {
    (f * 100.0).round() / 100.0
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ApiCheck {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: f64,
    pub ip_address: Option<String>,
    pub error: Option<String>,
}

impl From<ProbeResult> for ApiCheck {
    fn from(r: ProbeResult) -> Self {
        Self {
            timestamp: r.timestamp,
            success: r.success,
            response_time_ms: r.latency_ms(),
            ip_address: r.identity,
            error: r.error,
        }
    }
}

pub async fn handle_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    if state.registry.snapshot().target(&name).is_none() {
        return (StatusCode::NOT_FOUND, "Target not found").into_response();
    }

    let end = match parse_bound(query.end.as_deref()) {
        Ok(t) => t.unwrap_or_else(Utc::now),
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    let start = match parse_bound(query.start.as_deref()) {
        Ok(t) => t.unwrap_or_else(|| end - ChronoDuration::hours(24)),
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);

    let iter = match state.store.history(&name, start, end) {
        Ok(it) => it,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    match iter.take(limit).collect::<Result<Vec<_>, _>>() {
        Ok(rows) => Json(rows.into_iter().map(ApiCheck::from).collect::<Vec<_>>()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn parse_bound(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| format!("invalid time '{}': {}", s, e)),
    }
}

// ============================================================================
// API: Alerts & Health
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<i64>,
}

pub async fn handle_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_ALERT_LIMIT).max(0);
    match state.store.recent_alerts(limit) {
        Ok(alerts) => Json::<Vec<AlertRecord>>(alerts).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.report(Utc::now());
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::db::{Store, TargetState};
    use crate::scheduler::{MonitorHealth, StatusBoard, TargetRegistry};
    use axum::body::to_bytes;
    use axum::response::Response;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
        [settings]
        check_interval_seconds = 60
        retest_delay_seconds = 30
        verification_url = "https://api.ipify.org?format=json"

        [[targets]]
        name = "fe-1"
        url = "http://127.0.0.1:3128"
    "#;

    fn app_state(tmp: &NamedTempFile) -> AppState {
        let cfg = MonitorConfig::from_toml(CONFIG).unwrap();
        AppState {
            registry: Arc::new(TargetRegistry::new(cfg).unwrap()),
            store: Arc::new(Store::new(tmp.path()).unwrap()),
            board: Arc::new(StatusBoard::default()),
            health: Arc::new(MonitorHealth::new(Duration::from_secs(60))),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_history_unknown_target_is_404() {
        let tmp = NamedTempFile::new().unwrap();
        let state = app_state(&tmp);
        let query = HistoryQuery { start: None, end: None, limit: None };

        let response = handle_history(State(state), Path("nope".to_string()), Query(query))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_returns_checks_in_order_with_limit() {
        let tmp = NamedTempFile::new().unwrap();
        let state = app_state(&tmp);
        let t0 = Utc::now() - ChronoDuration::minutes(10);

        let mut target_state = TargetState::new("fe-1", t0);
        for i in 0..3 {
            let at = t0 + ChronoDuration::minutes(i);
            let result = ProbeResult::success("fe-1", at, Duration::from_millis(40), Some("198.51.100.4".into()));
            target_state.apply(&result, Duration::from_secs(30));
            state.store.record_check(&result, &target_state, None).unwrap();
        }

        let query = HistoryQuery { start: None, end: None, limit: Some(2) };
        let response = handle_history(State(state), Path("fe-1".to_string()), Query(query))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let rows = body_json(response).await;
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["ip_address"], "198.51.100.4");
        assert!(rows[0]["timestamp"].as_str().unwrap() < rows[1]["timestamp"].as_str().unwrap());
    }

    #[tokio::test]
    async fn test_history_rejects_bad_bounds() {
        let tmp = NamedTempFile::new().unwrap();
        let state = app_state(&tmp);
        let query = HistoryQuery { start: Some("yesterday".into()), end: None, limit: None };

        let response = handle_history(State(state), Path("fe-1".to_string()), Query(query))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_503_when_degraded() {
        let tmp = NamedTempFile::new().unwrap();
        let state = app_state(&tmp);

        let response = handle_health(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state.health.record_alert_failed();
        let response = handle_health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["reasons"][0], "alert_delivery_failing");
    }

    #[tokio::test]
    async fn test_status_skips_targets_without_a_worker() {
        let tmp = NamedTempFile::new().unwrap();
        let state = app_state(&tmp);

        let response = handle_status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_status_reports_live_state_and_ledger_counts() {
        let tmp = NamedTempFile::new().unwrap();
        let state = app_state(&tmp);
        let first = Utc::now() - ChronoDuration::minutes(30);

        let mut target_state = TargetState::new("fe-1", first);
        for i in 0..3 {
            let at = first + ChronoDuration::minutes(i * 10);
            let result = if i == 1 {
                ProbeResult::failure("fe-1", at, Duration::from_secs(30), "timeout")
            } else {
                ProbeResult::success("fe-1", at, Duration::from_millis(40), Some("198.51.100.4".into()))
            };
            target_state.apply(&result, Duration::from_secs(30));
            state.store.record_check(&result, &target_state, None).unwrap();
        }
        let (_publish, live) = tokio::sync::watch::channel(target_state);
        state.board.insert("fe-1", live);

        let response = handle_status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let entry = &body[0];
        assert_eq!(entry["name"], "fe-1");
        assert_eq!(entry["status"], "online");
        assert_eq!(entry["last_ip"], "198.51.100.4");
        assert_eq!(entry["total_checks"], 3);
        assert_eq!(entry["successful_checks"], 2);
        assert_eq!(entry["uptime_percentage"], 66.67);

        let first_seen: DateTime<Utc> = serde_json::from_value(entry["first_seen"].clone()).unwrap();
        assert!((first_seen - first).num_milliseconds().abs() < 1);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(91.666_666), 91.67);
        assert_eq!(round2(0.0), 0.0);
    }
}
