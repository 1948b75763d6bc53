//! Webhook transport for alerts (Discord-compatible embed payload).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::db::{AlertKind, AlertRecord};

const COLOR_OFFLINE: u32 = 15158332;
const COLOR_RECOVERED: u32 = 3066993;

/// Alert delivery error types.
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("webhook returned HTTP {0}")]
    Status(u16),
}

/// Delivers one alert to an external channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, webhook_url: &str, alert: &AlertRecord) -> Result<(), AlertError>;
}

/// Posts alerts as JSON to a webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, webhook_url: &str, alert: &AlertRecord) -> Result<(), AlertError> {
        let response = self
            .client
            .post(webhook_url)
            .json(&build_payload(alert))
            .send()
            .await
            .map_err(|e| AlertError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AlertError::Status(status.as_u16()))
        }
    }
}

/// Build the notification body: target name, new status and timestamp.
pub fn build_payload(alert: &AlertRecord) -> Value {
    let (title, description, color) = match alert.kind {
        AlertKind::ConfirmedOffline => (
            "Proxy Offline",
            format!("The proxy `{}` has been confirmed to be offline.", alert.target_name),
            COLOR_OFFLINE,
        ),
        AlertKind::Recovered => (
            "Proxy Recovered",
            format!("The proxy `{}` is back online.", alert.target_name),
            COLOR_RECOVERED,
        ),
    };

    json!({
        "embeds": [{
            "title": title,
            "description": description,
            "color": color,
            "timestamp": alert.timestamp.to_rfc3339(),
            "fields": [
                { "name": "target", "value": alert.target_name, "inline": true },
                { "name": "status", "value": alert.kind.status().as_str(), "inline": true },
            ],
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AlertOutcome;
    use chrono::{TimeZone, Utc};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn alert(kind: AlertKind) -> AlertRecord {
        AlertRecord {
            id: 1,
            target_name: "fe-1".to_string(),
            kind,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap(),
            outcome: AlertOutcome::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_offline_payload() {
        let payload = build_payload(&alert(AlertKind::ConfirmedOffline));
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "Proxy Offline");
        assert_eq!(embed["color"], COLOR_OFFLINE);
        assert_eq!(embed["timestamp"], "2024-05-01T08:30:00+00:00");
        assert_eq!(embed["fields"][0]["value"], "fe-1");
        assert_eq!(embed["fields"][1]["value"], "offline");
    }

    #[test]
    fn test_recovered_payload() {
        let payload = build_payload(&alert(AlertKind::Recovered));
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "Proxy Recovered");
        assert_eq!(embed["fields"][1]["value"], "online");
        assert!(embed["description"].as_str().unwrap().contains("fe-1"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let notifier = WebhookNotifier::new(Duration::from_secs(5)).unwrap();
        let result = notifier
            .send(&format!("http://{}/hook", addr), &alert(AlertKind::Recovered))
            .await;
        assert!(matches!(result, Err(AlertError::Status(429))));
    }
}
