//! HTTP proxy probe: fetch the verification endpoint through the target proxy.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::{Duration, Instant};

use super::{ProbeError, Prober};
use crate::config::Settings;
use crate::db::{ProbeResult, Target};

#[derive(Debug, Deserialize)]
struct WhoAmI {
    ip: Option<String>,
}

/// Probes a forward proxy by routing a "what is my IP" request through it.
#[derive(Debug, Default, Clone)]
pub struct HttpProxyProber;

impl HttpProxyProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for HttpProxyProber {
    async fn probe(&self, target: &Target, settings: &Settings) -> ProbeResult {
        // Spread probe starts to avoid a burst of simultaneous connections
        let jitter = rand::random::<u64>() % 100;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let started_at = Utc::now();
        let clock = Instant::now();
        let timeout = settings.probe_timeout();

        match run_proxy_probe(&target.url, &settings.verification_url, timeout).await {
            Ok(identity) => {
                tracing::debug!("Probe for {} succeeded via {:?}", target.name, identity);
                ProbeResult::success(&target.name, started_at, clock.elapsed(), identity)
            }
            Err(e) => {
                tracing::debug!("Probe for {} failed: {}", target.name, e);
                ProbeResult::failure(&target.name, started_at, clock.elapsed(), e.to_string())
            }
        }
    }
}

/// Fetch `verification_url` through the proxy at `proxy_url`.
///
/// Returns the egress address reported by the verification endpoint, if any.
pub async fn run_proxy_probe(
    proxy_url: &str,
    verification_url: &str,
    timeout: Duration,
) -> Result<Option<String>, ProbeError> {
    let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| ProbeError::Config(e.to_string()))?;

    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let response = client.get(verification_url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }

    // Read the full body so latency covers the complete transfer
    let body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    parse_identity(&body)
}

/// Extract the egress address from a JSON verification response body.
///
/// A body that is not JSON means something other than the verification
/// endpoint answered (a captive portal or proxy error page).
fn parse_identity(body: &[u8]) -> Result<Option<String>, ProbeError> {
    serde_json::from_slice::<WhoAmI>(body)
        .map(|who| who.ip)
        .map_err(|e| ProbeError::Malformed(format!("expected JSON from verification endpoint: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal proxy that answers every request with a canned response.
    async fn fake_proxy(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_parse_identity() {
        assert_eq!(
            parse_identity(br#"{"ip":"203.0.113.5"}"#).unwrap(),
            Some("203.0.113.5".to_string())
        );
        assert_eq!(parse_identity(br#"{"origin":"x"}"#).unwrap(), None);
        assert!(matches!(parse_identity(b"198.51.100.1\n"), Err(ProbeError::Malformed(_))));
        assert!(matches!(parse_identity(b"<html>blocked</html>"), Err(ProbeError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_proxy_probe_rejects_non_json_body() {
        let proxy = fake_proxy("200 OK", "<html>Please log in</html>").await;
        let result = run_proxy_probe(&proxy, "http://verify.invalid/", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ProbeError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_proxy_probe_reports_identity() {
        let proxy = fake_proxy("200 OK", r#"{"ip":"203.0.113.5"}"#).await;
        let identity = run_proxy_probe(&proxy, "http://verify.invalid/", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(identity.as_deref(), Some("203.0.113.5"));
    }

    #[tokio::test]
    async fn test_proxy_probe_rejects_error_status() {
        let proxy = fake_proxy("502 Bad Gateway", "{}").await;
        let result = run_proxy_probe(&proxy, "http://verify.invalid/", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ProbeError::Status(502))));
    }

    #[tokio::test]
    async fn test_proxy_probe_unreachable_proxy() {
        let result = run_proxy_probe(
            "http://127.0.0.1:1",
            "http://verify.invalid/",
            Duration::from_millis(500),
        )
        .await;
        assert!(result.is_err());
    }
}
