//! Probe module for proxy health checks.
//!
//! A probe never fails past its boundary: every transport problem is folded
//! into a failed [`ProbeResult`] with an error detail.

mod http;

pub use http::*;

use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Settings;
use crate::db::{ProbeResult, Target};

/// Error detail recorded for probes abandoned at the cycle deadline.
pub const TIMEOUT_DETAIL: &str = "timeout";

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Performs one health check against one target.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &Target, settings: &Settings) -> ProbeResult;
}

/// Run a probe, giving up at `deadline`.
///
/// A probe still outstanding at the deadline is abandoned and recorded as a
/// failure with detail [`TIMEOUT_DETAIL`].
pub async fn probe_until(
    prober: &dyn Prober,
    target: &Target,
    settings: &Settings,
    deadline: tokio::time::Instant,
) -> ProbeResult {
    let started_at = Utc::now();
    let clock = Instant::now();

    match tokio::time::timeout_at(deadline, prober.probe(target, settings)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!("Probe for {} abandoned at cycle deadline", target.name);
            ProbeResult::failure(&target.name, started_at, clock.elapsed(), TIMEOUT_DETAIL)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted probers shared by the scheduler tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Replays a fixed sequence of outcomes per target; `None` hangs forever.
    #[derive(Default)]
    pub struct ScriptedProber {
        scripts: Mutex<HashMap<String, VecDeque<Option<bool>>>>,
    }

    impl ScriptedProber {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(self, target: &str, outcomes: &[Option<bool>]) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(target.to_string(), outcomes.iter().copied().collect());
            self
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, target: &Target, _settings: &Settings) -> ProbeResult {
            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&target.name)
                .and_then(|q| q.pop_front())
                .unwrap_or(Some(true));

            let now = Utc::now();
            match next {
                Some(true) => ProbeResult::success(
                    &target.name,
                    now,
                    Duration::from_millis(5),
                    Some("192.0.2.10".to_string()),
                ),
                Some(false) => ProbeResult::failure(
                    &target.name,
                    now,
                    Duration::from_millis(5),
                    "connection refused",
                ),
                None => std::future::pending().await,
            }
        }
    }
}
