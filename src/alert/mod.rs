//! Alert dispatcher: delivers confirmed transitions to the webhook without
//! ever holding up the state machine that produced them.

mod webhook;

pub use webhook::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::db::{AlertOutcome, AlertRecord, DbError, Store};
use crate::scheduler::{MonitorHealth, TargetRegistry};

/// Maximum number of alerts being delivered at once.
const MAX_IN_FLIGHT: usize = 8;

/// Upper bound of the random jitter added to each backoff.
const JITTER_MS: u64 = 250;

/// Handle for queueing alerts. Cheap to clone.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::UnboundedSender<AlertRecord>,
}

struct DeliveryContext {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<TargetRegistry>,
    health: Arc<MonitorHealth>,
}

impl AlertDispatcher {
    /// Start the delivery worker.
    pub fn spawn(
        store: Arc<Store>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<TargetRegistry>,
        health: Arc<MonitorHealth>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(DeliveryContext {
            store,
            notifier,
            registry,
            health,
        });
        let handle = tokio::spawn(run_dispatcher(rx, ctx));
        (Self { tx }, handle)
    }

    /// Queue an alert for delivery. Never blocks.
    pub fn notify(&self, alert: AlertRecord) {
        let target = alert.target_name.clone();
        if self.tx.send(alert).is_err() {
            tracing::error!("Alert dispatcher stopped, dropping alert for {}", target);
        }
    }

    /// Re-queue alerts that were committed but never delivered.
    pub fn requeue_pending(&self, store: &Store) -> Result<usize, DbError> {
        let pending = store.pending_alerts()?;
        let count = pending.len();
        for alert in pending {
            self.notify(alert);
        }
        Ok(count)
    }
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<AlertRecord>, ctx: Arc<DeliveryContext>) {
    let semaphore = Arc::new(Semaphore::new(MAX_IN_FLIGHT));

    while let Some(alert) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            deliver(&ctx, alert).await;
        });
    }
}

async fn deliver(ctx: &DeliveryContext, alert: AlertRecord) {
    let snapshot = ctx.registry.snapshot();
    let settings = snapshot.settings();

    let Some(url) = settings.webhook_url() else {
        tracing::info!(
            "No webhook configured, {} alert for {} not sent",
            alert.kind.as_str(),
            alert.target_name
        );
        save_outcome(ctx, &alert, AlertOutcome::Skipped, 0, None);
        return;
    };

    let max_attempts = settings.alert_max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match ctx.notifier.send(url, &alert).await {
            Ok(()) => {
                tracing::info!(
                    "Delivered {} alert for {} (attempt {})",
                    alert.kind.as_str(),
                    alert.target_name,
                    attempt
                );
                save_outcome(ctx, &alert, AlertOutcome::Delivered, attempt, None);
                ctx.health.record_alert_delivered();
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "Alert for {} failed (attempt {}/{}): {}",
                    alert.target_name,
                    attempt,
                    max_attempts,
                    e
                );
                last_error = e.to_string();
                if attempt < max_attempts {
                    tokio::time::sleep(backoff_delay(settings.alert_backoff(), attempt)).await;
                }
            }
        }
    }

    tracing::error!(
        "Giving up on {} alert for {} after {} attempts: {}",
        alert.kind.as_str(),
        alert.target_name,
        max_attempts,
        last_error
    );
    save_outcome(ctx, &alert, AlertOutcome::Failed, max_attempts, Some(&last_error));
    ctx.health.record_alert_failed();
}

fn save_outcome(
    ctx: &DeliveryContext,
    alert: &AlertRecord,
    outcome: AlertOutcome,
    attempts: u32,
    error: Option<&str>,
) {
    if let Err(e) = ctx.store.update_alert_outcome(alert.id, outcome, attempts, error) {
        tracing::error!("Failed to record alert outcome for {}: {}", alert.target_name, e);
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, plus jitter when `base` is non-zero.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    let jitter = Duration::from_millis(rand::random::<u64>() % JITTER_MS);
    base.saturating_mul(factor) + jitter
}
