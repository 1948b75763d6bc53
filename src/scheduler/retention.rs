//! Retention manager for pruning old check history.

use crate::db::Store;

use super::TargetRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Deletes history older than `history_retention_days`. Uptime counts are
/// preserved by the store, so pruning never changes a target's percentage.
pub struct RetentionManager {
    store: Arc<Store>,
    registry: Arc<TargetRegistry>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, registry: Arc<TargetRegistry>) -> Self {
        Self {
            store,
            registry,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the hourly pruning task.
    pub async fn start(&self) {
        let store = self.store.clone();
        let registry = self.registry.clone();

        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        *self.stop.lock().await = Some(tx);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let days = registry.snapshot().settings().history_retention_days;
                        process_retention(&store, days, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention task.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Prune once. A retention of zero days keeps everything.
fn process_retention(store: &Store, retention_days: u64, now: DateTime<Utc>) -> usize {
    if retention_days == 0 {
        return 0;
    }

    let Some(cutoff) = i64::try_from(retention_days)
        .ok()
        .and_then(ChronoDuration::try_days)
        .and_then(|keep| now.checked_sub_signed(keep))
    else {
        tracing::error!(
            "RetentionManager: history_retention_days {} is out of range, not pruning",
            retention_days
        );
        return 0;
    };
    match store.prune_history_before(cutoff) {
        Ok(0) => 0,
        Ok(deleted) => {
            tracing::info!("RetentionManager: pruned {} history rows before {}", deleted, cutoff);
            deleted
        }
        Err(e) => {
            tracing::error!("RetentionManager: failed to prune history: {}", e);
            0
        }
    }
}
