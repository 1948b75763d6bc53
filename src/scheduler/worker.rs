//! Per-target workers.
//!
//! Each registered target gets one task that exclusively owns its
//! [`TargetState`]. Probe results reach it through an inbox of one-shot
//! receivers queued in launch order, so results for a target are applied
//! strictly one at a time and in order, while different targets never
//! contend on a shared lock.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::alert::AlertDispatcher;
use crate::db::{DbError, ProbeResult, Status, Store, Target, TargetState};
use crate::probe::{probe_until, Prober};

use super::{MonitorHealth, TargetRegistry};

/// Results kept for re-application while the ledger rejects writes.
const MAX_BACKLOG: usize = 16;

/// Grace added to the retest timer so the retest probe is stamped at or
/// after `retest_at`.
const RETEST_SLACK: Duration = Duration::from_millis(100);

/// Cap on the retest timer; a longer delay is re-armed after it fires.
const MAX_RETEST_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Shared dependencies of all workers.
pub struct WorkerContext {
    pub store: Arc<Store>,
    pub registry: Arc<TargetRegistry>,
    pub prober: Arc<dyn Prober>,
    pub alerts: AlertDispatcher,
    pub health: Arc<MonitorHealth>,
}

/// Read-only view of every worker's latest published state.
///
/// The map itself only changes when targets are added or removed; workers
/// publish through their own `watch` channel.
#[derive(Default)]
pub struct StatusBoard {
    entries: RwLock<HashMap<String, watch::Receiver<TargetState>>>,
}

impl StatusBoard {
    pub fn get(&self, name: &str) -> Option<TargetState> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.get(name).map(|rx| rx.borrow().clone())
    }

    pub(crate) fn insert(&self, name: &str, rx: watch::Receiver<TargetState>) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(name.to_string(), rx);
    }

    fn remove(&self, name: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.remove(name);
    }
}

/// Scheduler-side handle to a running worker.
pub struct WorkerHandle {
    name: String,
    inbox: mpsc::UnboundedSender<oneshot::Receiver<ProbeResult>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Queue the pending result of a launched probe. Returns false if the
    /// worker has stopped.
    pub fn enqueue(&self, result: oneshot::Receiver<ProbeResult>) -> bool {
        self.inbox.send(result).is_ok()
    }

    /// Stop the worker and forget the target's state.
    ///
    /// Queued results and any pending retest are dropped. The worker only
    /// suspends between writes, so aborting it never leaves a partial write.
    pub async fn retire(self, store: &Store) {
        self.task.abort();
        let _ = self.task.await;
        if let Err(e) = store.delete_target_state(&self.name) {
            tracing::error!("Failed to delete state of removed target {}: {}", self.name, e);
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start a worker for `target`, resuming from its persisted state if any.
pub fn spawn_worker(
    target: &Target,
    ctx: Arc<WorkerContext>,
    board: &StatusBoard,
) -> Result<WorkerHandle, DbError> {
    let state = match ctx.store.load_target_state(&target.name)? {
        Some(state) => {
            tracing::info!("Resuming {} as {}", target.name, state.status);
            state
        }
        None => {
            let state = TargetState::new(&target.name, Utc::now());
            ctx.store.save_target_state(&state)?;
            tracing::info!("Monitoring new target {} ({})", target.name, target.category.as_str());
            state
        }
    };

    let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    board.insert(&target.name, snapshot_rx);

    let worker = TargetWorker {
        name: target.name.clone(),
        state,
        ctx,
        snapshot_tx,
        backlog: VecDeque::new(),
        retested_for: None,
    };
    let task = tokio::spawn(worker.run(inbox_rx));

    Ok(WorkerHandle {
        name: target.name.clone(),
        inbox: inbox_tx,
        task,
    })
}

/// Drop a target from the board and stop its worker.
pub async fn retire_worker(handle: WorkerHandle, board: &StatusBoard, store: &Store) {
    board.remove(&handle.name);
    tracing::info!("Stopped monitoring {}", handle.name);
    handle.retire(store).await;
}

struct TargetWorker {
    name: String,
    state: TargetState,
    ctx: Arc<WorkerContext>,
    snapshot_tx: watch::Sender<TargetState>,
    backlog: VecDeque<ProbeResult>,
    /// Retest deadline already probed for, so it fires once.
    retested_for: Option<DateTime<Utc>>,
}

impl TargetWorker {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<oneshot::Receiver<ProbeResult>>) {
        loop {
            let retest = self.retest_instant();

            tokio::select! {
                biased;
                next = inbox.recv() => match next {
                    Some(pending) => match pending.await {
                        Ok(result) => self.handle(result),
                        Err(_) => tracing::debug!("Probe for {} abandoned, result discarded", self.name),
                    },
                    None => break,
                },
                _ = sleep_until(retest) => self.retest().await,
            }
        }
    }

    fn retest_instant(&self) -> Option<Instant> {
        if self.state.status != Status::Suspect {
            return None;
        }
        let retest_at = self.state.retest_at?;
        if self.retested_for == Some(retest_at) {
            return None;
        }
        let wait = (retest_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_RETEST_WAIT);
        Some(Instant::now() + wait + RETEST_SLACK)
    }

    /// Out-of-cycle confirmation probe for a suspect target.
    async fn retest(&mut self) {
        let Some(retest_at) = self.state.retest_at else {
            return;
        };
        if Utc::now() < retest_at {
            return;
        }
        self.retested_for = Some(retest_at);

        let snapshot = self.ctx.registry.snapshot();
        let Some(target) = snapshot.target(&self.name) else {
            return;
        };
        let settings = snapshot.settings();

        tracing::info!("Retesting {}", self.name);
        let deadline = Instant::now() + settings.probe_timeout() + RETEST_SLACK;
        let result = probe_until(self.ctx.prober.as_ref(), target, settings, deadline).await;
        self.handle(result);
    }

    fn handle(&mut self, result: ProbeResult) {
        self.backlog.push_back(result);
        if self.backlog.len() > MAX_BACKLOG {
            if let Some(dropped) = self.backlog.pop_front() {
                tracing::warn!(
                    "Backlog for {} full, dropping unrecorded result from {}",
                    self.name,
                    dropped.timestamp
                );
            }
        }

        while let Some(next) = self.backlog.front().cloned() {
            match self.apply(&next) {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to record check for {} ({} pending): {}",
                        self.name,
                        self.backlog.len(),
                        e
                    );
                    self.ctx.health.record_write_failure(Utc::now());
                    break;
                }
            }
        }
    }

    /// Transition, persist, then commit in memory. Nothing is published or
    /// alerted unless the ledger accepted the write.
    fn apply(&mut self, result: &ProbeResult) -> Result<(), DbError> {
        let retest_delay = self.ctx.registry.snapshot().settings().retest_delay();

        let mut next = self.state.clone();
        let transition = next.apply(result, retest_delay);
        let alert = self.ctx.store.record_check(result, &next, transition.alert)?;

        self.state = next;
        self.ctx.health.record_write_ok(Utc::now());

        if transition.changed() {
            match transition.to {
                Status::Suspect => tracing::warn!(
                    "Potential issue with {}: {}; retest at {:?}",
                    self.name,
                    result.error.as_deref().unwrap_or("failed"),
                    self.state.retest_at
                ),
                Status::Offline => tracing::info!("CONFIRMED: {} is offline", self.name),
                Status::Online if transition.from == Status::Offline => {
                    tracing::info!("RECOVERY: {} is back online", self.name)
                }
                Status::Online => tracing::info!("{} passed before retest, failure was transient", self.name),
            }
        }

        self.snapshot_tx.send_replace(self.state.clone());

        if let Some(alert) = alert {
            self.ctx.alerts.notify(alert);
        }
        Ok(())
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
