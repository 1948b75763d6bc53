//! Scheduler module: drives check cycles and owns the per-target workers.

mod health;
mod registry;
mod retention;
mod state;
mod worker;

pub use health::*;
pub use registry::*;
pub use retention::*;
pub use state::*;
pub use worker::*;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::db::ProbeResult;
use crate::probe::{probe_until, TIMEOUT_DETAIL};

/// Runs one check cycle per interval and keeps workers in step with the registry.
pub struct Scheduler {
    ctx: Arc<WorkerContext>,
    board: Arc<StatusBoard>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl Scheduler {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            board: Arc::new(StatusBoard::default()),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Live per-target states for the reporting layer.
    pub fn board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    /// Run until `shutdown` flips. In-flight probes are abandoned on exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut registry_rx = self.ctx.registry.subscribe();
        let mut period = self.ctx.registry.snapshot().settings().check_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cycles: JoinSet<CycleSummary> = JoinSet::new();

        tracing::info!("Starting scheduler, checking every {:?}", period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let snapshot = self.ctx.registry.snapshot();
                    self.reconcile(&snapshot).await;

                    let started_at = Utc::now();
                    let probes = self.launch_cycle(&snapshot).await;
                    tracing::info!(
                        "Starting check cycle for {} targets (generation {})",
                        probes.len(),
                        snapshot.generation
                    );
                    cycles.spawn(collect_cycle(started_at, probes));
                }
                Some(done) = cycles.join_next() => match done {
                    Ok(summary) => {
                        tracing::info!(
                            "Checks complete: {}/{} online, {} failed ({} timed out)",
                            summary.succeeded,
                            summary.total,
                            summary.failed,
                            summary.timed_out
                        );
                        self.ctx.health.record_cycle(summary);
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::error!("Check cycle task failed: {}", e),
                },
                changed = registry_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let snapshot = registry_rx.borrow_and_update().clone();
                    tracing::info!(
                        "Loaded configuration generation {} with {} targets",
                        snapshot.generation,
                        snapshot.targets().len()
                    );
                    self.reconcile(&snapshot).await;

                    let new_period = snapshot.settings().check_interval();
                    if new_period != period {
                        period = new_period;
                        ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        self.ctx.health.set_check_interval(period);
                        tracing::info!("Check interval changed to {:?}", period);
                    }
                }
            }
        }

        tracing::info!("Scheduler stopping, abandoning in-flight probes");
        cycles.shutdown().await;
        self.stop_workers().await;
    }

    /// One complete cycle against the current snapshot, waiting for it to finish.
    #[cfg(test)]
    pub async fn run_cycle(&self) -> CycleSummary {
        let snapshot = self.ctx.registry.snapshot();
        self.reconcile(&snapshot).await;

        let started_at = Utc::now();
        let probes = self.launch_cycle(&snapshot).await;
        let summary = collect_cycle(started_at, probes).await;
        self.ctx.health.record_cycle(summary.clone());
        summary
    }

    /// Start one worker per new target and retire workers of removed targets.
    pub async fn reconcile(&self, snapshot: &RegistrySnapshot) {
        let mut workers = self.workers.lock().await;

        let wanted: HashSet<&str> = snapshot.targets().iter().map(|t| t.name.as_str()).collect();
        let removed: Vec<String> = workers
            .keys()
            .filter(|name| !wanted.contains(name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            if let Some(handle) = workers.remove(&name) {
                retire_worker(handle, &self.board, &self.ctx.store).await;
            }
        }

        for target in snapshot.targets() {
            if workers.contains_key(&target.name) {
                continue;
            }
            match spawn_worker(target, self.ctx.clone(), &self.board) {
                Ok(handle) => {
                    workers.insert(target.name.clone(), handle);
                }
                Err(e) => tracing::error!("Failed to start worker for {}: {}", target.name, e),
            }
        }
    }

    /// Launch one probe per target without waiting for any of them.
    ///
    /// Each probe's eventual result is queued on its target's worker before
    /// the probe starts, which keeps results for a target in launch order
    /// even when cycles overlap.
    pub async fn launch_cycle(&self, snapshot: &RegistrySnapshot) -> JoinSet<ProbeResult> {
        let settings = Arc::new(snapshot.settings().clone());
        let deadline = Instant::now() + settings.cycle_timeout();
        let workers = self.workers.lock().await;
        let mut probes = JoinSet::new();

        for target in snapshot.targets() {
            let Some(worker) = workers.get(&target.name) else {
                continue;
            };
            let (tx, rx) = oneshot::channel();
            if !worker.enqueue(rx) {
                tracing::warn!("Worker for {} is gone, skipping probe", target.name);
                continue;
            }

            let prober = self.ctx.prober.clone();
            let target = target.clone();
            let settings = settings.clone();
            probes.spawn(async move {
                let result = probe_until(prober.as_ref(), &target, &settings, deadline).await;
                let _ = tx.send(result.clone());
                result
            });
        }

        probes
    }

    async fn stop_workers(&self) {
        let mut workers = self.workers.lock().await;
        for (_, handle) in workers.drain() {
            handle.abort();
        }
    }
}

/// Wait for a cycle's probes; each one is bounded by the cycle deadline.
pub async fn collect_cycle(started_at: DateTime<Utc>, mut probes: JoinSet<ProbeResult>) -> CycleSummary {
    let mut summary = CycleSummary {
        started_at,
        finished_at: started_at,
        total: 0,
        succeeded: 0,
        failed: 0,
        timed_out: 0,
    };

    while let Some(joined) = probes.join_next().await {
        summary.total += 1;
        match joined {
            Ok(result) if result.success => summary.succeeded += 1,
            Ok(result) => {
                summary.failed += 1;
                if result.error.as_deref() == Some(TIMEOUT_DETAIL) {
                    summary.timed_out += 1;
                }
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!("Probe task did not complete: {}", e);
            }
        }
    }

    summary.finished_at = Utc::now();
    summary
}
