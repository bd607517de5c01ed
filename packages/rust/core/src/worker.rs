//! Worker coordinator: claim → run pipeline → stitch → release.
//!
//! Coordinators share nothing but the store. Any number of them, in one
//! process (see [`WorkerPool`]) or many, can drain the same queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use stitchwork_shared::{EntityId, RawEntity, Result, StitchworkError, WorkerSettings};
use stitchwork_storage::Storage;

use crate::pipeline::{Pipeline, PipelineResult, RunOutcome};
use crate::scheduler::{Claim, Release, ReleaseDecision, Scheduler};
use crate::stitch::{StitchOutcome, Stitcher};

/// Why a run's result was thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Retracted between claim and commit.
    EntityGone,
    /// Another worker (or a provider update) took over the entity.
    LeaseLost,
}

/// What one coordinator cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    /// Nothing was due.
    Idle,
    Processed {
        entity_id: EntityId,
        attempt: u32,
        outcome: RunOutcome,
        /// Canonical version committed by this cycle, if any.
        version: Option<u64>,
        decision: ReleaseDecision,
    },
    Discarded {
        entity_id: EntityId,
        reason: DiscardReason,
    },
}

/// Summary of a [`WorkerCoordinator::run_until_idle`] drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub discarded: usize,
}

impl DrainSummary {
    fn record(&mut self, report: &CycleReport) {
        match report {
            CycleReport::Idle => {}
            CycleReport::Discarded { .. } => self.discarded += 1,
            CycleReport::Processed { decision, .. } => match decision {
                ReleaseDecision::Processed => self.processed += 1,
                ReleaseDecision::Retry { .. } => self.retried += 1,
                ReleaseDecision::DeadLettered => self.dead_lettered += 1,
                ReleaseDecision::LeaseLost => self.discarded += 1,
            },
        }
    }
}

/// Per-cycle callbacks for progress display.
pub trait CycleObserver: Send + Sync {
    /// Called after a claim succeeds, before the pipeline runs.
    fn claimed(&self, worker_id: &str, entity_id: EntityId, attempt: u32);
    /// Called after every non-idle cycle.
    fn finished(&self, worker_id: &str, report: &CycleReport);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl CycleObserver for SilentObserver {
    fn claimed(&self, _worker_id: &str, _entity_id: EntityId, _attempt: u32) {}
    fn finished(&self, _worker_id: &str, _report: &CycleReport) {}
}

/// Components shared by every coordinator of a process.
#[derive(Clone)]
pub struct WorkerContext {
    pub storage: Arc<Storage>,
    pub scheduler: Arc<Scheduler>,
    pub pipeline: Arc<Pipeline>,
    pub stitcher: Arc<Stitcher>,
    pub settings: WorkerSettings,
    pub observer: Arc<dyn CycleObserver>,
}

pub struct WorkerCoordinator {
    worker_id: String,
    ctx: WorkerContext,
}

impl WorkerCoordinator {
    pub fn new(worker_id: impl Into<String>, ctx: WorkerContext) -> Self {
        Self {
            worker_id: worker_id.into(),
            ctx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One cycle: claim at most one entity and carry it through to release.
    #[instrument(skip_all, fields(worker = %self.worker_id))]
    pub async fn run_once(&self) -> Result<CycleReport> {
        let Some(claim) = self.ctx.scheduler.claim(&self.worker_id).await? else {
            return Ok(CycleReport::Idle);
        };
        self.ctx
            .observer
            .claimed(&self.worker_id, claim.entity_id, claim.attempt);

        let report = match self.process(&claim).await {
            Ok(report) => report,
            Err(e) => {
                // Lease expiry recovers the entity if this release fails too.
                let release = Release::Interrupted(format!("internal error: {e}"));
                if let Err(release_err) = self.ctx.scheduler.release(&claim, release).await {
                    error!(entity_id = %claim.entity_id, error = %release_err, "release after failure also failed");
                }
                return Err(e);
            }
        };

        self.ctx.observer.finished(&self.worker_id, &report);
        Ok(report)
    }

    async fn process(&self, claim: &Claim) -> Result<CycleReport> {
        let Some(raw) = self.ctx.storage.get_raw_entity(claim.entity_id).await? else {
            info!(entity_id = %claim.entity_id, "entity retracted before run");
            return Ok(CycleReport::Discarded {
                entity_id: claim.entity_id,
                reason: DiscardReason::EntityGone,
            });
        };

        let result = self.run_with_heartbeat(claim, Arc::new(raw)).await;
        let outcome = result.outcome();

        let version = match self
            .ctx
            .stitcher
            .stitch(claim.entity_id, &self.worker_id, &result)
            .await?
        {
            StitchOutcome::Committed(canonical) => Some(canonical.version),
            StitchOutcome::Skipped => None,
            StitchOutcome::EntityGone => {
                return Ok(CycleReport::Discarded {
                    entity_id: claim.entity_id,
                    reason: DiscardReason::EntityGone,
                });
            }
            StitchOutcome::LeaseLost => {
                return Ok(CycleReport::Discarded {
                    entity_id: claim.entity_id,
                    reason: DiscardReason::LeaseLost,
                });
            }
        };

        let release = match outcome {
            RunOutcome::Clean => Release::Success,
            RunOutcome::Partial => Release::Transient(result.error_summary()),
            RunOutcome::Fatal => Release::Fatal(result.error_summary()),
        };
        let decision = self.ctx.scheduler.release(claim, release).await?;

        Ok(CycleReport::Processed {
            entity_id: claim.entity_id,
            attempt: claim.attempt,
            outcome,
            version,
            decision,
        })
    }

    /// Run the pipeline while renewing the lease at half its duration.
    async fn run_with_heartbeat(
        &self,
        claim: &Claim,
        raw: Arc<RawEntity>,
    ) -> PipelineResult {
        let period = (self.ctx.scheduler.policy().lease / 2).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await;

        let run = self.ctx.pipeline.run(raw, claim.attempt);
        tokio::pin!(run);

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = heartbeat.tick() => match self.ctx.scheduler.renew_lease(claim).await {
                    Ok(true) => debug!(entity_id = %claim.entity_id, "lease renewed"),
                    Ok(false) => warn!(entity_id = %claim.entity_id, "lease lost mid-run"),
                    Err(e) => warn!(entity_id = %claim.entity_id, error = %e, "lease renewal failed"),
                },
            }
        }
    }

    /// Loop until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let settings = &self.ctx.settings;
        let mut idle = settings.idle_backoff;
        info!(worker = %self.worker_id, "worker started");

        while !*shutdown.borrow() {
            let delay = match self.run_once().await {
                Ok(CycleReport::Idle) => {
                    let delay = idle;
                    idle = (idle * 2).min(settings.idle_backoff_max);
                    delay
                }
                Ok(_) => {
                    idle = settings.idle_backoff;
                    continue;
                }
                Err(e) => {
                    error!(worker = %self.worker_id, error = %e, "worker cycle failed");
                    settings.store_retry
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }

    /// Cycle until nothing is due. Entities waiting on a retry backoff are left queued.
    pub async fn run_until_idle(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            let report = self.run_once().await?;
            if report == CycleReport::Idle {
                return Ok(summary);
            }
            summary.record(&report);
        }
    }
}

/// A set of coordinators running as tokio tasks.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    worker_ids: Vec<String>,
}

impl WorkerPool {
    /// Spawn `count` coordinators with ids `"{prefix}-{uuid}"`.
    pub fn spawn(ctx: WorkerContext, count: usize, prefix: &str) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(count);
        let mut worker_ids = Vec::with_capacity(count);

        for _ in 0..count {
            let worker_id = format!("{prefix}-{}", Uuid::now_v7());
            let coordinator = WorkerCoordinator::new(worker_id.clone(), ctx.clone());
            let rx = rx.clone();
            handles.push(tokio::spawn(async move { coordinator.run(rx).await }));
            worker_ids.push(worker_id);
        }

        info!(count, "worker pool started");
        Self {
            shutdown,
            handles,
            worker_ids,
        }
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Signal every coordinator and wait for in-flight cycles to finish.
    pub async fn shutdown(self) -> Result<()> {
        // Coordinators that already exited have dropped their receivers.
        self.shutdown.send_replace(true);
        for handle in self.handles {
            handle
                .await
                .map_err(|e| StitchworkError::Pipeline(format!("worker task failed: {e}")))?;
        }
        info!("worker pool stopped");
        Ok(())
    }
}
