//! Facade wiring every component from one [`AppConfig`].

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use stitchwork_shared::{
    AppConfig, CanonicalEntity, EntityId, IntakeConfig, ProcessingState, Result,
    SchedulerPolicy, StitchworkError, WorkerSettings, validate_config,
};
use stitchwork_storage::Storage;

use crate::builtin;
use crate::intake::{EmitReceipt, Intake};
use crate::pipeline::{Pipeline, PipelineBuilder, Processor};
use crate::scheduler::Scheduler;
use crate::stitch::Stitcher;
use crate::worker::{
    CycleObserver, DrainSummary, SilentObserver, WorkerContext, WorkerCoordinator, WorkerPool,
};

/// One process's view of the orchestrator: intake, read contract and workers.
pub struct Orchestrator {
    storage: Arc<Storage>,
    intake: Intake,
    scheduler: Arc<Scheduler>,
    stitcher: Arc<Stitcher>,
    pipeline: Arc<Pipeline>,
    settings: WorkerSettings,
}

impl Orchestrator {
    /// Open the database at `db_path` and assemble the pipeline from `config`.
    ///
    /// `processors` are registered after the built-in ones declared in config.
    pub async fn open(
        config: &AppConfig,
        db_path: &Path,
        processors: Vec<Arc<dyn Processor>>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::open(db_path).await?);
        Self::new(storage, config, processors)
    }

    pub fn new(
        storage: Arc<Storage>,
        config: &AppConfig,
        processors: Vec<Arc<dyn Processor>>,
    ) -> Result<Self> {
        validate_config(config)?;
        let settings = WorkerSettings::from(config);
        let pipeline = PipelineBuilder::new(config.pipeline.stages.iter().cloned())
            .processors(builtin::from_config(&config.pipeline.processors))
            .processors(processors)
            .timeout(settings.processor_timeout)
            .build()?;

        info!(
            stages = config.pipeline.stages.len(),
            processors = pipeline.processor_count(),
            "pipeline assembled"
        );

        Ok(Self {
            intake: Intake::new(storage.clone(), IntakeConfig::from(config)),
            scheduler: Arc::new(Scheduler::new(storage.clone(), SchedulerPolicy::from(config))),
            stitcher: Arc::new(Stitcher::new(storage.clone())),
            pipeline: Arc::new(pipeline),
            storage,
            settings,
        })
    }

    pub async fn emit(
        &self,
        provider_id: &str,
        external_id: &str,
        payload: &Value,
    ) -> Result<EmitReceipt> {
        self.intake.emit(provider_id, external_id, payload).await
    }

    pub async fn retract(&self, provider_id: &str, external_id: &str) -> Result<EntityId> {
        self.intake.retract(provider_id, external_id).await
    }

    /// Committed canonical state, or `NotFound` before the first successful stitch.
    pub async fn get_canonical(&self, entity_id: EntityId) -> Result<CanonicalEntity> {
        self.storage
            .get_canonical(entity_id)
            .await?
            .ok_or_else(|| StitchworkError::not_found(format!("canonical entity {entity_id}")))
    }

    pub async fn get_processing_status(&self, entity_id: EntityId) -> Result<ProcessingState> {
        self.scheduler.status(entity_id).await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn worker_context(&self, observer: Arc<dyn CycleObserver>) -> WorkerContext {
        WorkerContext {
            storage: self.storage.clone(),
            scheduler: self.scheduler.clone(),
            pipeline: self.pipeline.clone(),
            stitcher: self.stitcher.clone(),
            settings: self.settings.clone(),
            observer,
        }
    }

    pub fn worker(&self, worker_id: impl Into<String>) -> WorkerCoordinator {
        WorkerCoordinator::new(worker_id, self.worker_context(Arc::new(SilentObserver)))
    }

    /// Start `count` background coordinators.
    pub fn spawn_workers(
        &self,
        count: usize,
        prefix: &str,
        observer: Arc<dyn CycleObserver>,
    ) -> WorkerPool {
        WorkerPool::spawn(self.worker_context(observer), count, prefix)
    }

    /// Drain everything currently due on a single coordinator.
    pub async fn run_until_idle(
        &self,
        worker_id: &str,
        observer: Arc<dyn CycleObserver>,
    ) -> Result<DrainSummary> {
        WorkerCoordinator::new(worker_id, self.worker_context(observer))
            .run_until_idle()
            .await
    }
}
