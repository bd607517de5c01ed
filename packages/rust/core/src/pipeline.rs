//! Staged processor pipeline: raw entity → ordered stages → [`PipelineResult`].
//!
//! Stages run strictly in configured order and processors within a stage in
//! registration order. Each processor sees the raw entity plus everything
//! accumulated earlier in the same run. A failing, panicking or timed-out
//! processor is recorded as an error scoped to its id and never stops its
//! siblings.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use stitchwork_shared::{
    EntityError, EntityId, ErrorKind, Metadata, RawEntity, Relation, Result, StitchworkError,
};

// ---------------------------------------------------------------------------
// Processor capability
// ---------------------------------------------------------------------------

/// What one processor contributes to a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessorOutput {
    pub metadata_patch: Metadata,
    pub relations_added: Vec<Relation>,
    pub relations_removed: Vec<Relation>,
    /// Non-aborting errors reported alongside a result.
    pub errors: Vec<EntityError>,
}

impl ProcessorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata_patch.insert(key.into(), value.into());
        self
    }

    pub fn add_relation(mut self, relation: Relation) -> Self {
        self.relations_added.push(relation);
        self
    }

    pub fn remove_relation(mut self, relation: Relation) -> Self {
        self.relations_removed.push(relation);
        self
    }

    pub fn with_error(mut self, error: EntityError) -> Self {
        self.errors.push(error);
        self
    }
}

/// A processor failure. Recorded on the entity, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProcessorError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProcessorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            message: message.into(),
        }
    }
}

/// Run-scoped view handed to each processor.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub entity_id: EntityId,
    /// 1-based attempt number of the claim driving this run.
    pub attempt: u32,
    /// Stage currently executing.
    pub stage: String,
    /// Metadata patched so far in this run.
    pub metadata: Metadata,
    /// Relations added so far in this run (net of removals).
    pub relations: BTreeSet<Relation>,
    /// Errors recorded so far in this run.
    pub errors: Vec<EntityError>,
}

/// An enrichment plugin.
///
/// Implementations must be idempotent: the same raw entity and context may be
/// processed more than once (lease expiry, retries).
#[async_trait]
pub trait Processor: Send + Sync {
    /// Unique id, used to scope errors across runs.
    fn id(&self) -> &str;

    /// Stage this processor belongs to.
    fn stage(&self) -> &str;

    async fn process(
        &self,
        raw: &RawEntity,
        ctx: &RunContext,
    ) -> std::result::Result<ProcessorOutput, ProcessorError>;
}

// ---------------------------------------------------------------------------
// Run result
// ---------------------------------------------------------------------------

/// Overall classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No processor reported an error.
    Clean,
    /// At least one transient error.
    Partial,
    /// At least one fatal error.
    Fatal,
}

/// One processor's contribution, attributed.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub stage: String,
    pub processor_id: String,
    pub output: ProcessorOutput,
}

/// Accumulated outputs of a full run, ready for stitching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineResult {
    pub metadata_patch: Metadata,
    pub relations_added: BTreeSet<Relation>,
    pub relations_removed: BTreeSet<Relation>,
    pub errors: Vec<EntityError>,
    /// Ids of every processor invoked, whether or not it succeeded.
    pub processors_run: BTreeSet<String>,
    pub outputs: Vec<StageOutput>,
}

impl PipelineResult {
    pub fn outcome(&self) -> RunOutcome {
        if self.errors.iter().any(|e| e.kind == ErrorKind::Fatal) {
            RunOutcome::Fatal
        } else if self.errors.is_empty() {
            RunOutcome::Clean
        } else {
            RunOutcome::Partial
        }
    }

    /// One-line summary of the errors, for `last_error`.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn apply(&mut self, processor_id: &str, output: &ProcessorOutput) {
        for (key, value) in &output.metadata_patch {
            self.metadata_patch.insert(key.clone(), value.clone());
        }
        for relation in &output.relations_added {
            self.relations_removed.remove(relation);
            self.relations_added.insert(relation.clone());
        }
        for relation in &output.relations_removed {
            self.relations_added.remove(relation);
            self.relations_removed.insert(relation.clone());
        }
        for error in &output.errors {
            self.errors.push(EntityError {
                processor_id: processor_id.to_string(),
                ..error.clone()
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline assembly
// ---------------------------------------------------------------------------

struct Stage {
    name: String,
    processors: Vec<Arc<dyn Processor>>,
}

/// Builds a [`Pipeline`] from ordered stage names and processors.
pub struct PipelineBuilder {
    stages: Vec<String>,
    processors: Vec<Arc<dyn Processor>>,
    timeout: Duration,
}

impl PipelineBuilder {
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
            processors: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Register a processor; order of registration is order of invocation within its stage.
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn processors(mut self, processors: impl IntoIterator<Item = Arc<dyn Processor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    /// Upper bound on a single processor invocation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(StitchworkError::config("pipeline needs at least one stage"));
        }

        let mut stages: Vec<Stage> = Vec::with_capacity(self.stages.len());
        for name in self.stages {
            if stages.iter().any(|s| s.name == name) {
                return Err(StitchworkError::config(format!("duplicate stage '{name}'")));
            }
            stages.push(Stage {
                name,
                processors: Vec::new(),
            });
        }

        let mut seen = HashSet::new();
        for processor in self.processors {
            let id = processor.id().to_string();
            if id.is_empty() {
                return Err(StitchworkError::config("processor id must not be empty"));
            }
            if !seen.insert(id.clone()) {
                return Err(StitchworkError::config(format!(
                    "duplicate processor id '{id}'"
                )));
            }
            let stage = stages
                .iter_mut()
                .find(|s| s.name == processor.stage())
                .ok_or_else(|| {
                    StitchworkError::config(format!(
                        "processor '{id}' uses unknown stage '{}'",
                        processor.stage()
                    ))
                })?;
            stage.processors.push(processor);
        }

        Ok(Pipeline {
            stages,
            timeout: self.timeout,
        })
    }
}

/// An immutable, ordered set of stages and their processors.
pub struct Pipeline {
    stages: Vec<Stage>,
    timeout: Duration,
}

impl Pipeline {
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    pub fn processor_count(&self) -> usize {
        self.stages.iter().map(|s| s.processors.len()).sum()
    }

    /// Run every stage over `raw`.
    #[instrument(skip_all, fields(entity_id = %raw.entity_id, attempt = attempt))]
    pub async fn run(&self, raw: Arc<RawEntity>, attempt: u32) -> PipelineResult {
        let start = Instant::now();
        let mut result = PipelineResult::default();

        for stage in &self.stages {
            for processor in &stage.processors {
                let ctx = RunContext {
                    entity_id: raw.entity_id,
                    attempt,
                    stage: stage.name.clone(),
                    metadata: result.metadata_patch.clone(),
                    relations: result.relations_added.clone(),
                    errors: result.errors.clone(),
                };
                let id = processor.id().to_string();
                result.processors_run.insert(id.clone());

                let output = match self.invoke(processor.clone(), raw.clone(), ctx).await {
                    Ok(output) => output,
                    Err(err) => {
                        warn!(processor = %id, stage = %stage.name, error = %err, "processor failed");
                        ProcessorOutput::new().with_error(EntityError {
                            processor_id: id.clone(),
                            kind: err.kind,
                            message: err.message,
                        })
                    }
                };

                result.apply(&id, &output);
                result.outputs.push(StageOutput {
                    stage: stage.name.clone(),
                    processor_id: id,
                    output,
                });
            }
        }

        debug!(
            processors = result.processors_run.len(),
            errors = result.errors.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pipeline run finished"
        );
        result
    }

    /// Invoke one processor on its own task, bounded by the timeout.
    async fn invoke(
        &self,
        processor: Arc<dyn Processor>,
        raw: Arc<RawEntity>,
        ctx: RunContext,
    ) -> std::result::Result<ProcessorOutput, ProcessorError> {
        let mut handle = tokio::spawn(async move { processor.process(&raw, &ctx).await });

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(ProcessorError::transient("processor panicked"))
            }
            Ok(Err(join_err)) => Err(ProcessorError::transient(format!(
                "processor task failed: {join_err}"
            ))),
            Err(_) => {
                handle.abort();
                Err(ProcessorError::transient(format!(
                    "processor timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Test processor driven by a closure.
    struct FnProcessor<F> {
        id: String,
        stage: String,
        f: F,
    }

    #[async_trait]
    impl<F> Processor for FnProcessor<F>
    where
        F: Fn(&RawEntity, &RunContext) -> std::result::Result<ProcessorOutput, ProcessorError>
            + Send
            + Sync,
    {
        fn id(&self) -> &str {
            &self.id
        }

        fn stage(&self) -> &str {
            &self.stage
        }

        async fn process(
            &self,
            raw: &RawEntity,
            ctx: &RunContext,
        ) -> std::result::Result<ProcessorOutput, ProcessorError> {
            (self.f)(raw, ctx)
        }
    }

    fn processor<F>(id: &str, stage: &str, f: F) -> Arc<dyn Processor>
    where
        F: Fn(&RawEntity, &RunContext) -> std::result::Result<ProcessorOutput, ProcessorError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(FnProcessor {
            id: id.into(),
            stage: stage.into(),
            f,
        })
    }

    struct SlowProcessor;

    #[async_trait]
    impl Processor for SlowProcessor {
        fn id(&self) -> &str {
            "slow"
        }

        fn stage(&self) -> &str {
            "extract"
        }

        async fn process(
            &self,
            _raw: &RawEntity,
            _ctx: &RunContext,
        ) -> std::result::Result<ProcessorOutput, ProcessorError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ProcessorOutput::new())
        }
    }

    fn raw(payload: Value) -> Arc<RawEntity> {
        Arc::new(RawEntity {
            entity_id: EntityId::new(),
            provider_id: "fs".into(),
            external_id: "img-1".into(),
            payload_hash: stitchwork_shared::payload_hash(&payload),
            payload,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    fn stages() -> Vec<&'static str> {
        vec!["extract", "derive"]
    }

    #[tokio::test]
    async fn empty_pipeline_is_clean_no_op() {
        let pipeline = PipelineBuilder::new(stages()).build().unwrap();
        let result = pipeline.run(raw(Value::from(1)), 1).await;
        assert_eq!(result.outcome(), RunOutcome::Clean);
        assert!(result.metadata_patch.is_empty());
        assert!(result.relations_added.is_empty());
        assert!(result.processors_run.is_empty());
    }

    #[tokio::test]
    async fn later_stage_sees_earlier_outputs() {
        // Registered in reverse order: stage order still wins.
        let pipeline = PipelineBuilder::new(stages())
            .processor(processor("category", "derive", |_, ctx| {
                let exposure = ctx.metadata.get("exposure").and_then(Value::as_i64);
                let category = match exposure {
                    Some(e) if e >= 60 => "long",
                    Some(_) => "short",
                    None => return Err(ProcessorError::fatal("exposure missing")),
                };
                Ok(ProcessorOutput::new().with_field("exposureCategory", category))
            }))
            .processor(processor("header", "extract", |raw, _| {
                Ok(ProcessorOutput::new().with_field("exposure", raw.payload["exposure"].clone()))
            }))
            .build()
            .unwrap();

        let result = pipeline
            .run(raw(serde_json::json!({"exposure": 300})), 1)
            .await;
        assert_eq!(result.outcome(), RunOutcome::Clean);
        assert_eq!(result.metadata_patch["exposure"], 300);
        assert_eq!(result.metadata_patch["exposureCategory"], "long");
        assert_eq!(result.outputs[0].stage, "extract");
        assert_eq!(result.outputs[1].stage, "derive");
    }

    #[tokio::test]
    async fn failing_processor_does_not_stop_siblings() {
        let pipeline = PipelineBuilder::new(stages())
            .processor(processor("broken", "extract", |_, _| {
                Err(ProcessorError::transient("solver busy"))
            }))
            .processor(processor("ok", "extract", |_, ctx| {
                assert_eq!(ctx.errors.len(), 1);
                Ok(ProcessorOutput::new().with_field("seen", true))
            }))
            .build()
            .unwrap();

        let result = pipeline.run(raw(Value::from(1)), 1).await;
        assert_eq!(result.outcome(), RunOutcome::Partial);
        assert_eq!(result.metadata_patch["seen"], true);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].processor_id, "broken");
        assert_eq!(result.errors[0].kind, ErrorKind::Transient);
        assert_eq!(result.processors_run.len(), 2);
    }

    #[tokio::test]
    async fn reported_errors_are_attributed_and_fatal_wins() {
        let pipeline = PipelineBuilder::new(stages())
            .processor(processor("warns", "extract", |_, _| {
                Ok(ProcessorOutput::new().with_error(EntityError::transient("someone-else", "x")))
            }))
            .processor(processor("rejects", "derive", |_, _| {
                Err(ProcessorError::fatal("not an image"))
            }))
            .build()
            .unwrap();

        let result = pipeline.run(raw(Value::from(1)), 1).await;
        assert_eq!(result.outcome(), RunOutcome::Fatal);
        assert_eq!(result.errors[0].processor_id, "warns");
        assert!(result.error_summary().contains("not an image"));
    }

    #[tokio::test]
    async fn panic_and_timeout_become_transient_errors() {
        let pipeline = PipelineBuilder::new(stages())
            .processor(processor("panics", "extract", |_, _| panic!("boom")))
            .processor(Arc::new(SlowProcessor))
            .processor(processor("after", "derive", |_, _| {
                Ok(ProcessorOutput::new().with_field("ran", true))
            }))
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let result = pipeline.run(raw(Value::from(1)), 1).await;
        assert_eq!(result.outcome(), RunOutcome::Partial);
        let ids: Vec<_> = result.errors.iter().map(|e| e.processor_id.as_str()).collect();
        assert_eq!(ids, vec!["panics", "slow"]);
        assert!(result.errors[1].message.contains("timed out"));
        assert_eq!(result.metadata_patch["ran"], true);
    }

    #[tokio::test]
    async fn later_relation_decision_wins() {
        let target = EntityId::new();
        let pipeline = PipelineBuilder::new(stages())
            .processor(processor("adds", "extract", move |raw, _| {
                Ok(ProcessorOutput::new()
                    .add_relation(Relation::new(raw.entity_id, "depicts", target))
                    .add_relation(Relation::new(raw.entity_id, "near", target)))
            }))
            .processor(processor("removes", "derive", move |raw, ctx| {
                assert_eq!(ctx.relations.len(), 2);
                Ok(ProcessorOutput::new().remove_relation(Relation::new(
                    raw.entity_id,
                    "near",
                    target,
                )))
            }))
            .build()
            .unwrap();

        let result = pipeline.run(raw(Value::from(1)), 1).await;
        assert_eq!(result.relations_added.len(), 1);
        assert_eq!(result.relations_removed.len(), 1);
        assert!(result.relations_added.iter().all(|r| r.kind == "depicts"));
    }

    #[test]
    fn builder_rejects_bad_configuration() {
        let ok = |_: &RawEntity, _: &RunContext| Ok(ProcessorOutput::new());

        let err = PipelineBuilder::new(stages())
            .processor(processor("a", "publish", ok))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown stage"));

        let err = PipelineBuilder::new(stages())
            .processor(processor("a", "extract", ok))
            .processor(processor("a", "derive", ok))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("duplicate processor"));

        assert!(PipelineBuilder::new(["x", "x"]).build().is_err());
        assert!(PipelineBuilder::new(Vec::<String>::new()).build().is_err());
    }
}
