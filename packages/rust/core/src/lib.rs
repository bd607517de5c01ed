//! Orchestration logic for Stitchwork.
//!
//! This crate ties the entity store to the processing lifecycle: intake of
//! provider emits, lease-based scheduling, the staged processor pipeline,
//! stitching into canonical versions, and the worker loop that drives them.

pub mod builtin;
pub mod intake;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod stitch;
pub mod worker;

pub use intake::{EmitReceipt, Intake};
pub use orchestrator::Orchestrator;
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineResult, Processor, ProcessorError, ProcessorOutput,
    RunContext, RunOutcome,
};
pub use scheduler::{Claim, Release, ReleaseDecision, Scheduler};
pub use stitch::{StitchOutcome, Stitcher};
pub use worker::{
    CycleObserver, CycleReport, DiscardReason, DrainSummary, SilentObserver, WorkerContext,
    WorkerCoordinator, WorkerPool,
};
