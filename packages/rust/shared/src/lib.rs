//! Shared types, error model, and configuration for Stitchwork.
//!
//! This crate is the foundation depended on by all other Stitchwork crates.
//! It provides:
//! - [`StitchworkError`], the unified error type
//! - Domain types ([`EntityId`], [`RawEntity`], [`ProcessingState`], [`CanonicalEntity`], [`Relation`])
//! - Configuration ([`AppConfig`], runtime policies, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BuiltinProcessorConfig, DatabaseConfig, IntakeConfig, IntakeSection,
    PipelineConfig, SchedulerConfig, SchedulerPolicy, WorkerConfig, WorkerSettings, config_dir,
    config_file_path, init_config, init_config_at, load_config, load_config_from, validate_config,
};
pub use error::{Result, StitchworkError};
pub use types::{
    CanonicalEntity, EntityError, EntityId, ErrorKind, Metadata, OwnershipRecord,
    ProcessingState, ProcessingStatus, QueueStats, RawEntity, Relation, payload_hash,
};
