//! Stitcher: merges a pipeline run into a new canonical version and commits it.
//!
//! [`merge`] is pure. [`Stitcher::stitch`] wraps it in an optimistic
//! compare-and-set commit that also re-checks the entity and the lease, so a
//! retracted entity is never resurrected and a superseded run never lands.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use stitchwork_shared::{CanonicalEntity, EntityId, Result, StitchworkError};
use stitchwork_storage::{CommitOutcome, Storage};

use crate::pipeline::{PipelineResult, RunOutcome};

/// Re-merge attempts when a concurrent commit bumps the version.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Result of a stitch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StitchOutcome {
    /// A new version is visible.
    Committed(CanonicalEntity),
    /// Fatal run with no prior version: nothing to make visible.
    Skipped,
    /// The entity was retracted; the result was discarded.
    EntityGone,
    /// The worker's lease was superseded; the result was discarded.
    LeaseLost,
}

/// Merge `result` over `previous`, producing the next canonical version.
///
/// Returns `None` for a fatal run on an entity that was never stitched.
pub fn merge(
    entity_id: EntityId,
    previous: Option<&CanonicalEntity>,
    result: &PipelineResult,
    now: DateTime<Utc>,
) -> Option<CanonicalEntity> {
    let fatal = result.outcome() == RunOutcome::Fatal;
    if fatal && previous.is_none() {
        return None;
    }

    let mut next = match previous {
        Some(prev) => CanonicalEntity {
            version: prev.version + 1,
            last_stitched_at: now,
            ..prev.clone()
        },
        None => CanonicalEntity {
            entity_id,
            version: 1,
            metadata: Default::default(),
            relations: Default::default(),
            errors: Vec::new(),
            last_stitched_at: now,
        },
    };

    if !fatal {
        for (key, value) in &result.metadata_patch {
            next.metadata.insert(key.clone(), value.clone());
        }
        next.relations.extend(result.relations_added.iter().cloned());
        next.relations
            .retain(|r| !result.relations_removed.contains(r));
    }

    next.errors
        .retain(|e| !result.processors_run.contains(&e.processor_id));
    next.errors.extend(result.errors.iter().cloned());

    Some(next)
}

pub struct Stitcher {
    storage: Arc<Storage>,
}

impl Stitcher {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Merge and commit a run's result on behalf of `worker_id`.
    #[instrument(skip_all, fields(%entity_id, worker = %worker_id))]
    pub async fn stitch(
        &self,
        entity_id: EntityId,
        worker_id: &str,
        result: &PipelineResult,
    ) -> Result<StitchOutcome> {
        for _ in 0..=MAX_CONFLICT_RETRIES {
            let previous = self.storage.get_canonical(entity_id).await?;
            let base_version = previous.as_ref().map(|c| c.version);

            let Some(next) = merge(entity_id, previous.as_ref(), result, Utc::now()) else {
                debug!("fatal run on unstitched entity; nothing committed");
                return Ok(StitchOutcome::Skipped);
            };

            match self
                .storage
                .commit_canonical(&next, worker_id, base_version)
                .await?
            {
                CommitOutcome::Committed => {
                    info!(
                        version = next.version,
                        errors = next.errors.len(),
                        "canonical entity committed"
                    );
                    return Ok(StitchOutcome::Committed(next));
                }
                CommitOutcome::EntityGone => {
                    info!("entity retracted during run; result discarded");
                    return Ok(StitchOutcome::EntityGone);
                }
                CommitOutcome::LeaseLost => {
                    warn!("lease lost during run; result discarded");
                    return Ok(StitchOutcome::LeaseLost);
                }
                CommitOutcome::VersionConflict { current } => {
                    warn!(?base_version, ?current, "version conflict, re-merging");
                }
            }
        }

        Err(StitchworkError::Storage(format!(
            "canonical version of {entity_id} kept changing during commit"
        )))
    }
}
