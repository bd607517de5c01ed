//! Lease-based scheduler over the `processing_state` table.
//!
//! Claiming and releasing are compare-and-set operations in [`Storage`]; this
//! module adds the retry policy (backoff, attempt ceiling, dead-lettering) and
//! the administrative views used by operators.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use stitchwork_shared::{
    EntityId, ProcessingState, ProcessingStatus, QueueStats, Result, SchedulerPolicy,
    StitchworkError,
};
use stitchwork_storage::Storage;

/// A lease held by one worker on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub entity_id: EntityId,
    pub worker_id: String,
    /// 1-based attempt number of this claim.
    pub attempt: u32,
    pub lease_expires_at: DateTime<Utc>,
}

/// How a claimed run ended, as reported to [`Scheduler::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    Success,
    /// Retry later, unless the attempt ceiling has been reached.
    Transient(String),
    /// Dead-letter immediately.
    Fatal(String),
    /// The run could not be carried through (store or stitch failure).
    /// Retried after backoff without consuming the attempt, never dead-lettered.
    Interrupted(String),
}

/// What the scheduler did with a released entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDecision {
    Processed,
    Retry { due_at: DateTime<Utc> },
    DeadLettered,
    /// The worker no longer held the lease; nothing was changed.
    LeaseLost,
}

pub struct Scheduler {
    storage: Arc<Storage>,
    policy: SchedulerPolicy,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, policy: SchedulerPolicy) -> Self {
        Self { storage, policy }
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    /// Claim the earliest-due entity, or `None` if nothing is due.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Claim>> {
        let state = self
            .storage
            .claim_next(worker_id, Utc::now(), self.policy.lease)
            .await?;

        Ok(state.map(|state| {
            debug!(
                entity_id = %state.entity_id,
                attempt = state.attempt_count,
                "claimed"
            );
            Claim {
                entity_id: state.entity_id,
                worker_id: worker_id.to_string(),
                attempt: state.attempt_count,
                lease_expires_at: state.lease_expires_at.unwrap_or_else(Utc::now),
            }
        }))
    }

    /// Extend a held lease by the configured lease duration.
    pub async fn renew_lease(&self, claim: &Claim) -> Result<bool> {
        self.storage
            .renew_lease(claim.entity_id, &claim.worker_id, Utc::now(), self.policy.lease)
            .await
    }

    /// Release a claim with the run's outcome.
    #[instrument(skip_all, fields(entity_id = %claim.entity_id, attempt = claim.attempt))]
    pub async fn release(&self, claim: &Claim, outcome: Release) -> Result<ReleaseDecision> {
        let now = Utc::now();
        let worker_id = claim.worker_id.as_str();

        let (applied, decision) = match outcome {
            Release::Success => (
                self.storage
                    .complete_claim(claim.entity_id, worker_id, now)
                    .await?,
                ReleaseDecision::Processed,
            ),
            Release::Transient(error) if claim.attempt >= self.policy.max_attempts => {
                let error = format!(
                    "gave up after {} attempts: {error}",
                    claim.attempt
                );
                (
                    self.storage
                        .fail_claim(claim.entity_id, worker_id, &error, now)
                        .await?,
                    ReleaseDecision::DeadLettered,
                )
            }
            Release::Transient(error) => {
                let due_at = due_after(now, self.backoff(claim.attempt));
                (
                    self.storage
                        .retry_claim(claim.entity_id, worker_id, due_at, &error, now)
                        .await?,
                    ReleaseDecision::Retry { due_at },
                )
            }
            Release::Fatal(error) => (
                self.storage
                    .fail_claim(claim.entity_id, worker_id, &error, now)
                    .await?,
                ReleaseDecision::DeadLettered,
            ),
            Release::Interrupted(error) => {
                let due_at = due_after(now, self.backoff(claim.attempt));
                (
                    self.storage
                        .defer_claim(claim.entity_id, worker_id, due_at, &error, now)
                        .await?,
                    ReleaseDecision::Retry { due_at },
                )
            }
        };

        if !applied {
            warn!("lease lost before release; outcome dropped");
            return Ok(ReleaseDecision::LeaseLost);
        }

        match decision {
            ReleaseDecision::DeadLettered => warn!("entity dead-lettered"),
            ReleaseDecision::Retry { due_at } => info!(%due_at, "retry scheduled"),
            _ => debug!("entity processed"),
        }
        Ok(decision)
    }

    /// Backoff before the retry following attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(&self.policy, attempt)
    }

    /// Processing state of an entity.
    pub async fn status(&self, entity_id: EntityId) -> Result<ProcessingState> {
        self.storage
            .get_processing_state(entity_id)
            .await?
            .ok_or_else(|| StitchworkError::not_found(format!("entity {entity_id}")))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.storage.queue_stats().await
    }

    pub async fn list(
        &self,
        status: Option<ProcessingStatus>,
        limit: u32,
    ) -> Result<Vec<ProcessingState>> {
        self.storage.list_processing(status, limit).await
    }

    /// Re-drive a dead-lettered entity with a fresh attempt budget.
    #[instrument(skip_all, fields(%entity_id))]
    pub async fn requeue(&self, entity_id: EntityId) -> Result<()> {
        if self.storage.requeue_failed(entity_id, Utc::now()).await? {
            info!("entity requeued");
            return Ok(());
        }
        let state = self.status(entity_id).await?;
        Err(StitchworkError::validation(format!(
            "entity {entity_id} is {}, only failed entities can be requeued",
            state.status
        )))
    }
}

/// `base * 2^(attempt-1)`, capped at `backoff_max`.
pub fn backoff_delay(policy: &SchedulerPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    policy
        .backoff_base
        .saturating_mul(1u32 << exponent)
        .min(policy.backoff_max)
}

/// `now + delay`, saturating at the latest representable instant.
fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use uuid::Uuid;

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("sw_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn policy(max_attempts: u32) -> SchedulerPolicy {
        SchedulerPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            lease: Duration::from_secs(30),
        }
    }

    async fn emit(storage: &Storage, external_id: &str) -> EntityId {
        storage
            .register_raw_entity("fs", external_id, &Value::from(1), Utc::now())
            .await
            .unwrap()
            .entity_id
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = SchedulerPolicy {
            max_attempts: 10,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            lease: Duration::from_secs(60),
        };
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(&policy, 5), Duration::from_secs(10));
        assert_eq!(backoff_delay(&policy, 200), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn transient_failure_retries_then_dead_letters() {
        let storage = test_storage().await;
        let scheduler = Scheduler::new(storage.clone(), policy(2));
        let id = emit(&storage, "a").await;

        let claim = scheduler.claim("w1").await.unwrap().unwrap();
        assert_eq!(claim.attempt, 1);
        let decision = scheduler
            .release(&claim, Release::Transient("busy".into()))
            .await
            .unwrap();
        assert!(matches!(decision, ReleaseDecision::Retry { .. }));

        let state = scheduler.status(id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Unprocessed);
        assert_eq!(state.attempt_count, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let claim = scheduler.claim("w1").await.unwrap().unwrap();
        assert_eq!(claim.attempt, 2);
        let decision = scheduler
            .release(&claim, Release::Transient("busy".into()))
            .await
            .unwrap();
        assert_eq!(decision, ReleaseDecision::DeadLettered);

        let state = scheduler.status(id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Failed);
        assert!(state.last_error.unwrap().contains("busy"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(scheduler.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupted_release_never_dead_letters() {
        let storage = test_storage().await;
        let scheduler = Scheduler::new(storage.clone(), policy(1));
        let id = emit(&storage, "a").await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let claim = scheduler.claim("w1").await.unwrap().unwrap();
            assert_eq!(claim.attempt, 1);
            let decision = scheduler
                .release(&claim, Release::Interrupted("store busy".into()))
                .await
                .unwrap();
            assert!(matches!(decision, ReleaseDecision::Retry { .. }));
        }

        let state = scheduler.status(id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Unprocessed);
        assert_eq!(state.attempt_count, 0);
        assert_eq!(state.last_error.as_deref(), Some("store busy"));
    }

    #[tokio::test]
    async fn huge_backoff_saturates_due_time() {
        let storage = test_storage().await;
        let scheduler = Scheduler::new(
            storage.clone(),
            SchedulerPolicy {
                max_attempts: 5,
                backoff_base: Duration::from_secs(u64::MAX / 4),
                backoff_max: Duration::MAX,
                lease: Duration::from_secs(30),
            },
        );
        let id = emit(&storage, "a").await;

        let claim = scheduler.claim("w1").await.unwrap().unwrap();
        let decision = scheduler
            .release(&claim, Release::Transient("later".into()))
            .await
            .unwrap();
        assert_eq!(
            decision,
            ReleaseDecision::Retry {
                due_at: DateTime::<Utc>::MAX_UTC
            }
        );
        assert_eq!(
            scheduler.status(id).await.unwrap().status,
            ProcessingStatus::Unprocessed
        );
        assert!(scheduler.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fatal_dead_letters_immediately() {
        let storage = test_storage().await;
        let scheduler = Scheduler::new(storage.clone(), policy(5));
        let id = emit(&storage, "a").await;

        let claim = scheduler.claim("w1").await.unwrap().unwrap();
        let decision = scheduler
            .release(&claim, Release::Fatal("corrupt".into()))
            .await
            .unwrap();
        assert_eq!(decision, ReleaseDecision::DeadLettered);
        let state = scheduler.status(id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Failed);
        assert_eq!(state.attempt_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("corrupt"));
    }

    #[tokio::test]
    async fn release_after_reset_reports_lease_lost() {
        let storage = test_storage().await;
        let scheduler = Scheduler::new(storage.clone(), policy(5));
        emit(&storage, "a").await;

        let claim = scheduler.claim("w1").await.unwrap().unwrap();
        // A provider update clears the lease.
        emit(&storage, "a").await;
        let decision = scheduler.release(&claim, Release::Success).await.unwrap();
        assert_eq!(decision, ReleaseDecision::LeaseLost);
        assert!(!scheduler.renew_lease(&claim).await.unwrap());

        let state = scheduler.status(claim.entity_id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Unprocessed);
    }

    #[tokio::test]
    async fn requeue_only_failed_entities() {
        let storage = test_storage().await;
        let scheduler = Scheduler::new(storage.clone(), policy(5));
        let id = emit(&storage, "a").await;

        let err = scheduler.requeue(id).await.unwrap_err();
        assert!(matches!(err, StitchworkError::Validation { .. }));
        assert!(scheduler.requeue(EntityId::new()).await.unwrap_err().is_not_found());

        let claim = scheduler.claim("w1").await.unwrap().unwrap();
        scheduler
            .release(&claim, Release::Fatal("bad".into()))
            .await
            .unwrap();
        scheduler.requeue(id).await.unwrap();

        let claim = scheduler.claim("w1").await.unwrap().unwrap();
        assert_eq!(claim.entity_id, id);
        assert_eq!(claim.attempt, 1);
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let storage = test_storage().await;
        let scheduler = Arc::new(Scheduler::new(storage.clone(), policy(5)));
        for i in 0..20 {
            emit(&storage, &format!("e{i}")).await;
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut claimed = Vec::new();
                while let Some(claim) = scheduler.claim(&worker).await.unwrap() {
                    claimed.push(claim.entity_id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::BTreeSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
        assert_eq!(scheduler.stats().await.unwrap().claimed, 20);
    }
}
