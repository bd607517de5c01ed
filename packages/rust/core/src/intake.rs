//! Intake: validates provider emits and retractions and hands them to the store.
//!
//! Intake owns no state of its own. The ownership registry and the queue row
//! live in [`Storage`]; Intake decides what is admissible and logs the result.

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tracing::{info, instrument};

use stitchwork_shared::{EntityId, IntakeConfig, Result, StitchworkError};
use stitchwork_storage::Storage;

/// Maximum byte length of a provider id or external id.
pub const MAX_ID_BYTES: usize = 256;

static PROVIDER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").expect("provider id pattern is valid")
});

/// What an accepted emit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitReceipt {
    pub entity_id: EntityId,
    /// `true` for a first-time identity, `false` for an update.
    pub created: bool,
    /// Whether the stored payload content changed.
    pub payload_changed: bool,
}

/// Provider-facing entry point: `emit` and `retract`.
pub struct Intake {
    storage: Arc<Storage>,
    config: IntakeConfig,
}

impl Intake {
    pub fn new(storage: Arc<Storage>, config: IntakeConfig) -> Self {
        Self { storage, config }
    }

    /// Register or update a raw entity and schedule it for processing now.
    #[instrument(skip_all, fields(provider = %provider_id, external_id = %external_id))]
    pub async fn emit(
        &self,
        provider_id: &str,
        external_id: &str,
        payload: &Value,
    ) -> Result<EmitReceipt> {
        self.validate_identity(provider_id, external_id)?;
        self.validate_payload(payload)?;

        let outcome = self
            .storage
            .register_raw_entity(provider_id, external_id, payload, Utc::now())
            .await?;

        info!(
            entity_id = %outcome.entity_id,
            created = outcome.created,
            payload_changed = outcome.payload_changed,
            "entity scheduled"
        );

        Ok(EmitReceipt {
            entity_id: outcome.entity_id,
            created: outcome.created,
            payload_changed: outcome.payload_changed,
        })
    }

    /// Delete everything stored for an identity, synchronously.
    ///
    /// Fails with `NotFound` if the identity has no ownership record.
    #[instrument(skip_all, fields(provider = %provider_id, external_id = %external_id))]
    pub async fn retract(&self, provider_id: &str, external_id: &str) -> Result<EntityId> {
        let entity_id = self
            .storage
            .delete_entity(provider_id, external_id)
            .await?
            .ok_or_else(|| {
                StitchworkError::not_found(format!("identity {provider_id}/{external_id}"))
            })?;

        info!(%entity_id, "entity retracted");
        Ok(entity_id)
    }

    fn validate_identity(&self, provider_id: &str, external_id: &str) -> Result<()> {
        if provider_id.is_empty() {
            return Err(StitchworkError::validation("provider id must not be empty"));
        }
        if provider_id.len() > MAX_ID_BYTES {
            return Err(StitchworkError::validation(format!(
                "provider id exceeds {MAX_ID_BYTES} bytes"
            )));
        }
        if !PROVIDER_ID_RE.is_match(provider_id) {
            return Err(StitchworkError::validation(format!(
                "provider id '{provider_id}' must match [a-z0-9][a-z0-9_.-]*"
            )));
        }
        if !self.config.providers.is_empty() && !self.config.providers.contains(provider_id) {
            return Err(StitchworkError::validation(format!(
                "provider '{provider_id}' is not registered"
            )));
        }
        if external_id.is_empty() {
            return Err(StitchworkError::validation("external id must not be empty"));
        }
        if external_id.len() > MAX_ID_BYTES {
            return Err(StitchworkError::validation(format!(
                "external id exceeds {MAX_ID_BYTES} bytes"
            )));
        }
        Ok(())
    }

    fn validate_payload(&self, payload: &Value) -> Result<()> {
        if payload.is_null() {
            return Err(StitchworkError::validation("payload must not be null"));
        }
        let size = payload.to_string().len();
        if size > self.config.max_payload_bytes {
            return Err(StitchworkError::validation(format!(
                "payload is {size} bytes, limit is {}",
                self.config.max_payload_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use stitchwork_shared::ProcessingStatus;
    use uuid::Uuid;

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("sw_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn config(providers: &[&str]) -> IntakeConfig {
        IntakeConfig {
            providers: providers.iter().map(|p| p.to_string()).collect::<BTreeSet<_>>(),
            max_payload_bytes: 64,
        }
    }

    #[tokio::test]
    async fn emit_new_entity_is_unprocessed_and_due() {
        let storage = test_storage().await;
        let intake = Intake::new(storage.clone(), config(&[]));

        let before = Utc::now();
        let receipt = intake
            .emit("fs", "E1", &serde_json::json!({"exposure": 300}))
            .await
            .unwrap();
        assert!(receipt.created);

        let state = storage
            .get_processing_state(receipt.entity_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, ProcessingStatus::Unprocessed);
        assert_eq!(state.attempt_count, 0);
        let due = state.due_at.unwrap();
        assert!(due.timestamp_millis() >= before.timestamp_millis());
        assert!(due <= Utc::now());
    }

    #[tokio::test]
    async fn re_emit_keeps_entity_id() {
        let storage = test_storage().await;
        let intake = Intake::new(storage.clone(), config(&[]));

        let first = intake.emit("fs", "X", &Value::from(1)).await.unwrap();
        let second = intake.emit("fs", "X", &Value::from(2)).await.unwrap();
        assert_eq!(first.entity_id, second.entity_id);
        assert!(!second.created);
        assert!(second.payload_changed);
    }

    #[tokio::test]
    async fn rejects_invalid_input_without_writing() {
        let storage = test_storage().await;
        let intake = Intake::new(storage.clone(), config(&["fs"]));

        let cases = [
            ("", "a", Value::from(1)),
            ("FS", "a", Value::from(1)),
            ("s3", "a", Value::from(1)),
            ("fs", "", Value::from(1)),
            ("fs", "a", Value::Null),
            ("fs", "a", Value::from("x".repeat(100))),
        ];
        for (provider, external, payload) in cases {
            let err = intake.emit(provider, external, &payload).await.unwrap_err();
            assert!(
                matches!(err, StitchworkError::Validation { .. }),
                "expected validation error for {provider:?}/{external:?}, got {err}"
            );
        }

        let long_id = "a".repeat(MAX_ID_BYTES + 1);
        assert!(intake.emit("fs", &long_id, &Value::from(1)).await.is_err());

        assert_eq!(storage.queue_stats().await.unwrap().unprocessed, 0);
    }

    #[tokio::test]
    async fn retract_unknown_identity_is_not_found() {
        let storage = test_storage().await;
        let intake = Intake::new(storage, config(&[]));
        let err = intake.retract("fs", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn retract_deletes_everything() {
        let storage = test_storage().await;
        let intake = Intake::new(storage.clone(), config(&[]));
        let receipt = intake.emit("fs", "X", &Value::from(1)).await.unwrap();

        let retracted = intake.retract("fs", "X").await.unwrap();
        assert_eq!(retracted, receipt.entity_id);
        assert!(storage.lookup_owner("fs", "X").await.unwrap().is_none());
        assert!(storage.get_raw_entity(retracted).await.unwrap().is_none());
        assert!(storage.get_processing_state(retracted).await.unwrap().is_none());

        // A later emit of the same identity starts a fresh entity.
        let again = intake.emit("fs", "X", &Value::from(1)).await.unwrap();
        assert!(again.created);
        assert_ne!(again.entity_id, retracted);
    }
}
