//! libSQL entity store for Stitchwork (embedded, file-backed).
//!
//! The [`Storage`] struct wraps a libSQL database holding the four tables the
//! orchestrator shares between workers: `raw_entities`, `ownership`,
//! `processing_state` and `canonical_entities`.
//!
//! **Concurrency rules:**
//! - Every operation opens its own connection (with a busy timeout), so
//!   concurrent tasks never share transaction state.
//! - Claim and release are single compare-and-set `UPDATE` statements keyed by
//!   entity id; multi-table writes run in `IMMEDIATE` transactions. Both hold
//!   across independent processes pointed at the same file.

mod migrations;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, TransactionBehavior, params};
use serde_json::Value;
use stitchwork_shared::{
    CanonicalEntity, EntityId, ProcessingState, ProcessingStatus, QueueStats, RawEntity, Result,
    StitchworkError, payload_hash,
};

/// Milliseconds a connection waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Column list shared by every query that builds a [`ProcessingState`].
const PROCESSING_COLUMNS: &str = "entity_id, status, due_at_ms, attempt_count, lease_owner, \
     lease_expires_at_ms, last_error, enqueue_seq, updated_at";

/// Result of registering a provider emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Entity id owning the identity (fresh if `created`).
    pub entity_id: EntityId,
    /// Whether the identity was seen for the first time.
    pub created: bool,
    /// Whether the payload hash differs from the stored one (always true when created).
    pub payload_changed: bool,
}

/// Result of an attempted canonical commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The new version replaced the previous one.
    Committed,
    /// The entity was retracted; nothing was written.
    EntityGone,
    /// The committing worker no longer holds the lease; nothing was written.
    LeaseLost,
    /// Another commit landed since the merge was computed.
    VersionConflict { current: Option<u64> },
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    path: PathBuf,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StitchworkError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let storage = Self {
            db,
            path: path.to_path_buf(),
            readonly: false,
        };

        let conn = storage.connect().await?;
        conn.query("PRAGMA journal_mode = WAL", params![])
            .await
            .map_err(db_err)?;

        storage.run_migrations(&conn).await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (dashboards, `status`/`show`).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
            readonly: true,
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh connection with the busy timeout applied.
    async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect().map_err(db_err)?;
        let pragma = format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}");
        conn.query(&pragma, params![]).await.map_err(db_err)?;
        Ok(conn)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self, conn: &Connection) -> Result<()> {
        let current_version = self.get_schema_version(conn).await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    StitchworkError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self, conn: &Connection) -> u32 {
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(StitchworkError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ownership registry & raw entities
    // -----------------------------------------------------------------------

    /// Register a provider emit: create the identity (raw entity, ownership,
    /// processing state) or replace its payload, and (re)schedule it at `now`.
    ///
    /// Rescheduling resets attempts, clears any lease and assigns a new
    /// insertion sequence, all in one transaction.
    pub async fn register_raw_entity(
        &self,
        provider_id: &str,
        external_id: &str,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> Result<RegisterOutcome> {
        self.check_writable()?;
        let payload_json = payload.to_string();
        let hash = payload_hash(payload);
        let now_text = now.to_rfc3339();

        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let existing = {
            let mut rows = tx
                .query(
                    "SELECT entity_id FROM ownership WHERE provider_id = ?1 AND external_id = ?2",
                    params![provider_id, external_id],
                )
                .await
                .map_err(db_err)?;
            match rows.next().await.map_err(db_err)? {
                Some(row) => Some(parse_entity_id(&row.get::<String>(0).map_err(db_err)?)?),
                None => None,
            }
        };

        let outcome = match existing {
            Some(entity_id) => {
                let previous_hash = {
                    let mut rows = tx
                        .query(
                            "SELECT payload_hash FROM raw_entities WHERE entity_id = ?1",
                            params![entity_id.to_string()],
                        )
                        .await
                        .map_err(db_err)?;
                    match rows.next().await.map_err(db_err)? {
                        Some(row) => row.get::<String>(0).ok(),
                        None => None,
                    }
                };

                tx.execute(
                    "UPDATE raw_entities SET payload_json = ?1, payload_hash = ?2, updated_at = ?3
                     WHERE entity_id = ?4",
                    params![
                        payload_json.as_str(),
                        hash.as_str(),
                        now_text.as_str(),
                        entity_id.to_string()
                    ],
                )
                .await
                .map_err(db_err)?;

                RegisterOutcome {
                    entity_id,
                    created: false,
                    payload_changed: previous_hash.as_deref() != Some(hash.as_str()),
                }
            }
            None => {
                let entity_id = EntityId::new();
                let id_text = entity_id.to_string();

                tx.execute(
                    "INSERT INTO raw_entities
                       (entity_id, provider_id, external_id, payload_json, payload_hash, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        id_text.as_str(),
                        provider_id,
                        external_id,
                        payload_json.as_str(),
                        hash.as_str(),
                        now_text.as_str()
                    ],
                )
                .await
                .map_err(db_err)?;

                tx.execute(
                    "INSERT INTO ownership (provider_id, external_id, entity_id) VALUES (?1, ?2, ?3)",
                    params![provider_id, external_id, id_text.as_str()],
                )
                .await
                .map_err(db_err)?;

                RegisterOutcome {
                    entity_id,
                    created: true,
                    payload_changed: true,
                }
            }
        };

        tx.execute(
            "INSERT INTO processing_state
               (entity_id, status, due_at_ms, attempt_count, lease_owner, lease_expires_at_ms,
                last_error, enqueue_seq, updated_at)
             VALUES (?1, 'unprocessed', ?2, 0, NULL, NULL, NULL,
                     (SELECT COALESCE(MAX(enqueue_seq), 0) + 1 FROM processing_state), ?3)
             ON CONFLICT(entity_id) DO UPDATE SET
               status = 'unprocessed',
               due_at_ms = excluded.due_at_ms,
               attempt_count = 0,
               lease_owner = NULL,
               lease_expires_at_ms = NULL,
               last_error = NULL,
               enqueue_seq = excluded.enqueue_seq,
               updated_at = excluded.updated_at",
            params![
                outcome.entity_id.to_string(),
                millis(now),
                now_text.as_str()
            ],
        )
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    /// Look up the entity owning `(provider_id, external_id)`.
    pub async fn lookup_owner(
        &self,
        provider_id: &str,
        external_id: &str,
    ) -> Result<Option<EntityId>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT entity_id FROM ownership WHERE provider_id = ?1 AND external_id = ?2",
                params![provider_id, external_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(parse_entity_id(
                &row.get::<String>(0).map_err(db_err)?,
            )?)),
            None => Ok(None),
        }
    }

    /// Delete the raw entity, ownership record, processing state and canonical
    /// entity for an identity in one transaction.
    ///
    /// Returns the deleted entity id, or `None` if the identity is unknown.
    pub async fn delete_entity(
        &self,
        provider_id: &str,
        external_id: &str,
    ) -> Result<Option<EntityId>> {
        self.check_writable()?;
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let entity_id = {
            let mut rows = tx
                .query(
                    "SELECT entity_id FROM ownership WHERE provider_id = ?1 AND external_id = ?2",
                    params![provider_id, external_id],
                )
                .await
                .map_err(db_err)?;
            match rows.next().await.map_err(db_err)? {
                Some(row) => Some(parse_entity_id(&row.get::<String>(0).map_err(db_err)?)?),
                None => None,
            }
        };
        let Some(entity_id) = entity_id else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };

        let id_text = entity_id.to_string();
        for sql in [
            "DELETE FROM canonical_entities WHERE entity_id = ?1",
            "DELETE FROM processing_state WHERE entity_id = ?1",
            "DELETE FROM raw_entities WHERE entity_id = ?1",
            "DELETE FROM ownership WHERE entity_id = ?1",
        ] {
            tx.execute(sql, params![id_text.as_str()])
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(Some(entity_id))
    }

    /// Get a raw entity by id.
    pub async fn get_raw_entity(&self, entity_id: EntityId) -> Result<Option<RawEntity>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT entity_id, provider_id, external_id, payload_json, payload_hash, created_at, updated_at
                 FROM raw_entities WHERE entity_id = ?1",
                params![entity_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_raw_entity(&row)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Processing state (queue)
    // -----------------------------------------------------------------------

    /// Get the processing state of an entity.
    pub async fn get_processing_state(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<ProcessingState>> {
        let conn = self.connect().await?;
        let sql = format!("SELECT {PROCESSING_COLUMNS} FROM processing_state WHERE entity_id = ?1");
        let mut rows = conn
            .query(&sql, params![entity_id.to_string()])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_processing_state(&row)?)),
            None => Ok(None),
        }
    }

    /// Atomically claim the earliest-due entity that is either `unprocessed`
    /// and due, or `claimed` with an expired lease.
    ///
    /// Ordering is `(due_at, enqueue_seq)`. The claim increments the attempt
    /// count and sets the lease; the returned state reflects the claim.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<ProcessingState>> {
        self.check_writable()?;
        let now_ms = millis(now);
        let expires_ms = now_ms.saturating_add(duration_millis(lease));

        let sql = format!(
            "UPDATE processing_state
             SET status = 'claimed',
                 lease_owner = ?1,
                 lease_expires_at_ms = ?2,
                 attempt_count = attempt_count + 1,
                 updated_at = ?3
             WHERE entity_id = (
                 SELECT entity_id FROM processing_state
                 WHERE (status = 'unprocessed' AND due_at_ms <= ?4)
                    OR (status = 'claimed' AND lease_expires_at_ms <= ?4)
                 ORDER BY due_at_ms, enqueue_seq
                 LIMIT 1
             )
             AND ((status = 'unprocessed' AND due_at_ms <= ?4)
                  OR (status = 'claimed' AND lease_expires_at_ms <= ?4))
             RETURNING {PROCESSING_COLUMNS}"
        );

        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &sql,
                params![worker_id, expires_ms, now.to_rfc3339(), now_ms],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_processing_state(&row)?)),
            None => Ok(None),
        }
    }

    /// Extend a lease held by `worker_id`. Returns `false` if the lease was lost.
    pub async fn renew_lease(
        &self,
        entity_id: EntityId,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool> {
        self.check_writable()?;
        let expires_ms = millis(now).saturating_add(duration_millis(lease));
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE processing_state SET lease_expires_at_ms = ?1, updated_at = ?2
                 WHERE entity_id = ?3 AND status = 'claimed' AND lease_owner = ?4",
                params![expires_ms, now.to_rfc3339(), entity_id.to_string(), worker_id],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Mark a claimed entity processed. Returns `false` if `worker_id` no longer holds the lease.
    pub async fn complete_claim(
        &self,
        entity_id: EntityId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE processing_state
                 SET status = 'processed', due_at_ms = NULL, lease_owner = NULL,
                     lease_expires_at_ms = NULL, last_error = NULL, updated_at = ?1
                 WHERE entity_id = ?2 AND status = 'claimed' AND lease_owner = ?3",
                params![now.to_rfc3339(), entity_id.to_string(), worker_id],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Return a claimed entity to the queue, due at `due_at`, keeping its attempt count.
    pub async fn retry_claim(
        &self,
        entity_id: EntityId,
        worker_id: &str,
        due_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE processing_state
                 SET status = 'unprocessed', due_at_ms = ?1, lease_owner = NULL,
                     lease_expires_at_ms = NULL, last_error = ?2, updated_at = ?3
                 WHERE entity_id = ?4 AND status = 'claimed' AND lease_owner = ?5",
                params![
                    millis(due_at),
                    error,
                    now.to_rfc3339(),
                    entity_id.to_string(),
                    worker_id
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Return a claimed entity to the queue without consuming the attempt.
    ///
    /// Used when the run could not be carried through for reasons outside the
    /// entity itself, so the attempt ceiling only counts real processing.
    pub async fn defer_claim(
        &self,
        entity_id: EntityId,
        worker_id: &str,
        due_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE processing_state
                 SET status = 'unprocessed', due_at_ms = ?1, lease_owner = NULL,
                     lease_expires_at_ms = NULL, last_error = ?2, updated_at = ?3,
                     attempt_count = MAX(attempt_count - 1, 0)
                 WHERE entity_id = ?4 AND status = 'claimed' AND lease_owner = ?5",
                params![
                    millis(due_at),
                    error,
                    now.to_rfc3339(),
                    entity_id.to_string(),
                    worker_id
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Dead-letter a claimed entity.
    pub async fn fail_claim(
        &self,
        entity_id: EntityId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE processing_state
                 SET status = 'failed', due_at_ms = NULL, lease_owner = NULL,
                     lease_expires_at_ms = NULL, last_error = ?1, updated_at = ?2
                 WHERE entity_id = ?3 AND status = 'claimed' AND lease_owner = ?4",
                params![error, now.to_rfc3339(), entity_id.to_string(), worker_id],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Move a dead-lettered entity back to the queue with a fresh attempt budget.
    pub async fn requeue_failed(&self, entity_id: EntityId, now: DateTime<Utc>) -> Result<bool> {
        self.check_writable()?;
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE processing_state
                 SET status = 'unprocessed', due_at_ms = ?1, attempt_count = 0,
                     last_error = NULL, updated_at = ?2,
                     enqueue_seq = (SELECT COALESCE(MAX(enqueue_seq), 0) + 1 FROM processing_state)
                 WHERE entity_id = ?3 AND status = 'failed'",
                params![millis(now), now.to_rfc3339(), entity_id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Count entities per processing status.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM processing_state GROUP BY status",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: String = row.get(0).map_err(db_err)?;
            let count = row.get::<i64>(1).map_err(db_err)?.max(0) as u64;
            match status.parse::<ProcessingStatus>().map_err(StitchworkError::Storage)? {
                ProcessingStatus::Unprocessed => stats.unprocessed = count,
                ProcessingStatus::Claimed => stats.claimed = count,
                ProcessingStatus::Processed => stats.processed = count,
                ProcessingStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// List processing states, optionally filtered by status, in queue order.
    pub async fn list_processing(
        &self,
        status: Option<ProcessingStatus>,
        limit: u32,
    ) -> Result<Vec<ProcessingState>> {
        let conn = self.connect().await?;
        let sql = format!(
            "SELECT {PROCESSING_COLUMNS} FROM processing_state
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY due_at_ms, enqueue_seq
             LIMIT ?2"
        );
        let mut rows = conn
            .query(&sql, params![status.map(|s| s.as_str()), i64::from(limit)])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_processing_state(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Canonical entities
    // -----------------------------------------------------------------------

    /// Get the committed canonical version of an entity.
    pub async fn get_canonical(&self, entity_id: EntityId) -> Result<Option<CanonicalEntity>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT entity_id, version, metadata_json, relations_json, errors_json, last_stitched_at
                 FROM canonical_entities WHERE entity_id = ?1",
                params![entity_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_canonical(&row)?)),
            None => Ok(None),
        }
    }

    /// Replace the canonical entity in one transaction, provided the raw entity
    /// still exists, `worker_id` still holds the lease, and the stored version
    /// equals `base_version`.
    pub async fn commit_canonical(
        &self,
        canonical: &CanonicalEntity,
        worker_id: &str,
        base_version: Option<u64>,
    ) -> Result<CommitOutcome> {
        self.check_writable()?;
        let id_text = canonical.entity_id.to_string();
        let metadata_json = serde_json::to_string(&canonical.metadata).map_err(json_err)?;
        let relations_json = serde_json::to_string(&canonical.relations).map_err(json_err)?;
        let errors_json = serde_json::to_string(&canonical.errors).map_err(json_err)?;

        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let raw_exists = {
            let mut rows = tx
                .query(
                    "SELECT 1 FROM raw_entities WHERE entity_id = ?1",
                    params![id_text.as_str()],
                )
                .await
                .map_err(db_err)?;
            rows.next().await.map_err(db_err)?.is_some()
        };
        if !raw_exists {
            tx.rollback().await.map_err(db_err)?;
            return Ok(CommitOutcome::EntityGone);
        }

        let holds_lease = {
            let mut rows = tx
                .query(
                    "SELECT 1 FROM processing_state
                     WHERE entity_id = ?1 AND status = 'claimed' AND lease_owner = ?2",
                    params![id_text.as_str(), worker_id],
                )
                .await
                .map_err(db_err)?;
            rows.next().await.map_err(db_err)?.is_some()
        };
        if !holds_lease {
            tx.rollback().await.map_err(db_err)?;
            return Ok(CommitOutcome::LeaseLost);
        }

        let current = {
            let mut rows = tx
                .query(
                    "SELECT version FROM canonical_entities WHERE entity_id = ?1",
                    params![id_text.as_str()],
                )
                .await
                .map_err(db_err)?;
            match rows.next().await.map_err(db_err)? {
                Some(row) => Some(row.get::<i64>(0).map_err(db_err)? as u64),
                None => None,
            }
        };
        if current != base_version {
            tx.rollback().await.map_err(db_err)?;
            return Ok(CommitOutcome::VersionConflict { current });
        }

        tx.execute(
            "INSERT INTO canonical_entities
               (entity_id, version, metadata_json, relations_json, errors_json, last_stitched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(entity_id) DO UPDATE SET
               version = excluded.version,
               metadata_json = excluded.metadata_json,
               relations_json = excluded.relations_json,
               errors_json = excluded.errors_json,
               last_stitched_at = excluded.last_stitched_at",
            params![
                id_text.as_str(),
                canonical.version as i64,
                metadata_json.as_str(),
                relations_json.as_str(),
                errors_json.as_str(),
                canonical.last_stitched_at.to_rfc3339()
            ],
        )
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(CommitOutcome::Committed)
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> StitchworkError {
    StitchworkError::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> StitchworkError {
    StitchworkError::Storage(format!("invalid JSON column: {e}"))
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StitchworkError::Storage(format!("timestamp out of range: {ms}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StitchworkError::Storage(format!("invalid date: {e}")))
}

fn parse_entity_id(s: &str) -> Result<EntityId> {
    s.parse()
        .map_err(|e| StitchworkError::Storage(format!("invalid entity id '{s}': {e}")))
}

/// Convert a `raw_entities` row to a [`RawEntity`].
fn row_to_raw_entity(row: &libsql::Row) -> Result<RawEntity> {
    let payload_json: String = row.get(3).map_err(db_err)?;
    Ok(RawEntity {
        entity_id: parse_entity_id(&row.get::<String>(0).map_err(db_err)?)?,
        provider_id: row.get::<String>(1).map_err(db_err)?,
        external_id: row.get::<String>(2).map_err(db_err)?,
        payload: serde_json::from_str(&payload_json).map_err(json_err)?,
        payload_hash: row.get::<String>(4).map_err(db_err)?,
        created_at: parse_timestamp(&row.get::<String>(5).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

/// Convert a row selected with [`PROCESSING_COLUMNS`] to a [`ProcessingState`].
fn row_to_processing_state(row: &libsql::Row) -> Result<ProcessingState> {
    let status: String = row.get(1).map_err(db_err)?;
    Ok(ProcessingState {
        entity_id: parse_entity_id(&row.get::<String>(0).map_err(db_err)?)?,
        status: status.parse().map_err(StitchworkError::Storage)?,
        due_at: row.get::<i64>(2).ok().map(from_millis).transpose()?,
        attempt_count: row.get::<i64>(3).map_err(db_err)?.max(0) as u32,
        lease_owner: row.get::<String>(4).ok(),
        lease_expires_at: row.get::<i64>(5).ok().map(from_millis).transpose()?,
        last_error: row.get::<String>(6).ok(),
        enqueue_seq: row.get::<i64>(7).map_err(db_err)?,
        updated_at: parse_timestamp(&row.get::<String>(8).map_err(db_err)?)?,
    })
}

/// Convert a `canonical_entities` row to a [`CanonicalEntity`].
fn row_to_canonical(row: &libsql::Row) -> Result<CanonicalEntity> {
    let metadata_json: String = row.get(2).map_err(db_err)?;
    let relations_json: String = row.get(3).map_err(db_err)?;
    let errors_json: String = row.get(4).map_err(db_err)?;
    Ok(CanonicalEntity {
        entity_id: parse_entity_id(&row.get::<String>(0).map_err(db_err)?)?,
        version: row.get::<i64>(1).map_err(db_err)?.max(0) as u64,
        metadata: serde_json::from_str(&metadata_json).map_err(json_err)?,
        relations: serde_json::from_str(&relations_json).map_err(json_err)?,
        errors: serde_json::from_str(&errors_json).map_err(json_err)?,
        last_stitched_at: parse_timestamp(&row.get::<String>(5).map_err(db_err)?)?,
    })
}
