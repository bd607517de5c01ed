//! Core domain types for the Stitchwork orchestrator.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Merged metadata: field name → JSON value. Ordered so that equality and
/// serialization are deterministic across runs.
pub type Metadata = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for internal entity identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Generate a new time-sortable entity identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Raw entities & ownership
// ---------------------------------------------------------------------------

/// A raw record as emitted by its owning provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    /// Internal identifier assigned at first emit.
    pub entity_id: EntityId,
    /// Provider that owns this record.
    pub provider_id: String,
    /// Identifier within the provider's namespace.
    pub external_id: String,
    /// Opaque provider payload.
    pub payload: Value,
    /// SHA-256 of the serialized payload.
    pub payload_hash: String,
    /// When the identity was first emitted.
    pub created_at: DateTime<Utc>,
    /// When the payload was last replaced.
    pub updated_at: DateTime<Utc>,
}

/// Maps a provider-scoped identity to its internal entity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub provider_id: String,
    pub external_id: String,
    pub entity_id: EntityId,
}

/// Hex SHA-256 of a payload's JSON serialization.
pub fn payload_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Processing state
// ---------------------------------------------------------------------------

/// Queue status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Unprocessed,
    Claimed,
    Processed,
    Failed,
}

impl ProcessingStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Claimed => "claimed",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unprocessed" => Ok(Self::Unprocessed),
            "claimed" => Ok(Self::Claimed),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown processing status '{other}'")),
        }
    }
}

/// Scheduling and lease bookkeeping for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub entity_id: EntityId,
    pub status: ProcessingStatus,
    /// When the entity becomes claimable; `None` once processed or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Number of claims since the last external update.
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Insertion-order tie-break for entities due at the same instant.
    pub enqueue_seq: i64,
    pub updated_at: DateTime<Utc>,
}

/// Per-status entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub unprocessed: u64,
    pub claimed: u64,
    pub processed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Relations & errors
// ---------------------------------------------------------------------------

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub from: EntityId,
    #[serde(rename = "type")]
    pub kind: String,
    pub to: EntityId,
}

impl Relation {
    pub fn new(from: EntityId, kind: impl Into<String>, to: EntityId) -> Self {
        Self {
            from,
            kind: kind.into(),
            to,
        }
    }
}

/// Severity of a processor-reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Presumed recoverable; the entity is retried with backoff.
    Transient,
    /// Unrecoverable input; the entity is dead-lettered immediately.
    Fatal,
}

/// An error attributed to a single processor, surfaced on the canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityError {
    pub processor_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl EntityError {
    pub fn transient(processor_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(processor_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            kind: ErrorKind::Fatal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EntityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{} ({kind}): {}", self.processor_id, self.message)
    }
}

// ---------------------------------------------------------------------------
// CanonicalEntity
// ---------------------------------------------------------------------------

/// The stitched, externally visible version of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub entity_id: EntityId,
    /// Starts at 1, incremented on every committed stitch.
    pub version: u64,
    pub metadata: Metadata,
    pub relations: BTreeSet<Relation>,
    pub errors: Vec<EntityError>,
    pub last_stitched_at: DateTime<Utc>,
}
