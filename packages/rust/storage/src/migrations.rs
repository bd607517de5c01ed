//! SQL migration definitions for the Stitchwork entity store.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: raw_entities, ownership, processing_state, canonical_entities",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Provider records, one per owned identity
CREATE TABLE IF NOT EXISTS raw_entities (
    entity_id    TEXT PRIMARY KEY,
    provider_id  TEXT NOT NULL,
    external_id  TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

-- (provider_id, external_id) -> entity_id
CREATE TABLE IF NOT EXISTS ownership (
    provider_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    entity_id   TEXT NOT NULL UNIQUE,
    PRIMARY KEY (provider_id, external_id)
);

-- Queue and lease bookkeeping. Timestamps used for ordering are unix millis.
CREATE TABLE IF NOT EXISTS processing_state (
    entity_id           TEXT PRIMARY KEY,
    status              TEXT NOT NULL
                        CHECK (status IN ('unprocessed', 'claimed', 'processed', 'failed')),
    due_at_ms           INTEGER,
    attempt_count       INTEGER NOT NULL DEFAULT 0,
    lease_owner         TEXT,
    lease_expires_at_ms INTEGER,
    last_error          TEXT,
    enqueue_seq         INTEGER NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processing_due
    ON processing_state(status, due_at_ms, enqueue_seq);
CREATE INDEX IF NOT EXISTS idx_processing_lease
    ON processing_state(status, lease_expires_at_ms);

-- Stitched, externally visible state
CREATE TABLE IF NOT EXISTS canonical_entities (
    entity_id        TEXT PRIMARY KEY,
    version          INTEGER NOT NULL,
    metadata_json    TEXT NOT NULL,
    relations_json   TEXT NOT NULL,
    errors_json      TEXT NOT NULL,
    last_stitched_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
