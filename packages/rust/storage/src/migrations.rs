//! SQL migration definitions for the specextract checkpoint database.
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
        description: "Initial schema: swarm_checkpoints",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Refinement loop transcripts, one row per session
CREATE TABLE IF NOT EXISTS swarm_checkpoints (
    session_id      TEXT PRIMARY KEY,
    document_key    TEXT NOT NULL,
    model_id        TEXT NOT NULL,
    active_role     TEXT NOT NULL,
    turns           INTEGER NOT NULL,
    transcript_json TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_swarm_checkpoints_document ON swarm_checkpoints(document_key);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
