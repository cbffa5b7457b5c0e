//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding refinement-loop
//! checkpoints, so an interrupted extractor/reviewer conversation can resume
//! where it stopped instead of starting over.

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use specextract_shared::{Result, SpecExtractError};

/// A persisted refinement transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRow {
    pub session_id: String,
    /// Logical document name (output key).
    pub document_key: String,
    pub model_id: String,
    /// Role holding control when the row was written.
    pub active_role: String,
    pub turns: u32,
    /// Serialized transcript messages.
    pub transcript_json: String,
    pub updated_at: String,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

fn storage_err(e: libsql::Error) -> SpecExtractError {
    SpecExtractError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SpecExtractError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SpecExtractError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
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

    // -----------------------------------------------------------------------
    // Checkpoint operations
    // -----------------------------------------------------------------------

    /// Load the checkpoint for a session, if any.
    pub async fn get_checkpoint(&self, session_id: &str) -> Result<Option<CheckpointRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_id, document_key, model_id, active_role, turns, transcript_json, updated_at
                 FROM swarm_checkpoints WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(CheckpointRow {
                session_id: row.get::<String>(0).map_err(storage_err)?,
                document_key: row.get::<String>(1).map_err(storage_err)?,
                model_id: row.get::<String>(2).map_err(storage_err)?,
                active_role: row.get::<String>(3).map_err(storage_err)?,
                turns: row.get::<u32>(4).map_err(storage_err)?,
                transcript_json: row.get::<String>(5).map_err(storage_err)?,
                updated_at: row.get::<String>(6).map_err(storage_err)?,
            })),
            None => Ok(None),
        }
    }

    /// Insert or replace the checkpoint for a session.
    pub async fn put_checkpoint(
        &self,
        session_id: &str,
        document_key: &str,
        model_id: &str,
        active_role: &str,
        turns: u32,
        transcript_json: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO swarm_checkpoints
                   (session_id, document_key, model_id, active_role, turns, transcript_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(session_id) DO UPDATE SET
                   active_role = excluded.active_role,
                   turns = excluded.turns,
                   transcript_json = excluded.transcript_json,
                   updated_at = excluded.updated_at",
                params![
                    session_id,
                    document_key,
                    model_id,
                    active_role,
                    turns,
                    transcript_json,
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Drop the checkpoint for a session. Missing rows are not an error.
    pub async fn delete_checkpoint(&self, session_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM swarm_checkpoints WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// List all stored checkpoints, most recently updated first.
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_id, document_key, model_id, active_role, turns, transcript_json, updated_at
                 FROM swarm_checkpoints ORDER BY updated_at DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            out.push(CheckpointRow {
                session_id: row.get::<String>(0).map_err(storage_err)?,
                document_key: row.get::<String>(1).map_err(storage_err)?,
                model_id: row.get::<String>(2).map_err(storage_err)?,
                active_role: row.get::<String>(3).map_err(storage_err)?,
                turns: row.get::<u32>(4).map_err(storage_err)?,
                transcript_json: row.get::<String>(5).map_err(storage_err)?,
                updated_at: row.get::<String>(6).map_err(storage_err)?,
            });
        }
        Ok(out)
    }

    /// Remove every checkpoint; returns how many were deleted.
    pub async fn clear_checkpoints(&self) -> Result<u64> {
        self.conn
            .execute("DELETE FROM swarm_checkpoints", params![])
            .await
            .map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("se_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("se_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn checkpoint_upsert_and_delete() {
        let storage = test_storage().await;

        assert!(storage.get_checkpoint("s1").await.unwrap().is_none());

        storage
            .put_checkpoint("s1", "doc", "gemini", "reviewer", 1, "[]")
            .await
            .expect("put");
        let row = storage.get_checkpoint("s1").await.unwrap().expect("row");
        assert_eq!(row.active_role, "reviewer");
        assert_eq!(row.turns, 1);

        storage
            .put_checkpoint("s1", "doc", "gemini", "extractor", 2, "[{}]")
            .await
            .expect("update");
        let row = storage.get_checkpoint("s1").await.unwrap().expect("row");
        assert_eq!(row.active_role, "extractor");
        assert_eq!(row.turns, 2);
        assert_eq!(row.transcript_json, "[{}]");
        assert_eq!(storage.list_checkpoints().await.unwrap().len(), 1);

        storage.delete_checkpoint("s1").await.expect("delete");
        assert!(storage.get_checkpoint("s1").await.unwrap().is_none());
        storage.delete_checkpoint("s1").await.expect("delete twice");
    }

    #[tokio::test]
    async fn clear_removes_all() {
        let storage = test_storage().await;
        storage.put_checkpoint("a", "d1", "m", "extractor", 0, "[]").await.unwrap();
        storage.put_checkpoint("b", "d2", "m", "extractor", 0, "[]").await.unwrap();
        assert_eq!(storage.clear_checkpoints().await.unwrap(), 2);
        assert!(storage.list_checkpoints().await.unwrap().is_empty());
    }
}
