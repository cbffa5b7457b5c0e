//! Refinement transcript checkpoints.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use specextract_shared::{Result, SpecExtractError};
use specextract_storage::{CheckpointRow, Storage};

use crate::swarm::{AgentRole, TranscriptMessage};

/// Transcript state after a completed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub document_key: String,
    pub model: String,
    /// Role that acts next.
    pub active_role: AgentRole,
    pub turns: u32,
    pub transcript: Vec<TranscriptMessage>,
}

/// Persists checkpoints keyed by session id.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn discard(&self, session_id: &str) -> Result<()>;
}

/// Process-local checkpoints; lost on exit.
#[derive(Default)]
pub struct MemoryCheckpointer {
    sessions: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointer {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Checkpoint>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lock().get(session_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.lock()
            .insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn discard(&self, session_id: &str) -> Result<()> {
        self.lock().remove(session_id);
        Ok(())
    }
}

#[async_trait]
impl Checkpointer for Storage {
    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        self.get_checkpoint(session_id)
            .await?
            .map(checkpoint_from_row)
            .transpose()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let transcript = serde_json::to_string(&checkpoint.transcript)
            .map_err(|e| SpecExtractError::Storage(format!("failed to encode transcript: {e}")))?;
        self.put_checkpoint(
            &checkpoint.session_id,
            &checkpoint.document_key,
            &checkpoint.model,
            checkpoint.active_role.as_str(),
            checkpoint.turns,
            &transcript,
        )
        .await
    }

    async fn discard(&self, session_id: &str) -> Result<()> {
        self.delete_checkpoint(session_id).await
    }
}

fn checkpoint_from_row(row: CheckpointRow) -> Result<Checkpoint> {
    let transcript = serde_json::from_str(&row.transcript_json).map_err(|e| {
        SpecExtractError::Storage(format!(
            "corrupt transcript for session {}: {e}",
            row.session_id
        ))
    })?;
    Ok(Checkpoint {
        active_role: row.active_role.parse()?,
        session_id: row.session_id,
        document_key: row.document_key,
        model: row.model_id,
        turns: row.turns,
        transcript,
    })
}
