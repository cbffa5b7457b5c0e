//! Extractor/Reviewer refinement loop.
//!
//! Two roles take turns on one shared transcript. Control moves only through
//! handoff tools: the Extractor calls `transfer_to_reviewer` to ask for a
//! review, the Reviewer always hands back. The loop converges on the first
//! Extractor turn that answers without handing off. A turn budget shared by
//! both roles bounds the loop; running out is reported as
//! [`RefinementStatus::Exhausted`] and the last Extractor message is used.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use specextract_llm::{ChatMessage, ChatRole, CompletionRequest, TextOracle, ToolSpec};
use specextract_shared::{ITEM_FIELD_LABELS, Result, SpecExtractError};

use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::observe::{Observer, SilentObserver, WorkflowEvent};

pub const TRANSFER_TO_REVIEWER: &str = "transfer_to_reviewer";
pub const TRANSFER_TO_EXTRACTOR: &str = "transfer_to_extractor";

/// Default turn budget, counting turns of both roles.
pub const DEFAULT_MAX_TURNS: u32 = 8;

/// A participant of the refinement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Extractor,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extractor => "extractor",
            Self::Reviewer => "reviewer",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Extractor => Self::Reviewer,
            Self::Reviewer => Self::Extractor,
        }
    }

    /// The tool this role calls to pass control on.
    pub fn handoff_tool(&self) -> ToolSpec {
        match self {
            Self::Extractor => ToolSpec::no_args(
                TRANSFER_TO_REVIEWER,
                "Transfer control to the reviewer agent for feedback on the item list.",
            ),
            Self::Reviewer => ToolSpec::no_args(
                TRANSFER_TO_EXTRACTOR,
                "Transfer control back to the extractor agent.",
            ),
        }
    }

    pub fn instructions(&self) -> String {
        match self {
            Self::Extractor => extractor_prompt(),
            Self::Reviewer => reviewer_prompt(),
        }
    }
}

impl FromStr for AgentRole {
    type Err = SpecExtractError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extractor" => Ok(Self::Extractor),
            "reviewer" => Ok(Self::Reviewer),
            other => Err(SpecExtractError::Workflow(format!("unknown agent role '{other}'"))),
        }
    }
}

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Extractor,
    Reviewer,
}

impl Author {
    fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Extractor => "Extractor",
            Self::Reviewer => "Reviewer",
        }
    }
}

impl From<AgentRole> for Author {
    fn from(role: AgentRole) -> Self {
        match role {
            AgentRole::Extractor => Self::Extractor,
            AgentRole::Reviewer => Self::Reviewer,
        }
    }
}

/// One entry of the shared, append-only transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub author: Author,
    pub content: String,
}

impl TranscriptMessage {
    pub fn new(author: Author, content: impl Into<String>) -> Self {
        Self {
            author,
            content: content.into(),
        }
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStatus {
    Converged,
    /// Turn budget used up; the last Extractor message stands.
    Exhausted,
}

impl RefinementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Reported alongside a successful refinement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefinementSummary {
    pub status: RefinementStatus,
    pub turns: u32,
    pub session_id: String,
    /// Whether the loop continued from a stored checkpoint.
    pub resumed: bool,
}

#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub text: String,
    pub summary: RefinementSummary,
}

/// The refinement loop, bound to one text oracle.
pub struct Swarm {
    oracle: Arc<dyn TextOracle>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    observer: Arc<dyn Observer>,
    max_turns: u32,
}

impl Swarm {
    pub fn new(oracle: Arc<dyn TextOracle>, max_turns: u32) -> Self {
        Self {
            oracle,
            checkpointer: None,
            observer: Arc::new(SilentObserver),
            max_turns,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    /// Run the loop over `markdown` until it converges or the budget is spent.
    #[instrument(skip_all, fields(%run_id, key = %document_key, max_turns = self.max_turns))]
    pub async fn refine(
        &self,
        run_id: Uuid,
        document_key: &str,
        markdown: &str,
    ) -> Result<RefinementOutcome> {
        let session_id = session_id(self.oracle.model(), document_key, markdown);

        let (mut transcript, mut active, mut turns, resumed) = match self.load(&session_id).await {
            Some(cp) => {
                info!(session_id = %session_id, turns = cp.turns, "resuming refinement from checkpoint");
                (cp.transcript, cp.active_role, cp.turns, true)
            }
            None => (
                vec![TranscriptMessage::new(Author::User, seed_message(markdown))],
                AgentRole::Extractor,
                0,
                false,
            ),
        };

        let mut final_answer = None;

        while turns < self.max_turns {
            let request = CompletionRequest::new(render(&transcript, active))
                .with_system(active.instructions())
                .with_tools(vec![active.handoff_tool()]);

            let completion = self.oracle.complete(&request).await?;
            turns += 1;

            // The reviewer hands back whether or not it called its tool
            let handoff = match active {
                AgentRole::Extractor => completion.calls_tool(TRANSFER_TO_REVIEWER),
                AgentRole::Reviewer => true,
            };

            debug!(role = active.as_str(), turn = turns, handoff, "swarm turn");
            transcript.push(TranscriptMessage::new(active.into(), completion.text.clone()));

            self.observer.on_event(&WorkflowEvent::SwarmTurn {
                run_id,
                session_id: session_id.clone(),
                role: active,
                turn: turns,
                handoff,
            });

            if !handoff {
                final_answer = Some(completion.text);
                break;
            }

            active = active.other();
            self.save(Checkpoint {
                session_id: session_id.clone(),
                document_key: document_key.to_string(),
                model: self.oracle.model().to_string(),
                active_role: active,
                turns,
                transcript: transcript.clone(),
            })
            .await;
        }

        let status = if final_answer.is_some() {
            RefinementStatus::Converged
        } else {
            warn!(turns, max_turns = self.max_turns, "refinement turn budget exhausted");
            RefinementStatus::Exhausted
        };

        self.discard(&session_id).await;

        let text = final_answer
            .filter(|t| !t.trim().is_empty())
            .or_else(|| last_extractor_message(&transcript))
            .unwrap_or_else(|| markdown.to_string());

        self.observer.on_event(&WorkflowEvent::RefinementFinished {
            run_id,
            session_id: session_id.clone(),
            status,
            turns,
        });
        info!(status = status.as_str(), turns, "refinement finished");

        Ok(RefinementOutcome {
            text,
            summary: RefinementSummary {
                status,
                turns,
                session_id,
                resumed,
            },
        })
    }

    // Checkpoint failures only cost resumability, so they are logged and ignored.

    async fn load(&self, session_id: &str) -> Option<Checkpoint> {
        let checkpointer = self.checkpointer.as_ref()?;
        match checkpointer.load(session_id).await {
            Ok(cp) => cp,
            Err(e) => {
                warn!(error = %e, "failed to load checkpoint, starting fresh");
                None
            }
        }
    }

    async fn save(&self, checkpoint: Checkpoint) {
        if let Some(checkpointer) = &self.checkpointer {
            if let Err(e) = checkpointer.save(&checkpoint).await {
                warn!(error = %e, "failed to save checkpoint");
            }
        }
    }

    async fn discard(&self, session_id: &str) {
        if let Some(checkpointer) = &self.checkpointer {
            if let Err(e) = checkpointer.discard(session_id).await {
                warn!(error = %e, "failed to discard checkpoint");
            }
        }
    }
}

/// Stable id for one (model, document, text) refinement session.
pub fn session_id(model: &str, document_key: &str, markdown: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [model, document_key, markdown] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

fn field_list() -> String {
    ITEM_FIELD_LABELS
        .iter()
        .map(|label| format!("- {label}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn extractor_prompt() -> String {
    format!(
        "You are an extractor agent. Your task is to extract the item list from the procurement \
         technical specification. Always pass the list to the reviewer agent before finishing the \
         work. If reviewer agent has no objections, then provide the final item list.\n\n\
         This is the list of the things to be extracted (some of them might be missing in the \
         technical specification):\n\n{}",
        field_list()
    )
}

pub fn reviewer_prompt() -> String {
    format!(
        "You are a reviewer agent. Your task is to review the extracted item list from the \
         procurement technical specification and provide feedback. Check if anything is missing \
         from the original technical specification, if there are any typos or other kinds of \
         errors. Always transfer to extractor agent, even if there are no issues.\n\n\
         This is the list of the things that should be extracted (some of them might be missing \
         in the technical specification):\n\n{}\n\n\
         Your feedback should be concise, provide a list of issues or tell that everything is fine.",
        field_list()
    )
}

pub fn seed_message(markdown: &str) -> String {
    format!("Procurement technical specification:\n\n```markdown\n{markdown}\n```\n")
}

/// Render the transcript as seen by `acting`: its own messages are assistant
/// turns, everything else is user input labelled with its author. Adjacent
/// messages with the same chat role are merged.
fn render(transcript: &[TranscriptMessage], acting: AgentRole) -> Vec<ChatMessage> {
    let own = Author::from(acting);
    let mut out: Vec<ChatMessage> = Vec::with_capacity(transcript.len());

    for msg in transcript {
        let content = if msg.content.trim().is_empty() {
            "(handed off without a message)"
        } else {
            msg.content.as_str()
        };
        let (role, content) = match msg.author {
            Author::User => (ChatRole::User, content.to_string()),
            author if author == own => (ChatRole::Assistant, content.to_string()),
            author => (ChatRole::User, format!("{}: {content}", author.label())),
        };

        match out.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&content);
            }
            _ => out.push(ChatMessage { role, content }),
        }
    }
    out
}

fn last_extractor_message(transcript: &[TranscriptMessage]) -> Option<String> {
    transcript
        .iter()
        .rev()
        .find(|m| m.author == Author::Extractor && !m.content.trim().is_empty())
        .map(|m| m.content.clone())
}
