//! Oracle traits: the only way the workflow talks to a model.
//!
//! A [`TextOracle`] turns a chat request into free-form text (plus optional
//! tool calls). A [`StructuredOracle`] turns a prompt into a value of a fixed
//! schema or fails with a validation error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use specextract_shared::{ItemList, Result};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Author of a chat message as seen by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message of a chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A function the model may call instead of (or besides) answering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments; `None` for argument-less tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl ToolSpec {
    /// A tool that takes no arguments.
    pub fn no_args(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
        }
    }
}

/// A tool invocation returned by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Token accounting for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A chat completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionRequest {
    /// Fixed instruction for the acting role.
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// Ask the backend for a bare JSON answer when it supports that.
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Single user message request.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(text)])
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn expect_json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// A backend's answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
}

impl Completion {
    /// A plain text answer with no tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// A text answer that also calls `tool` with no arguments.
    pub fn with_tool_call(text: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: vec![ToolCall {
                name: tool.into(),
                arguments: serde_json::Value::Object(Default::default()),
            }],
            usage: Usage::default(),
        }
    }

    /// Whether the model invoked the named tool.
    pub fn calls_tool(&self, name: &str) -> bool {
        self.tool_calls.iter().any(|c| c.name == name)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Free-form text generation.
#[async_trait]
pub trait TextOracle: Send + Sync {
    /// Model identifier; used to key artifacts on disk.
    fn model(&self) -> &str;

    /// Run one chat completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Apply `instruction` to `text` and return the raw reply text.
    async fn transform(&self, instruction: &str, text: &str) -> Result<String> {
        let request = CompletionRequest::prompt(format!("{instruction}\n\n{text}"));
        Ok(self.complete(&request).await?.text)
    }
}

/// Schema-constrained extraction.
#[async_trait]
pub trait StructuredOracle: Send + Sync {
    /// Answer a yes/no question about the text in `prompt`.
    async fn classify(&self, prompt: &str) -> Result<bool>;

    /// Extract the item list described by `prompt`.
    async fn extract_items(&self, prompt: &str) -> Result<ItemList>;
}
