//! Model backends for specextract.
//!
//! The workflow only sees the two oracle traits:
//! - [`TextOracle`] — free-form completions with optional tool calls
//! - [`StructuredOracle`] — schema-validated answers ([`SchemaOracle`])
//!
//! Concrete backends: [`GeminiClient`] and [`MistralClient`].

pub mod gemini;
mod http;
pub mod mistral;
pub mod oracle;
pub mod provider;
pub mod structured;
pub mod testing;

pub use gemini::GeminiClient;
pub use mistral::MistralClient;
pub use oracle::{
    ChatMessage, ChatRole, Completion, CompletionRequest, StructuredOracle, TextOracle,
    ToolCall, ToolSpec, Usage,
};
pub use provider::Oracles;
pub use structured::{SchemaOracle, item_list_schema};
