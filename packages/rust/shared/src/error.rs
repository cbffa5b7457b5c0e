//! Error types for specextract.
//!
//! Library crates use [`SpecExtractError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all specextract operations.
#[derive(Debug, thiserror::Error)]
pub enum SpecExtractError {
    /// The validation gate classified the input as something other than a
    /// procurement technical specification.
    #[error("not a procurement technical specification: {message}")]
    NotATargetDocument { message: String },

    /// A model reply did not contain the expected fenced payload.
    #[error("malformed model output: {message}")]
    MalformedModelOutput { message: String },

    /// A model answer could not be coerced into the target schema.
    #[error("schema validation error: {message}")]
    SchemaValidation { message: String },

    /// Configuration loading or validation error (fatal at startup).
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP transport error while talking to a model backend.
    #[error("network error: {0}")]
    Network(String),

    /// A model backend answered, but with an error status or an unusable body.
    #[error("oracle error: {0}")]
    Oracle(String),

    /// Database or checkpoint storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Workflow engine invariant violation.
    #[error("workflow error: {0}")]
    Workflow(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpecExtractError>;

impl SpecExtractError {
    /// Create a gate-failure error.
    pub fn not_target(msg: impl Into<String>) -> Self {
        Self::NotATargetDocument {
            message: msg.into(),
        }
    }

    /// Create a malformed-output error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedModelOutput {
            message: msg.into(),
        }
    }

    /// Create a schema validation error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaValidation {
            message: msg.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-friendly tag for logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotATargetDocument { .. } => "not_a_target_document",
            Self::MalformedModelOutput { .. } => "malformed_model_output",
            Self::SchemaValidation { .. } => "schema_validation",
            Self::Config { .. } => "config",
            Self::Network(_) => "network",
            Self::Oracle(_) => "oracle",
            Self::Storage(_) => "storage",
            Self::Io { .. } => "io",
            Self::Workflow(_) => "workflow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = SpecExtractError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = SpecExtractError::malformed("no ```markdown block");
        assert!(err.to_string().starts_with("malformed model output"));
    }

    #[test]
    fn kind_tags() {
        assert_eq!(
            SpecExtractError::not_target("x").kind(),
            "not_a_target_document"
        );
        assert_eq!(SpecExtractError::schema("x").kind(), "schema_validation");
        assert_eq!(SpecExtractError::Workflow("x".into()).kind(), "workflow");
    }
}
