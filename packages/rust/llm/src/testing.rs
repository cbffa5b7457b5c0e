//! Testing utilities: a scripted oracle.
//!
//! Useful for exercising the workflow without making real model calls.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use specextract_shared::{Result, SpecExtractError};

use crate::oracle::{Completion, CompletionRequest, TextOracle};

/// A [`TextOracle`] that replays queued answers in order and records every
/// request it receives.
pub struct ScriptedOracle {
    model: String,
    replies: Mutex<VecDeque<Result<Completion>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedOracle {
    /// Create an oracle with an empty script.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a completion.
    pub fn with_completion(self, completion: Completion) -> Self {
        self.lock_replies().push_back(Ok(completion));
        self
    }

    /// Queue a plain text answer.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_completion(Completion::text(text))
    }

    /// Queue an answer that also calls `tool`.
    pub fn with_tool_call(self, text: impl Into<String>, tool: impl Into<String>) -> Self {
        self.with_completion(Completion::with_tool_call(text, tool))
    }

    /// Queue a failure.
    pub fn with_error(self, error: SpecExtractError) -> Self {
        self.lock_replies().push_back(Err(error));
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of queued answers not yet consumed.
    pub fn remaining(&self) -> usize {
        self.lock_replies().len()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Completion>>> {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TextOracle for ScriptedOracle {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        self.lock_replies().pop_front().unwrap_or_else(|| {
            Err(SpecExtractError::Oracle(
                "scripted oracle has no answers left".into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_fails() {
        let oracle = ScriptedOracle::new("m")
            .with_text("one")
            .with_tool_call("two", "transfer_to_reviewer");

        let a = oracle.complete(&CompletionRequest::prompt("a")).await.unwrap();
        let b = oracle.complete(&CompletionRequest::prompt("b")).await.unwrap();
        assert_eq!(a.text, "one");
        assert!(b.calls_tool("transfer_to_reviewer"));
        assert!(oracle.complete(&CompletionRequest::prompt("c")).await.is_err());
        assert_eq!(oracle.requests().len(), 3);
        assert_eq!(oracle.remaining(), 0);
    }

    #[tokio::test]
    async fn transform_joins_instruction_and_text() {
        let oracle = ScriptedOracle::new("m").with_text("done");
        let out = oracle.transform("Convert this.", "<p>x</p>").await.unwrap();
        assert_eq!(out, "done");
        assert_eq!(
            oracle.requests()[0].messages[0].content,
            "Convert this.\n\n<p>x</p>"
        );
    }
}
