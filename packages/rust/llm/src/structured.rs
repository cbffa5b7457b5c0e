//! Schema-guided structured extraction on top of any [`TextOracle`].
//!
//! The prompt is extended with format instructions carrying a JSON schema,
//! the backend is asked for JSON, and the answer is validated with serde.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use specextract_shared::{ITEM_FIELD_LABELS, ItemList, Result, SpecExtractError, strip_optional_fence};

use crate::oracle::{CompletionRequest, StructuredOracle, TextOracle};

/// Longest slice of an invalid answer quoted in a validation error.
const MAX_QUOTED_ANSWER: usize = 200;

/// Answer shape for yes/no classification.
#[derive(Debug, Deserialize)]
struct DocumentValidationResult {
    is_valid: bool,
}

static VERDICT_SCHEMA: LazyLock<serde_json::Value> = LazyLock::new(|| {
    serde_json::json!({
        "title": "DocumentValidationResult",
        "description": "Result of document validation.",
        "type": "object",
        "properties": {
            "is_valid": {"title": "Is Valid", "type": "boolean"}
        },
        "required": ["is_valid"]
    })
});

static ITEM_LIST_SCHEMA: LazyLock<serde_json::Value> = LazyLock::new(item_list_schema);

/// JSON schema of [`ItemList`], built from the field label table.
pub fn item_list_schema() -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    for label in ITEM_FIELD_LABELS {
        let schema = match label {
            "Наименование" => serde_json::json!({"type": "string"}),
            "Количество" => serde_json::json!({"type": ["number", "null"]}),
            "Наличие аналогов" => serde_json::json!({
                "anyOf": [{"type": "string", "enum": ["Да", "Нет"]}, {"type": "null"}]
            }),
            _ => serde_json::json!({"type": ["string", "null"]}),
        };
        properties.insert(label.to_string(), schema);
    }

    serde_json::json!({
        "title": "ItemList",
        "description": "A List of items from procurement technical specification.",
        "type": "array",
        "items": {
            "title": "Item",
            "description": "An item from procurement technical specification.",
            "type": "object",
            "properties": properties,
            "required": ITEM_FIELD_LABELS,
        }
    })
}

/// Format instructions appended to every structured prompt.
pub fn format_instructions(schema: &serde_json::Value) -> String {
    let schema_str = serde_json::to_string(schema).unwrap_or_default();
    format!(
        "The output should be formatted as a JSON instance that conforms to the JSON schema below.\n\n\
         Here is the output schema:\n```\n{schema_str}\n```"
    )
}

/// Parse a model answer as `T`, tolerating a surrounding code fence.
pub fn parse_answer<T: DeserializeOwned>(answer: &str) -> Result<T> {
    if let Ok(value) = serde_json::from_str(answer.trim()) {
        return Ok(value);
    }
    let body = strip_optional_fence(answer);
    serde_json::from_str(body).map_err(|e| {
        let quoted: String = body.chars().take(MAX_QUOTED_ANSWER).collect();
        SpecExtractError::schema(format!("{e} (answer: {quoted})"))
    })
}

/// [`StructuredOracle`] implemented with prompt-level schemas.
#[derive(Clone)]
pub struct SchemaOracle {
    inner: Arc<dyn TextOracle>,
}

impl SchemaOracle {
    pub fn new(inner: Arc<dyn TextOracle>) -> Self {
        Self { inner }
    }

    async fn ask<T: DeserializeOwned + Send>(&self, prompt: &str, schema: &serde_json::Value) -> Result<T> {
        let full_prompt = format!("{prompt}\n{}", format_instructions(schema));
        let request = CompletionRequest::prompt(full_prompt).expect_json();
        let completion = self.inner.complete(&request).await?;
        debug!(answer_len = completion.text.len(), "structured answer received");
        parse_answer(&completion.text)
    }
}

#[async_trait]
impl StructuredOracle for SchemaOracle {
    #[instrument(skip_all, fields(model = %self.inner.model()))]
    async fn classify(&self, prompt: &str) -> Result<bool> {
        let verdict: DocumentValidationResult = self.ask(prompt, &VERDICT_SCHEMA).await?;
        Ok(verdict.is_valid)
    }

    #[instrument(skip_all, fields(model = %self.inner.model()))]
    async fn extract_items(&self, prompt: &str) -> Result<ItemList> {
        self.ask(prompt, &ITEM_LIST_SCHEMA).await
    }
}
