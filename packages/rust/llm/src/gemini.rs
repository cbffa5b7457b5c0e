//! Google Gemini backend (`generateContent` REST API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use specextract_shared::{Result, SpecExtractError};

use crate::http::{build_client, error_for_status};
use crate::oracle::{ChatRole, Completion, CompletionRequest, TextOracle, ToolCall, Usage};

/// Public Gemini endpoint.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolGroup>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

fn text_part(text: &str) -> Part {
    Part {
        text: Some(text.to_string()),
        function_call: None,
    }
}

impl GenerateRequest {
    fn from_request(request: &CompletionRequest) -> Self {
        let contents = request
            .messages
            .iter()
            .map(|m| Content {
                role: Some(
                    match m.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "model",
                    }
                    .to_string(),
                ),
                parts: vec![text_part(&m.content)],
            })
            .collect();

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolGroup {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        // Gemini rejects a JSON mime type combined with function calling.
        let response_mime_type =
            (request.json_output && request.tools.is_empty()).then_some("application/json");

        Self {
            system_instruction: request.system.as_deref().map(|s| Content {
                role: None,
                parts: vec![text_part(s)],
            }),
            contents,
            tools,
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Gemini-backed [`TextOracle`].
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    /// Create a client for `model` against the public endpoint.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(300))?,
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Set a custom base URL (proxies, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl TextOracle for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, messages = request.messages.len()))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = GenerateRequest::from_request(request);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpecExtractError::Network(format!("gemini: {e}")))?;

        let response = error_for_status("gemini", response).await?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| SpecExtractError::Oracle(format!("gemini: invalid response body: {e}")))?;

        let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
            SpecExtractError::Oracle("gemini: response has no candidates (blocked prompt?)".into())
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    name: call.name,
                    arguments: call.args,
                });
            }
        }

        let usage = parsed
            .usage_metadata
            .map(|u| Usage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();

        debug!(
            finish_reason = candidate.finish_reason.as_deref().unwrap_or("unknown"),
            text_len = text.len(),
            tool_calls = tool_calls.len(),
            tokens_in = usage.input_tokens,
            tokens_out = usage.output_tokens,
            "gemini completion"
        );

        Ok(Completion {
            text,
            tool_calls,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{ChatMessage, ToolSpec};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn request_maps_roles_and_tools() {
        let req = CompletionRequest::new(vec![
            ChatMessage::user("spec"),
            ChatMessage::assistant("list"),
        ])
        .with_system("you are an extractor")
        .with_tools(vec![ToolSpec::no_args("transfer_to_reviewer", "hand off")]);

        let json = serde_json::to_value(GenerateRequest::from_request(&req)).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "you are an extractor");
        assert_eq!(
            json["tools"][0]["functionDeclarations"][0]["name"],
            "transfer_to_reviewer"
        );
        assert!(json["generationConfig"].get("responseMimeType").is_none());
    }

    #[test]
    fn json_hint_sets_mime_type() {
        let req = CompletionRequest::prompt("x").expect_json();
        let json = serde_json::to_value(GenerateRequest::from_request(&req)).unwrap();
        assert_eq!(json["generationConfig"]["responseMimeType"], "application/json");
        assert!(json.get("tools").is_none());
    }

    #[tokio::test]
    async fn parses_text_and_function_calls() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .and(header("x-goog-api-key", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [
                            {"text": "- Кабель, 10 м"},
                            {"functionCall": {"name": "transfer_to_reviewer", "args": {}}}
                        ]
                    },
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 5}
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::new("key", "gemini-test")
            .unwrap()
            .with_base_url(server.uri());
        let completion = client
            .complete(&CompletionRequest::prompt("hi"))
            .await
            .expect("completion");

        assert_eq!(completion.text, "- Кабель, 10 м");
        assert!(completion.calls_tool("transfer_to_reviewer"));
        assert_eq!(completion.usage.input_tokens, 12);
        assert_eq!(completion.usage.output_tokens, 5);
    }

    #[tokio::test]
    async fn error_status_is_oracle_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let client = GeminiClient::new("key", "gemini-test")
            .unwrap()
            .with_base_url(server.uri());
        let err = client
            .complete(&CompletionRequest::prompt("hi"))
            .await
            .unwrap_err();

        assert!(matches!(err, SpecExtractError::Oracle(_)));
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn empty_candidates_is_oracle_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"candidates": []})),
            )
            .mount(&server)
            .await;

        let client = GeminiClient::new("key", "gemini-test")
            .unwrap()
            .with_base_url(server.uri());
        let err = client
            .complete(&CompletionRequest::prompt("hi"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no candidates"));
    }
}
