//! Mistral backend (OpenAI-style chat completions API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use specextract_shared::{Result, SpecExtractError};

use crate::http::{build_client, error_for_status};
use crate::oracle::{ChatRole, Completion, CompletionRequest, TextOracle, ToolCall, Usage};

/// Public Mistral endpoint.
const DEFAULT_BASE_URL: &str = "https://api.mistral.ai/v1";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireCalledFunction,
}

#[derive(Debug, Deserialize)]
struct WireCalledFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ChatRequest {
    fn from_request(model: &str, request: &CompletionRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(WireMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: match m.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            },
            content: m.content.clone(),
        }));

        let tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone().unwrap_or_else(
                        || serde_json::json!({"type": "object", "properties": {}}),
                    ),
                },
            })
            .collect();

        Self {
            model: model.to_string(),
            messages,
            tool_choice: (!tools.is_empty()).then_some("auto"),
            tools,
            temperature: 0.0,
            response_format: request
                .json_output
                .then_some(ResponseFormat { kind: "json_object" }),
        }
    }
}

/// Mistral returns either a string or a list of typed chunks.
fn content_text(content: Option<serde_json::Value>) -> String {
    match content {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Array(chunks)) => chunks
            .iter()
            .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
            .collect(),
        _ => String::new(),
    }
}

/// Tool arguments arrive JSON-encoded as a string.
fn decode_arguments(raw: serde_json::Value) -> serde_json::Value {
    match raw {
        serde_json::Value::String(s) if s.trim().is_empty() => serde_json::json!({}),
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Mistral-backed [`TextOracle`].
#[derive(Clone)]
pub struct MistralClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl MistralClient {
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
}

#[async_trait]
impl TextOracle for MistralClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, messages = request.messages.len()))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = ChatRequest::from_request(&self.model, request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpecExtractError::Network(format!("mistral: {e}")))?;

        let response = error_for_status("mistral", response).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| SpecExtractError::Oracle(format!("mistral: invalid response body: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| SpecExtractError::Oracle("mistral: response has no choices".into()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall {
                name: c.function.name,
                arguments: decode_arguments(c.function.arguments),
            })
            .collect();
        let text = content_text(choice.message.content);

        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        debug!(
            finish_reason = choice.finish_reason.as_deref().unwrap_or("unknown"),
            text_len = text.len(),
            tool_calls = tool_calls.len(),
            tokens_in = usage.input_tokens,
            tokens_out = usage.output_tokens,
            "mistral completion"
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
    fn system_prompt_leads_and_tools_get_empty_schema() {
        let req = CompletionRequest::new(vec![ChatMessage::user("spec")])
            .with_system("you are a reviewer")
            .with_tools(vec![ToolSpec::no_args("transfer_to_extractor", "hand back")]);

        let json = serde_json::to_value(ChatRequest::from_request("m", &req)).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(json["tool_choice"], "auto");
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn chunked_content_is_joined() {
        let content = serde_json::json!([
            {"type": "text", "text": "a"},
            {"type": "text", "text": "b"}
        ]);
        assert_eq!(content_text(Some(content)), "ab");
        assert_eq!(content_text(None), "");
    }

    #[test]
    fn string_arguments_are_decoded() {
        let v = decode_arguments(serde_json::json!("{\"x\": 1}"));
        assert_eq!(v["x"], 1);
        assert_eq!(decode_arguments(serde_json::json!("")), serde_json::json!({}));
    }

    #[tokio::test]
    async fn parses_tool_calls() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "No issues found.",
                        "tool_calls": [{
                            "id": "c1",
                            "type": "function",
                            "function": {"name": "transfer_to_extractor", "arguments": "{}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 40, "completion_tokens": 7}
            })))
            .mount(&server)
            .await;

        let client = MistralClient::new("key", "mistral-test")
            .unwrap()
            .with_base_url(server.uri());
        let completion = client
            .complete(&CompletionRequest::prompt("review"))
            .await
            .expect("completion");

        assert_eq!(completion.text, "No issues found.");
        assert!(completion.calls_tool("transfer_to_extractor"));
        assert_eq!(completion.usage.input_tokens, 40);
    }

    #[tokio::test]
    async fn server_error_is_oracle_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = MistralClient::new("key", "mistral-test")
            .unwrap()
            .with_base_url(server.uri());
        let err = client
            .complete(&CompletionRequest::prompt("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpecExtractError::Oracle(_)));
        assert!(err.to_string().contains("500"));
    }
}
