use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sprout_core::config::LlmConfig;
use sprout_core::domain::chat::{ChatMessage, ChatRole, ToolCall};
use sprout_core::domain::tool::ToolSpec;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model transport failed: {0}")]
    Transport(String),
    #[error("model returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("model response could not be decoded: {0}")]
    Decode(String),
    #[error("model client is not configured: {0}")]
    Configuration(String),
}

impl ModelError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::Configuration(_) => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    /// Ask the provider for a bare JSON object reply.
    pub json_mode: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model_name(&self) -> &str;
    async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Client for any provider exposing `POST {base}/chat/completions`.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    max_retries: u32,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ModelError::Configuration(error.to_string()))?;

        Ok(Self {
            http,
            base_url: config.resolved_base_url().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn send_once(&self, body: &Value) -> Result<ModelResponse, ModelError> {
        let mut request = self.http.post(format!("{}/chat/completions", self.base_url)).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response =
            request.send().await.map_err(|error| ModelError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Http { status: status.as_u16(), body });
        }

        let payload: Value =
            response.json().await.map_err(|error| ModelError::Decode(error.to_string()))?;
        parse_completion(&payload)
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = completion_body(&self.model, &request);
        let mut attempt = 0_u32;

        loop {
            match self.send_once(&body).await {
                Ok(response) => {
                    debug!(
                        event_name = "agent.model.completed",
                        model = %self.model,
                        tool_calls = response.tool_calls.len(),
                        "model call completed"
                    );
                    return Ok(response);
                }
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "agent.model.retry",
                        model = %self.model,
                        attempt,
                        error = %error,
                        "model call failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(250) * attempt).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn completion_body(model: &str, request: &ModelRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();
    let mut body = json!({ "model": model, "messages": messages });

    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|spec| {
                json!({
                    "type": "function",
                    "function": {
                        "name": spec.name,
                        "description": spec.description,
                        "parameters": spec.parameters,
                    }
                })
            })
            .collect();
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if request.json_mode {
        body["response_format"] = json!({ "type": "json_object" });
    }

    body
}

fn wire_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };
    let mut value = json!({ "role": role, "content": message.content });

    if !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments.to_string() }
                })
            })
            .collect();
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        value["tool_call_id"] = json!(tool_call_id);
    }
    if let Some(name) = &message.name {
        value["name"] = json!(name);
    }

    value
}

/// Reads the first choice. Missing usage or content is fine; tool-call
/// arguments that are not valid JSON are kept as `{"raw": ...}`.
pub fn parse_completion(payload: &Value) -> Result<ModelResponse, ModelError> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| ModelError::Decode("response has no choices[0].message".to_string()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .map(str::to_string);

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();

    let usage = payload.get("usage").and_then(|usage| serde_json::from_value(usage.clone()).ok());

    Ok(ModelResponse { content, tool_calls, usage })
}

fn parse_tool_call(raw: &Value) -> Option<ToolCall> {
    let function = raw.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));

    let arguments = match function.get("arguments") {
        Some(Value::String(text)) if text.trim().is_empty() => json!({}),
        Some(Value::String(text)) => {
            serde_json::from_str::<Value>(text).unwrap_or_else(|_| json!({ "raw": text }))
        }
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    };

    Some(ToolCall { id, name, arguments })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sprout_core::domain::chat::{ChatMessage, ToolCall};
    use sprout_core::domain::tool::ToolSpec;

    use super::{completion_body, parse_completion, ModelRequest};

    #[test]
    fn parse_tolerates_missing_usage_and_malformed_arguments() {
        let payload = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        { "id": "call_1", "function": { "name": "any_query", "arguments": "{\"sql\":\"SELECT 1\"}" } },
                        { "function": { "name": "render_chart", "arguments": "{not json" } }
                    ]
                }
            }]
        });

        let response = parse_completion(&payload).expect("response should parse");

        assert_eq!(response.content, None);
        assert_eq!(response.usage, None);
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].arguments, json!({ "sql": "SELECT 1" }));
        assert_eq!(response.tool_calls[1].arguments, json!({ "raw": "{not json" }));
        assert!(response.tool_calls[1].id.starts_with("call_"));
    }

    #[test]
    fn parse_reads_content_and_usage() {
        let payload = json!({
            "choices": [{ "message": { "content": "共有 120 名学生" } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        });

        let response = parse_completion(&payload).expect("response should parse");

        assert_eq!(response.content.as_deref(), Some("共有 120 名学生"));
        assert_eq!(response.usage.map(|usage| usage.total_tokens), Some(15));
        assert!(response.tool_calls.is_empty());
    }

    #[test]
    fn parse_rejects_payload_without_choices() {
        assert!(parse_completion(&json!({ "error": "overloaded" })).is_err());
    }

    #[test]
    fn body_encodes_tool_calls_and_tool_results() {
        let request = ModelRequest {
            messages: vec![
                ChatMessage::user("统计学生人数"),
                ChatMessage::assistant_with_tool_calls(
                    "",
                    vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "any_query".to_string(),
                        arguments: json!({ "table": "student" }),
                    }],
                ),
                ChatMessage::tool("call_1", "any_query", "{\"count\":120}"),
            ],
            tools: vec![ToolSpec::new("any_query", "query the database")],
            temperature: Some(0.2),
            json_mode: true,
        };

        let body = completion_body("qwen2.5", &request);

        assert_eq!(body["model"], "qwen2.5");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"], "{\"table\":\"student\"}");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["name"], "any_query");
        assert_eq!(body["response_format"]["type"], "json_object");
    }
}
