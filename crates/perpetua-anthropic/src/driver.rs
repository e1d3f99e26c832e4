// Anthropic messages-API driver.
//
// System prompts travel in the top-level `system` field; tool calls come
// back as `tool_use` content blocks.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use perpetua_core::error::{EngineError, Result};
use perpetua_core::llm::{
    ChatRole, CompletionDriver, CompletionRequest, CompletionResponse, CompletionUsage,
    ToolInvocation,
};

const DEFAULT_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

const FALLBACK_INPUT_COST_PER_MTOK: f64 = 3.0;
const FALLBACK_OUTPUT_COST_PER_MTOK: f64 = 15.0;

/// Driver for the Anthropic messages API
#[derive(Clone)]
pub struct AnthropicDriver {
    client: Client,
}

impl AnthropicDriver {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn build_body(request: &CompletionRequest) -> Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for message in &request.messages {
            match message.role {
                ChatRole::System => system_parts.push(&message.content),
                ChatRole::User => messages.push(json!({
                    "role": "user",
                    "content": message.content,
                })),
                ChatRole::Assistant => messages.push(json!({
                    "role": "assistant",
                    "content": message.content,
                })),
                ChatRole::Tool => messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id,
                        "content": message.content,
                    }],
                })),
            }
        }

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            if request.tool_choice_auto {
                body["tool_choice"] = json!({"type": "auto"});
            }
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

impl Default for AnthropicDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionDriver for AnthropicDriver {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let base = request
            .base_url
            .as_deref()
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let url = format!("{base}/v1/messages");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &request.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| EngineError::llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::llm(format!("API error {status}: {detail}")));
        }

        let wire: WireMessage = response
            .json()
            .await
            .map_err(|e| EngineError::llm(format!("invalid response body: {e}")))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in wire.content {
            match block {
                WireBlock::Text { text } => content.push_str(&text),
                WireBlock::ToolUse { id, name, input } => tool_calls.push(ToolInvocation {
                    id,
                    name,
                    arguments: input,
                }),
            }
        }

        let input_tokens = wire.usage.input_tokens;
        let output_tokens = wire.usage.output_tokens;
        let cost = (input_tokens as f64 * FALLBACK_INPUT_COST_PER_MTOK
            + output_tokens as f64 * FALLBACK_OUTPUT_COST_PER_MTOK)
            / 1_000_000.0;

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage: CompletionUsage {
                prompt_tokens: input_tokens,
                completion_tokens: output_tokens,
                cached_tokens: wire.usage.cache_read_input_tokens.unwrap_or(0),
                cost,
            },
        })
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Vec<WireBlock>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    cache_read_input_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpetua_core::llm::{ChatMessage, ToolSchema};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(base_url: &str) -> CompletionRequest {
        CompletionRequest {
            model: "claude-test".to_string(),
            api_key: "sk-ant-test".to_string(),
            base_url: Some(base_url.to_string()),
            messages: vec![
                ChatMessage::system("be helpful"),
                ChatMessage::user("send the report"),
            ],
            tools: vec![ToolSchema {
                name: "send_email".to_string(),
                description: "send".to_string(),
                parameters: json!({"type": "object"}),
            }],
            tool_choice_auto: true,
            parallel_tool_calls: true,
            temperature: None,
            max_tokens: Some(512),
            vertex: None,
        }
    }

    #[tokio::test]
    async fn parses_text_and_tool_use_blocks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "text", "text": "sending the report"},
                    {"type": "tool_use", "id": "toolu_1", "name": "send_email",
                     "input": {"to": "ops@example.com"}}
                ],
                "usage": {"input_tokens": 90, "output_tokens": 25}
            })))
            .mount(&server)
            .await;

        let driver = AnthropicDriver::new();
        let response = driver.complete(&request(&server.uri())).await.unwrap();

        assert_eq!(response.content, "sending the report");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments["to"], "ops@example.com");
        assert_eq!(response.usage.prompt_tokens, 90);
        assert!(response.usage.cost > 0.0);
    }

    #[tokio::test]
    async fn surfaces_overloaded_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let driver = AnthropicDriver::new();
        let err = driver.complete(&request(&server.uri())).await.unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn system_messages_move_to_top_level() {
        let body = AnthropicDriver::build_body(&request("http://unused"));
        assert_eq!(body["system"], "be helpful");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn max_tokens_defaults_when_missing() {
        let mut req = request("http://unused");
        req.max_tokens = None;
        let body = AnthropicDriver::build_body(&req);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }
}
