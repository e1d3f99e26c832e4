// OpenAI-compatible chat-completions driver.
//
// Speaks the non-streaming chat/completions wire format, which also covers
// self-hosted proxies (vLLM, LiteLLM gateways) configured with a base URL
// and the literal `sk-noauth` key.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use perpetua_core::error::{EngineError, Result};
use perpetua_core::llm::{
    ChatMessage, ChatRole, CompletionDriver, CompletionRequest, CompletionResponse,
    CompletionUsage, EmbeddingsDriver, ToolInvocation, ToolSchema,
};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

/// Cost per million tokens used when the endpoint reports no pricing
const FALLBACK_INPUT_COST_PER_MTOK: f64 = 2.0;
const FALLBACK_OUTPUT_COST_PER_MTOK: f64 = 8.0;

/// Driver for OpenAI-compatible chat-completions and embeddings APIs
#[derive(Clone)]
pub struct OpenAiDriver {
    client: Client,
}

impl OpenAiDriver {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn base_url(request_base: Option<&str>) -> String {
        request_base
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    fn convert_role(role: ChatRole) -> &'static str {
        match role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }

    fn convert_message(message: &ChatMessage) -> WireMessage {
        WireMessage {
            role: Self::convert_role(message.role).to_string(),
            content: message.content.clone(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }

    fn convert_tools(tools: &[ToolSchema]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    },
                })
            })
            .collect()
    }

    fn build_body(request: &CompletionRequest) -> Value {
        let messages: Vec<WireMessage> =
            request.messages.iter().map(Self::convert_message).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(Self::convert_tools(&request.tools));
            if request.tool_choice_auto {
                body["tool_choice"] = json!("auto");
            }
            if !request.parallel_tool_calls {
                body["parallel_tool_calls"] = json!(false);
            }
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    fn usage_from_wire(usage: Option<WireUsage>) -> CompletionUsage {
        let usage = usage.unwrap_or_default();
        let cached = usage
            .prompt_tokens_details
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0);
        let cost = (usage.prompt_tokens as f64 * FALLBACK_INPUT_COST_PER_MTOK
            + usage.completion_tokens as f64 * FALLBACK_OUTPUT_COST_PER_MTOK)
            / 1_000_000.0;
        CompletionUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cached_tokens: cached,
            cost,
        }
    }
}

impl Default for OpenAiDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionDriver for OpenAiDriver {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let url = format!("{}/chat/completions", Self::base_url(request.base_url.as_deref()));
        let body = Self::build_body(request);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::llm(format!("API error {status}: {detail}")));
        }

        let wire: WireCompletion = response
            .json()
            .await
            .map_err(|e| EngineError::llm(format!("invalid response body: {e}")))?;

        let Some(choice) = wire.choices.into_iter().next() else {
            return Err(EngineError::llm("response contained no choices"));
        };

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::Object(Default::default()));
                ToolInvocation {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: Self::usage_from_wire(wire.usage),
        })
    }
}

#[async_trait]
impl EmbeddingsDriver for OpenAiDriver {
    async fn embed(
        &self,
        model: &str,
        api_key: &str,
        base_url: Option<&str>,
        inputs: &[String],
    ) -> Result<Vec<Vec<f64>>> {
        let url = format!("{}/embeddings", Self::base_url(base_url));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&json!({"model": model, "input": inputs}))
            .send()
            .await
            .map_err(|e| EngineError::llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::llm(format!("API error {status}: {detail}")));
        }

        let wire: WireEmbeddings = response
            .json()
            .await
            .map_err(|e| EngineError::llm(format!("invalid response body: {e}")))?;

        let mut data = wire.data;
        data.sort_by_key(|entry| entry.index);
        Ok(data.into_iter().map(|entry| entry.embedding).collect())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    prompt_tokens_details: Option<WirePromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct WirePromptTokensDetails {
    cached_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddings {
    data: Vec<WireEmbeddingEntry>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingEntry {
    #[serde(default)]
    index: usize,
    embedding: Vec<f64>,
}
