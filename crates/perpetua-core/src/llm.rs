// LLM client abstractions.
//
// Drivers speak one wire protocol each; the client walks a routed fallback
// sequence, retries transient failures with exponential backoff, and records
// one attempt per endpoint tried. Credit cost = provider cost x plan
// multiplier x tier multiplier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credit::Credits;
use crate::error::{EngineError, Result};
use crate::routing::{ProviderBackend, ResolvedEndpoint};

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Tool call id this message responds to (role = Tool)
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }
}

/// Tool schema exposed to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One completion request as sent to a driver
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    /// Omitted when the endpoint does not support tool choice
    pub tool_choice_auto: bool,
    pub parallel_tool_calls: bool,
    /// Dropped when the endpoint does not support temperature
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Vertex (project, location) for Google-backed providers
    pub vertex: Option<(String, String)>,
}

/// Tool call declared by the model, in declared order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cached_tokens: u32,
    /// Provider-reported or pricing-derived cost in credits-before-multipliers
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: CompletionUsage,
}

// ============================================================================
// Driver traits
// ============================================================================

/// Provider-specific completion implementation
#[async_trait]
pub trait CompletionDriver: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Provider-specific embeddings implementation
#[async_trait]
pub trait EmbeddingsDriver: Send + Sync {
    async fn embed(
        &self,
        model: &str,
        api_key: &str,
        base_url: Option<&str>,
        inputs: &[String],
    ) -> Result<Vec<Vec<f64>>>;
}

/// Registry mapping provider backends to driver implementations
#[derive(Clone, Default)]
pub struct DriverRegistry {
    completion: HashMap<ProviderBackend, Arc<dyn CompletionDriver>>,
    embeddings: HashMap<ProviderBackend, Arc<dyn EmbeddingsDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_completion(
        &mut self,
        backend: ProviderBackend,
        driver: Arc<dyn CompletionDriver>,
    ) {
        self.completion.insert(backend, driver);
    }

    pub fn register_embeddings(
        &mut self,
        backend: ProviderBackend,
        driver: Arc<dyn EmbeddingsDriver>,
    ) {
        self.embeddings.insert(backend, driver);
    }

    pub fn completion(&self, backend: ProviderBackend) -> Option<&Arc<dyn CompletionDriver>> {
        self.completion.get(&backend)
    }

    pub fn embeddings(&self, backend: ProviderBackend) -> Option<&Arc<dyn EmbeddingsDriver>> {
        self.embeddings.get(&backend)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("completion", &self.completion.keys().collect::<Vec<_>>())
            .field("embeddings", &self.embeddings.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Routed completion
// ============================================================================

/// Retry behavior for transient provider errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Record of one endpoint attempt, successful or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionAttempt {
    pub endpoint_key: String,
    pub model: String,
    pub tier_order: u32,
    pub usage: Option<CompletionUsage>,
    pub credit_cost: Credits,
    pub error: Option<String>,
}

/// Outcome of a routed completion
#[derive(Debug, Clone)]
pub struct RoutedCompletion {
    pub response: CompletionResponse,
    pub endpoint_key: String,
    pub model: String,
    pub credit_cost: Credits,
    /// One record per endpoint attempted, in order
    pub attempts: Vec<CompletionAttempt>,
}

fn is_retriable(err: &EngineError) -> bool {
    match err {
        EngineError::Timeout(_) => true,
        EngineError::Llm(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("429")
                || msg.contains("rate limit")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("overloaded")
                || msg.contains("connection")
        }
        _ => false,
    }
}

/// Base parameters shared by every attempt of one completion
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// LLM client: walks a routed fallback sequence and records attempts
#[derive(Clone)]
pub struct LlmClient {
    drivers: DriverRegistry,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self {
            drivers,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Build the concrete request for one endpoint, honoring its capability
    /// flags.
    fn request_for(&self, resolved: &ResolvedEndpoint, params: &CompletionParams) -> CompletionRequest {
        CompletionRequest {
            model: resolved.endpoint.model.clone(),
            api_key: resolved.api_key.clone(),
            base_url: resolved.endpoint.base_url.clone(),
            messages: params.messages.clone(),
            tools: params.tools.clone(),
            tool_choice_auto: resolved.endpoint.supports_tool_choice,
            parallel_tool_calls: resolved.endpoint.use_parallel_tool_calls,
            temperature: if resolved.endpoint.supports_temperature {
                params.temperature
            } else {
                None
            },
            max_tokens: params.max_tokens,
            vertex: resolved.vertex.clone(),
        }
    }

    async fn attempt_endpoint(
        &self,
        resolved: &ResolvedEndpoint,
        params: &CompletionParams,
    ) -> Result<CompletionResponse> {
        let driver = self
            .drivers
            .completion(resolved.backend)
            .ok_or_else(|| {
                EngineError::config(format!("no driver registered for {:?}", resolved.backend))
            })?
            .clone();
        let request = self.request_for(resolved, params);

        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            match driver.complete(&request).await {
                Ok(response) => return Ok(response),
                Err(err) if is_retriable(&err) && attempt + 1 < self.retry.max_attempts => {
                    tracing::warn!(
                        endpoint = %resolved.endpoint.key,
                        attempt,
                        error = %err,
                        "transient LLM error; backing off"
                    );
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::llm("retries exhausted")))
    }

    /// Complete against a routed fallback sequence. Fails with TierExhausted
    /// when every endpoint in every applicable tier has failed.
    pub async fn complete_sequence(
        &self,
        sequence: &[ResolvedEndpoint],
        params: &CompletionParams,
        plan_multiplier: f64,
    ) -> Result<RoutedCompletion> {
        if sequence.is_empty() {
            return Err(EngineError::config(
                "no routable endpoints for this prompt size",
            ));
        }

        let mut attempts = Vec::new();
        for resolved in sequence {
            match self.attempt_endpoint(resolved, params).await {
                Ok(response) => {
                    let credit_cost = Credits::from_f64(response.usage.cost)
                        .scale(plan_multiplier)
                        .scale(resolved.credit_multiplier);
                    // One completion record per attempt; the observability
                    // pipeline persists these
                    tracing::info!(
                        endpoint = %resolved.endpoint.key,
                        model = %resolved.endpoint.model,
                        tier = resolved.tier_order,
                        prompt_tokens = response.usage.prompt_tokens,
                        completion_tokens = response.usage.completion_tokens,
                        cached_tokens = response.usage.cached_tokens,
                        cost = response.usage.cost,
                        credit_cost = %credit_cost,
                        "completion recorded"
                    );
                    attempts.push(CompletionAttempt {
                        endpoint_key: resolved.endpoint.key.clone(),
                        model: resolved.endpoint.model.clone(),
                        tier_order: resolved.tier_order,
                        usage: Some(response.usage.clone()),
                        credit_cost,
                        error: None,
                    });
                    return Ok(RoutedCompletion {
                        response,
                        endpoint_key: resolved.endpoint.key.clone(),
                        model: resolved.endpoint.model.clone(),
                        credit_cost,
                        attempts,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        endpoint = %resolved.endpoint.key,
                        tier = resolved.tier_order,
                        error = %err,
                        "endpoint failed; falling back"
                    );
                    attempts.push(CompletionAttempt {
                        endpoint_key: resolved.endpoint.key.clone(),
                        model: resolved.endpoint.model.clone(),
                        tier_order: resolved.tier_order,
                        usage: None,
                        credit_cost: Credits::ZERO,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        Err(EngineError::TierExhausted(format!(
            "{} endpoints failed",
            attempts.len()
        )))
    }
}
