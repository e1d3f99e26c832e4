// Error types for the agent engine

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while driving an agent
#[derive(Debug, Error)]
pub enum EngineError {
    /// LLM provider error (after client-side retries)
    #[error("LLM error: {0}")]
    Llm(String),

    /// All endpoints in all applicable tiers failed for one step
    #[error("tier exhaustion: {0}")]
    TierExhausted(String),

    /// Tool execution error
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// A `$name` reference in tool params could not be resolved
    #[error("variable ${0} not found")]
    VariableNotFound(String),

    /// Store / persistence error
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error (missing profile, bad env, ...)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Agent not found
    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Create an LLM error
    pub fn llm(msg: impl Into<String>) -> Self {
        EngineError::Llm(msg.into())
    }

    /// Create a tool execution error
    pub fn tool(msg: impl Into<String>) -> Self {
        EngineError::ToolExecution(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        EngineError::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    /// Create an agent not found error
    pub fn agent_not_found(agent_id: Uuid) -> Self {
        EngineError::AgentNotFound(agent_id)
    }
}
