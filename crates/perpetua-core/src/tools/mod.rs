//! Tool registry and dispatch.
//!
//! A tool is a value {name, schema, visibility, handler} stored in an
//! in-memory map built at startup. Guards and rate limits run in the
//! dispatcher before the handler; adapters and variableization run after.

mod comms;
mod dispatch;
mod guards;

pub use comms::{SendEmailTool, SendSmsTool, SleepTool, SLEEP_TOOL_NAME};
pub use dispatch::{DispatchOutcome, ToolDispatcher};
pub use guards::{GuardRegistry, GuardRejection, ParamGuard};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::agent::Agent;
use crate::dup_guard::DuplicateGuard;
use crate::llm::ToolSchema;
use crate::traits::{MessageStore, OutboundTransport};

/// Result of executing a tool handler
#[derive(Debug, Clone)]
pub enum ToolExecutionResult {
    /// Structured success payload
    Success(Value),
    /// Handler-level failure; the step continues so the model can
    /// self-correct
    Error(String),
    /// The referenced resource does not exist
    NotFound(String),
}

impl ToolExecutionResult {
    /// Normalize into a payload map carrying a `status` field
    pub fn into_payload(self) -> Value {
        match self {
            ToolExecutionResult::Success(value) => match value {
                Value::Object(mut map) => {
                    map.entry("status").or_insert(json!("ok"));
                    Value::Object(map)
                }
                other => json!({"status": "ok", "result": other}),
            },
            ToolExecutionResult::Error(message) => json!({
                "status": "error",
                "message": message,
            }),
            ToolExecutionResult::NotFound(message) => json!({
                "status": "not_found",
                "message": message,
            }),
        }
    }
}

/// Shared collaborators handlers may need
#[derive(Clone)]
pub struct ToolDeps {
    pub messages: Arc<dyn MessageStore>,
    pub transport: Arc<dyn OutboundTransport>,
    pub dup_guard: Arc<DuplicateGuard>,
}

/// Execution context passed to every handler
pub struct ToolContext<'a> {
    pub agent: &'a Agent,
    pub now: DateTime<Utc>,
    pub settings: &'a crate::config::ToolPlanSettings,
    pub deps: &'a ToolDeps,
}

/// Trait for implementing tools available to agents
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name used by the LLM and for registry lookup
    fn name(&self) -> &str;

    /// Description surfaced in the tool schema
    fn description(&self) -> &str;

    /// JSON schema for tool parameters
    fn parameters_schema(&self) -> Value;

    /// Whether this agent may see and call the tool
    fn visible_to(&self, _agent: &Agent) -> bool {
        true
    }

    async fn execute(&self, ctx: &ToolContext<'_>, params: Value) -> ToolExecutionResult;
}

/// Registry that holds all available tool implementations, keyed by name
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas for the tools visible to this agent, sorted by name for a
    /// stable prompt rendering
    pub fn visible_schemas(&self, agent: &Agent) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|tool| tool.visible_to(agent))
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&String> = self.tools.keys().collect();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::OwnerRef;
    use uuid::Uuid;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn execute(&self, _ctx: &ToolContext<'_>, params: Value) -> ToolExecutionResult {
            ToolExecutionResult::Success(json!({"echo": params["text"]}))
        }
    }

    struct HiddenTool;

    #[async_trait]
    impl Tool for HiddenTool {
        fn name(&self) -> &str {
            "hidden"
        }

        fn description(&self) -> &str {
            "Never visible"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn visible_to(&self, _agent: &Agent) -> bool {
            false
        }

        async fn execute(&self, _ctx: &ToolContext<'_>, _params: Value) -> ToolExecutionResult {
            ToolExecutionResult::Error("unreachable".to_string())
        }
    }

    #[test]
    fn registry_lookup_and_visibility() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(HiddenTool);

        assert!(registry.has("echo"));
        assert!(registry.has("hidden"));
        assert_eq!(registry.len(), 2);

        let agent = Agent::new("a", OwnerRef::User(Uuid::now_v7()), Utc::now());
        let schemas = registry.visible_schemas(&agent);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "echo");
    }

    #[test]
    fn success_payload_gains_ok_status() {
        let payload = ToolExecutionResult::Success(json!({"value": 7})).into_payload();
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["value"], 7);
    }

    #[test]
    fn success_payload_preserves_explicit_status() {
        let payload =
            ToolExecutionResult::Success(json!({"status": "error", "message": "m"})).into_payload();
        assert_eq!(payload["status"], "error");
    }

    #[test]
    fn scalar_success_is_wrapped() {
        let payload = ToolExecutionResult::Success(json!("plain")).into_payload();
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["result"], "plain");
    }

    #[test]
    fn error_and_not_found_payloads() {
        let err = ToolExecutionResult::Error("boom".to_string()).into_payload();
        assert_eq!(err["status"], "error");
        assert_eq!(err["message"], "boom");

        let missing = ToolExecutionResult::NotFound("no such file".to_string()).into_payload();
        assert_eq!(missing["status"], "not_found");
    }
}
