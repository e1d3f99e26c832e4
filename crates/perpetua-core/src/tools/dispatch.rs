// Tool dispatch pipeline.
//
// Order matters: variable resolution, visibility, guards, rate limit,
// execute, adapt, variableize, record. Guard and rate-limit rejections are
// returned as error payloads so the model can self-correct; they never
// propagate as engine errors.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::Agent;
use crate::config::ToolPlanSettings;
use crate::digest::{digest_json, digest_text};
use crate::hints::extract_context_hint;
use crate::skeleton::{extract_serp_skeleton, extract_skeleton};
use crate::step::{NewToolCall, ToolCallRecord};
use crate::tools::{GuardRegistry, Tool, ToolContext, ToolDeps, ToolRegistry};
use crate::traits::{StepStore, VariableStore};
use crate::variable::{
    generate_variable_name, materialize_value, parse_reference, NewVariable, Variable,
};

/// Bulk results at or above this size get a digest/skeleton substitute
const ADAPT_THRESHOLD_BYTES: usize = 2048;

const SERP_TOOLS: [&str; 3] = [
    "search_engine",
    "search_engine_batch",
    "mcp_brightdata_search_engine",
];
const SCRAPE_TOOLS: [&str; 2] = ["scrape_as_markdown", "mcp_brightdata_scrape_as_markdown"];

/// Result of dispatching one tool call
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Final payload handed back to the model
    pub payload: Value,
    /// Compact substitute for the next-iteration context, when the raw
    /// result is bulky
    pub compact: Option<String>,
    pub record: ToolCallRecord,
    pub created_variables: Vec<Variable>,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    guards: Arc<GuardRegistry>,
    variables: Arc<dyn VariableStore>,
    steps: Arc<dyn StepStore>,
    min_variable_bytes: usize,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        guards: Arc<GuardRegistry>,
        variables: Arc<dyn VariableStore>,
        steps: Arc<dyn StepStore>,
        min_variable_bytes: usize,
    ) -> Self {
        Self {
            registry,
            guards,
            variables,
            steps,
            min_variable_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute the full dispatch pipeline for one declared tool call
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch(
        &self,
        agent: &Agent,
        settings: &ToolPlanSettings,
        deps: &ToolDeps,
        step_id: Uuid,
        now: DateTime<Utc>,
        tool_name: &str,
        params: Value,
    ) -> crate::error::Result<DispatchOutcome> {
        // 1. Resolve $name references
        let resolved_params = match self.resolve_variables(agent.id, &params).await? {
            Ok(resolved) => resolved,
            Err(missing) => {
                let payload = json!({
                    "status": "error",
                    "message": format!("Variable ${missing} not found"),
                });
                return self
                    .finish(agent, step_id, now, tool_name, params, payload, None)
                    .await;
            }
        };

        // 2. Registration and visibility
        let Some(tool) = self.registry.get(tool_name).cloned() else {
            let payload = json!({
                "status": "not_found",
                "message": format!("Tool '{tool_name}' is not registered"),
            });
            return self
                .finish(agent, step_id, now, tool_name, resolved_params, payload, None)
                .await;
        };
        if !tool.visible_to(agent) {
            let payload = json!({
                "status": "error",
                "message": format!("Tool '{tool_name}' is not available to this agent"),
            });
            return self
                .finish(agent, step_id, now, tool_name, resolved_params, payload, None)
                .await;
        }

        // 3. Parameter guards, in registration order
        if let Some(rejection) = self.guards.validate(tool_name, &resolved_params, settings) {
            let payload = json!({
                "status": "error",
                "message": rejection.message,
            });
            return self
                .finish(agent, step_id, now, tool_name, resolved_params, payload, None)
                .await;
        }

        // 4. Per-plan hourly rate limit over the trailing 60 minutes
        if let Some(limit) = settings.hourly_limit_for_tool(tool_name) {
            let since = now - Duration::minutes(60);
            let used = self
                .steps
                .tool_calls_for_owner_since(agent.owner, tool_name, since)
                .await?;
            if used >= limit {
                let payload = json!({
                    "status": "error",
                    "message": format!(
                        "Hourly rate limit ({limit}) reached for tool '{tool_name}'. Try again later."
                    ),
                });
                return self
                    .finish(agent, step_id, now, tool_name, resolved_params, payload, None)
                    .await;
            }
        }

        // 5. Execute the handler
        let ctx = ToolContext {
            agent,
            now,
            settings,
            deps,
        };
        let payload = tool.execute(&ctx, resolved_params.clone()).await.into_payload();

        // 6. Adapt bulk content
        let compact = adapt_result(tool_name, &payload);

        // 7 + 8. Variableize, then record
        self.finish(agent, step_id, now, tool_name, resolved_params, payload, compact)
            .await
    }

    /// Variableize the payload and persist the ToolCall record
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        agent: &Agent,
        step_id: Uuid,
        now: DateTime<Utc>,
        tool_name: &str,
        params: Value,
        payload: Value,
        compact: Option<String>,
    ) -> crate::error::Result<DispatchOutcome> {
        let (payload, variableize_config) = extract_variableize_config(payload);
        let mut created_variables = Vec::new();

        if let Some(config) = &variableize_config {
            created_variables.extend(
                self.variableize_from_config(agent.id, step_id, now, tool_name, &payload, config)
                    .await,
            );
        }

        let result_text = payload.to_string();
        if result_text.len() >= self.min_variable_bytes {
            let name = generate_variable_name(tool_name, step_id, None, None);
            let variable = NewVariable::from_value(
                name,
                &payload,
                None,
                format!("{tool_name} result"),
            );
            match self.variables.get_or_create(agent.id, variable, now).await {
                Ok((variable, created)) => {
                    if created {
                        created_variables.push(variable);
                    }
                }
                Err(err) => {
                    tracing::debug!(tool = tool_name, error = %err, "failed to create result variable");
                }
            }
        }

        let record = self
            .steps
            .create_tool_call(NewToolCall {
                step_id,
                agent_id: agent.id,
                tool_name: tool_name.to_string(),
                params,
                result: result_text,
                created_at: now,
            })
            .await?;

        Ok(DispatchOutcome {
            payload,
            compact,
            record,
            created_variables,
        })
    }

    /// Replace whole-string `$name` values anywhere in the params tree.
    /// Outer Result is a store failure; inner Err carries the first missing
    /// variable name.
    async fn resolve_variables(
        &self,
        agent_id: Uuid,
        params: &Value,
    ) -> crate::error::Result<std::result::Result<Value, String>> {
        let mut names = Vec::new();
        collect_references(params, &mut names);
        if names.is_empty() {
            return Ok(Ok(params.clone()));
        }

        let mut values: HashMap<String, Value> = HashMap::new();
        for name in names {
            match self.variables.get(agent_id, &name).await? {
                Some(variable) => {
                    values.insert(name, materialize_value(&variable));
                }
                None => return Ok(Err(name)),
            }
        }
        Ok(Ok(substitute_references(params, &values)))
    }

    async fn variableize_from_config(
        &self,
        agent_id: Uuid,
        step_id: Uuid,
        now: DateTime<Utc>,
        tool_name: &str,
        payload: &Value,
        config: &Value,
    ) -> Vec<Variable> {
        let mut created = Vec::new();
        let Some(result_obj) = payload.as_object() else {
            return created;
        };
        let prefix = config.get("prefix").and_then(|v| v.as_str());
        let fields: Vec<&str> = config
            .get("fields")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        for field in fields {
            let Some(value) = result_obj.get(field) else {
                continue;
            };
            let name = generate_variable_name(tool_name, step_id, Some(field), prefix);
            let variable = NewVariable::from_value(
                name,
                value,
                None,
                format!("{tool_name} field '{field}'"),
            );
            match self.variables.get_or_create(agent_id, variable, now).await {
                Ok((variable, was_created)) => {
                    if was_created {
                        created.push(variable);
                    }
                }
                Err(err) => {
                    tracing::debug!(tool = tool_name, field, error = %err, "failed to create field variable");
                }
            }
        }
        created
    }
}

// ============================================================================
// Variable reference walking
// ============================================================================

fn collect_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(name) = parse_reference(s) {
                if !out.iter().any(|existing| existing == name) {
                    out.push(name.to_string());
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, out);
            }
        }
        _ => {}
    }
}

fn substitute_references(value: &Value, values: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => match parse_reference(s).and_then(|name| values.get(name)) {
            Some(resolved) => resolved.clone(),
            None => value.clone(),
        },
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_references(v, values)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_references(v, values)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

// ============================================================================
// Variableize config extraction
// ============================================================================

/// Pop the `_variableize` config from a payload, returning the cleaned
/// payload and the config when present
fn extract_variableize_config(payload: Value) -> (Value, Option<Value>) {
    let Value::Object(mut map) = payload else {
        return (payload, None);
    };
    let config = map.remove("_variableize").filter(|c| c.is_object());
    (Value::Object(map), config)
}

// ============================================================================
// Result adapters
// ============================================================================

/// Compute the compact next-iteration form of a bulk result, when warranted
fn adapt_result(tool_name: &str, payload: &Value) -> Option<String> {
    let result_text = payload.get("result").and_then(|v| v.as_str());

    if SERP_TOOLS.contains(&tool_name) {
        let markdown = result_text?;
        let query = payload.get("query").and_then(|v| v.as_str()).unwrap_or("");
        let skeleton = extract_serp_skeleton(markdown, query);
        if skeleton.items.is_empty() {
            return None;
        }
        let mut compact = skeleton.to_json();
        if let Some(hint) = extract_context_hint(tool_name, payload) {
            compact.push('\n');
            compact.push_str(&hint);
        }
        return Some(compact);
    }

    if SCRAPE_TOOLS.contains(&tool_name) {
        let markdown = result_text?;
        if markdown.len() < ADAPT_THRESHOLD_BYTES {
            return None;
        }
        let title = payload.get("title").and_then(|v| v.as_str()).unwrap_or("");
        let skeleton = extract_skeleton(markdown, "", title);
        return Some(skeleton.to_json());
    }

    // Generic bulk content: digest large strings and large structures
    if let Some(text) = result_text {
        if text.len() >= ADAPT_THRESHOLD_BYTES {
            return Some(digest_text(text).to_prompt());
        }
        return None;
    }
    let rendered = payload.to_string();
    if rendered.len() >= ADAPT_THRESHOLD_BYTES {
        return Some(digest_json(payload, Some(&rendered)).to_prompt());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, OwnerRef};
    use crate::dup_guard::DuplicateGuard;
    use crate::llm::DriverRegistry;
    use crate::memory::InMemoryStore;
    use crate::tools::{SendEmailTool, Tool, ToolExecutionResult};
    use crate::variable::MAX_VARIABLES_PER_AGENT;
    use async_trait::async_trait;

    struct StaticTool {
        name: &'static str,
        payload: Value,
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "static payload"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _ctx: &ToolContext<'_>, _params: Value) -> ToolExecutionResult {
            ToolExecutionResult::Success(self.payload.clone())
        }
    }

    struct ParamEchoTool;

    #[async_trait]
    impl Tool for ParamEchoTool {
        fn name(&self) -> &str {
            "echo_params"
        }

        fn description(&self) -> &str {
            "echo params back"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _ctx: &ToolContext<'_>, params: Value) -> ToolExecutionResult {
            ToolExecutionResult::Success(json!({"params": params}))
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        dispatcher: ToolDispatcher,
        deps: ToolDeps,
        agent: Agent,
    }

    fn fixture(extra_tools: Vec<Box<dyn Tool>>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let agent = Agent::new("scout", OwnerRef::User(Uuid::now_v7()), Utc::now());
        store.seed_agent(agent.clone());

        let mut registry = ToolRegistry::new();
        registry.register(ParamEchoTool);
        registry.register(SendEmailTool);
        for tool in extra_tools {
            registry.register_arc(Arc::from(tool));
        }

        let dup_guard = Arc::new(DuplicateGuard::new(
            store.clone(),
            store.clone(),
            DriverRegistry::new(),
        ));
        let deps = ToolDeps {
            messages: store.clone(),
            transport: store.clone(),
            dup_guard,
        };
        let dispatcher = ToolDispatcher::new(
            Arc::new(registry),
            Arc::new(GuardRegistry::with_builtins()),
            store.clone(),
            store.clone(),
            crate::variable::DEFAULT_MIN_VARIABLE_BYTES,
        );
        Fixture {
            store,
            dispatcher,
            deps,
            agent,
        }
    }

    async fn run(
        fixture: &Fixture,
        settings: &ToolPlanSettings,
        tool: &str,
        params: Value,
    ) -> DispatchOutcome {
        fixture
            .dispatcher
            .dispatch(
                &fixture.agent,
                settings,
                &fixture.deps,
                Uuid::now_v7(),
                Utc::now(),
                tool,
                params,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_tool_returns_not_found_payload() {
        let fixture = fixture(vec![]);
        let outcome = run(&fixture, &ToolPlanSettings::default(), "nope", json!({})).await;
        assert_eq!(outcome.payload["status"], "not_found");
        // The failed call is still recorded
        assert_eq!(outcome.record.tool_name, "nope");
    }

    #[tokio::test]
    async fn variable_references_resolve_in_params() {
        let fixture = fixture(vec![]);
        fixture
            .store
            .get_or_create(
                fixture.agent.id,
                NewVariable::from_value("city", &json!({"name": "Lyon"}), None, ""),
                Utc::now(),
            )
            .await
            .unwrap();

        let outcome = run(
            &fixture,
            &ToolPlanSettings::default(),
            "echo_params",
            json!({"where": "$city", "nested": {"same": "$city"}, "plain": "text"}),
        )
        .await;
        assert_eq!(outcome.payload["params"]["where"]["name"], "Lyon");
        assert_eq!(outcome.payload["params"]["nested"]["same"]["name"], "Lyon");
        assert_eq!(outcome.payload["params"]["plain"], "text");
        // The record stores resolved params
        assert_eq!(outcome.record.params["where"]["name"], "Lyon");
    }

    #[tokio::test]
    async fn unresolved_variable_is_typed_error_payload() {
        let fixture = fixture(vec![]);
        let outcome = run(
            &fixture,
            &ToolPlanSettings::default(),
            "echo_params",
            json!({"value": "$missing"}),
        )
        .await;
        assert_eq!(outcome.payload["status"], "error");
        assert_eq!(outcome.payload["message"], "Variable $missing not found");
    }

    #[tokio::test]
    async fn guard_rejection_becomes_error_payload() {
        let fixture = fixture(vec![Box::new(StaticTool {
            name: "scrape_as_markdown",
            payload: json!({"result": "irrelevant"}),
        })]);
        let outcome = run(
            &fixture,
            &ToolPlanSettings::default(),
            "scrape_as_markdown",
            json!({"url": "https://example.com/doc.pdf"}),
        )
        .await;
        assert_eq!(outcome.payload["status"], "error");
        assert!(outcome.payload["message"].as_str().unwrap().contains("PDF"));
    }

    #[tokio::test]
    async fn rate_limit_blocks_after_quota() {
        let fixture = fixture(vec![]);
        let mut settings = ToolPlanSettings::default();
        settings.rate_limits.insert("echo_params".to_string(), 2);

        for _ in 0..2 {
            let outcome = run(&fixture, &settings, "echo_params", json!({"a": 1})).await;
            assert_eq!(outcome.payload["status"], "ok");
        }
        let outcome = run(&fixture, &settings, "echo_params", json!({"a": 1})).await;
        assert_eq!(outcome.payload["status"], "error");
        assert!(outcome.payload["message"]
            .as_str()
            .unwrap()
            .contains("rate limit"));
    }

    #[tokio::test]
    async fn variableize_config_creates_field_variables() {
        let fixture = fixture(vec![Box::new(StaticTool {
            name: "fetch_report",
            payload: json!({
                "summary": "short",
                "rows": [1, 2, 3],
                "_variableize": {"fields": ["rows"], "prefix": "report"},
            }),
        })]);
        let outcome = run(&fixture, &ToolPlanSettings::default(), "fetch_report", json!({})).await;

        // Config is stripped from the payload
        assert!(outcome.payload.get("_variableize").is_none());
        assert_eq!(outcome.created_variables.len(), 1);
        let var = &outcome.created_variables[0];
        assert!(var.name.starts_with("report_"));
        assert!(var.name.ends_with("_rows"));
        assert!(var.is_json);
    }

    #[tokio::test]
    async fn large_results_become_whole_result_variables() {
        let big = "x".repeat(3000);
        let fixture = fixture(vec![Box::new(StaticTool {
            name: "bulk",
            payload: json!({"result": big}),
        })]);
        let outcome = run(&fixture, &ToolPlanSettings::default(), "bulk", json!({})).await;
        assert_eq!(outcome.created_variables.len(), 1);
        assert!(outcome.created_variables[0].name.ends_with("_result"));
    }

    #[tokio::test]
    async fn small_results_create_no_variables() {
        let fixture = fixture(vec![Box::new(StaticTool {
            name: "small",
            payload: json!({"result": "tiny"}),
        })]);
        let outcome = run(&fixture, &ToolPlanSettings::default(), "small", json!({})).await;
        assert!(outcome.created_variables.is_empty());
    }

    #[tokio::test]
    async fn serp_results_get_skeleton_compact() {
        let mut markdown = String::from("Search results\n");
        for i in 0..15 {
            markdown.push_str(&format!(
                "[Widget result {i}](https://shop{i}.example.com/item-{i})\n"
            ));
        }
        let fixture = fixture(vec![Box::new(StaticTool {
            name: "search_engine",
            payload: json!({"result": markdown, "query": "widgets"}),
        })]);
        let outcome = run(&fixture, &ToolPlanSettings::default(), "search_engine", json!({})).await;
        let compact = outcome.compact.unwrap();
        assert!(compact.contains("\"kind\":\"serp\""));
        assert!(compact.contains("widgets"));
    }

    #[tokio::test]
    async fn generic_large_text_gets_digest_compact() {
        let prose = "The analysis of quarterly data shows steady growth. ".repeat(100);
        let fixture = fixture(vec![Box::new(StaticTool {
            name: "read_file",
            payload: json!({"result": prose}),
        })]);
        let outcome = run(&fixture, &ToolPlanSettings::default(), "read_file", json!({})).await;
        let compact = outcome.compact.unwrap();
        assert!(compact.starts_with("<digest>"));
    }

    #[tokio::test]
    async fn variable_cap_enforced_via_store() {
        let fixture = fixture(vec![]);
        for i in 0..(MAX_VARIABLES_PER_AGENT + 10) {
            fixture
                .store
                .get_or_create(
                    fixture.agent.id,
                    NewVariable::from_value(format!("var_{i}"), &json!(i), None, ""),
                    Utc::now() + Duration::seconds(i as i64),
                )
                .await
                .unwrap();
        }
        let variables = fixture.store.list(fixture.agent.id).await.unwrap();
        assert_eq!(variables.len(), MAX_VARIABLES_PER_AGENT);
        // The newest survive
        assert!(variables.iter().any(|v| v.name == "var_59"));
        assert!(!variables.iter().any(|v| v.name == "var_0"));
    }
}
