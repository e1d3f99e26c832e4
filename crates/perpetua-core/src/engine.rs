// The per-agent event loop.
//
// process_agent_events is the single entry point: it drives one agent from
// "some event happened" to a stable rest state, producing a bounded sequence
// of steps. Single-flight is enforced by the advisory agent lock; a
// contending invocation records a PROCESS_EVENTS marker and returns so the
// running loop re-enters after its current step.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use uuid::Uuid;

use crate::agent::Agent;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::credit::{Credits, DailyCreditSettings};
use crate::digest::digest_text;
use crate::dup_guard::DuplicateGuard;
use crate::error::{EngineError, Result};
use crate::expiration::reset_cron_backoff;
use crate::llm::{
    ChatMessage, CompletionParams, DriverRegistry, LlmClient, ToolInvocation,
};
use crate::message::{Message, NewMessage};
use crate::prompt::{
    assemble_prompt, estimate_tokens, NarrativeEntry, NewPromptArchive, PromptInputs, Summarizer,
};
use crate::routing::ResolvedEndpoint;
use crate::step::{credit_limit_reason, NewStep, NewSystemStep, SystemStepCode};
use crate::tools::{GuardRegistry, ToolDeps, ToolDispatcher, ToolRegistry, SLEEP_TOOL_NAME};
use crate::traits::{
    AgentLock, AgentStore, FilesystemCatalog, JobQueue, LockTicket, MessageStore,
    PlanSettingsStore, PromptArchiveStore, RoutingStore, StepStore, VariableStore,
};

/// How one invocation of the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Reached a stable rest state after `steps` steps
    Completed { steps: u32 },
    /// Another invocation holds the lock; a re-entry marker was recorded
    Deferred,
    /// Daily credit budget or step budget stopped the loop
    CreditLimited,
    /// The agent is paused, expired, deleted, or shutting down
    NotRunnable,
}

/// Collaborators wired into the engine at startup
pub struct EngineParts {
    pub agents: Arc<dyn AgentStore>,
    pub steps: Arc<dyn StepStore>,
    pub messages: Arc<dyn MessageStore>,
    pub variables: Arc<dyn VariableStore>,
    pub archives: Arc<dyn PromptArchiveStore>,
    pub routing: Arc<dyn RoutingStore>,
    pub plan_settings: Arc<dyn PlanSettingsStore>,
    pub lock: Arc<dyn AgentLock>,
    pub queue: Arc<dyn JobQueue>,
    pub files: Arc<dyn FilesystemCatalog>,
    pub transport: Arc<dyn crate::traits::OutboundTransport>,
    pub tools: Arc<ToolRegistry>,
    pub guards: Arc<GuardRegistry>,
    pub drivers: DriverRegistry,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

pub struct Engine {
    agents: Arc<dyn AgentStore>,
    steps: Arc<dyn StepStore>,
    messages: Arc<dyn MessageStore>,
    variables: Arc<dyn VariableStore>,
    archives: Arc<dyn PromptArchiveStore>,
    routing: Arc<dyn RoutingStore>,
    plan_settings: Arc<dyn PlanSettingsStore>,
    lock: Arc<dyn AgentLock>,
    queue: Arc<dyn JobQueue>,
    files: Arc<dyn FilesystemCatalog>,
    tools: Arc<ToolRegistry>,
    dispatcher: ToolDispatcher,
    deps: ToolDeps,
    llm: LlmClient,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    rng: Mutex<StdRng>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        let dup_guard = Arc::new(DuplicateGuard::new(
            parts.messages.clone(),
            parts.routing.clone(),
            parts.drivers.clone(),
        ));
        let deps = ToolDeps {
            messages: parts.messages.clone(),
            transport: parts.transport.clone(),
            dup_guard,
        };
        let dispatcher = ToolDispatcher::new(
            parts.tools.clone(),
            parts.guards.clone(),
            parts.variables.clone(),
            parts.steps.clone(),
            parts.config.min_variable_bytes,
        );
        Self {
            agents: parts.agents,
            steps: parts.steps,
            messages: parts.messages,
            variables: parts.variables,
            archives: parts.archives,
            routing: parts.routing,
            plan_settings: parts.plan_settings,
            lock: parts.lock,
            queue: parts.queue,
            files: parts.files,
            tools: parts.tools,
            dispatcher,
            deps,
            llm: LlmClient::new(parts.drivers),
            clock: parts.clock,
            config: parts.config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic endpoint selection for tests
    pub fn with_seeded_rng(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    // ========================================================================
    // Inbound ingestion and settings re-entry
    // ========================================================================

    /// Persist an inbound message, wake an expired agent, refresh the
    /// interaction clock, and enqueue event processing.
    pub async fn ingest_inbound_message(&self, message: NewMessage) -> Result<Message> {
        let agent_id = message.agent_id;
        let now = self.clock.now();
        let persisted = self.messages.create_message(message).await?;

        if let Some(mut agent) = self.agents.get_agent(agent_id).await? {
            agent.restore_from_expiration(now);
            agent.last_interaction_at = Some(now);
            reset_cron_backoff(&mut agent);
            agent.updated_at = now;
            self.agents.update_agent(&agent).await?;
        }

        self.queue.enqueue_process_events(agent_id).await?;
        Ok(persisted)
    }

    /// Record a SYSTEM_DIRECTIVE step describing an operator settings change
    /// and enqueue processing so the agent picks it up immediately.
    pub async fn notify_settings_change(
        &self,
        agent_id: Uuid,
        description: &str,
        notes: serde_json::Value,
    ) -> Result<()> {
        let now = self.clock.now();
        let step = self
            .steps
            .create_step(NewStep::marker(agent_id, description, now))
            .await?;
        self.steps
            .create_system_step(NewSystemStep {
                step_id: step.id,
                agent_id,
                code: SystemStepCode::SystemDirective,
                notes,
                created_at: now,
            })
            .await?;
        self.queue.enqueue_process_events(agent_id).await
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Single entry point: drive the agent until it reaches a stable rest
    /// state, the budget is exhausted, or the step cap is hit.
    pub async fn process_agent_events(&self, agent_id: Uuid) -> Result<LoopOutcome> {
        let Some(agent) = self.agents.get_agent(agent_id).await? else {
            tracing::warn!(agent_id = %agent_id, "process_agent_events for unknown agent");
            return Ok(LoopOutcome::NotRunnable);
        };
        if !agent.is_runnable() {
            return Ok(LoopOutcome::NotRunnable);
        }

        let Some(ticket) = self.lock.try_acquire(agent_id, self.config.lock_ttl).await? else {
            // Lock contention: surface the new events to the running loop
            self.record_process_events_marker(agent_id, "lock_contention")
                .await?;
            return Ok(LoopOutcome::Deferred);
        };

        let result = self.run_locked(agent).await;
        self.release(agent_id, ticket).await;

        let result = result?;

        // Markers unconsumed at exit mean events arrived after the loop's
        // last check; re-schedule a fresh invocation.
        if let Some(watermark) = result.reentry_watermark {
            let pending = self
                .steps
                .system_steps_since(agent_id, SystemStepCode::ProcessEvents, watermark)
                .await
                .unwrap_or(0);
            if pending > 0 {
                self.queue.enqueue_process_events(agent_id).await?;
            }
        }
        Ok(result.outcome)
    }

    async fn release(&self, agent_id: Uuid, ticket: LockTicket) {
        if let Err(err) = self.lock.release(agent_id, ticket).await {
            tracing::error!(agent_id = %agent_id, error = %err, "failed releasing agent lock");
        }
    }

    async fn record_process_events_marker(&self, agent_id: Uuid, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let step = self
            .steps
            .create_step(NewStep::marker(
                agent_id,
                "Events queued while processing was in flight",
                now,
            ))
            .await?;
        self.steps
            .create_system_step(NewSystemStep {
                step_id: step.id,
                agent_id,
                code: SystemStepCode::ProcessEvents,
                notes: json!({"reason": reason}),
                created_at: now,
            })
            .await?;
        Ok(())
    }

    async fn record_credit_limit(&self, agent_id: Uuid, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let step = self
            .steps
            .create_step(NewStep::marker(agent_id, "Credit limit reached", now))
            .await?;
        self.steps
            .create_system_step(NewSystemStep {
                step_id: step.id,
                agent_id,
                code: SystemStepCode::CreditLimitHit,
                notes: json!({"reason": reason}),
                created_at: now,
            })
            .await?;
        Ok(())
    }

    async fn run_locked(&self, agent: Agent) -> Result<LockedResult> {
        let agent_id = agent.id;
        let invocation_start = self.clock.now();
        let mut marker_watermark = invocation_start;

        let daily_settings = self.plan_settings.daily_credit_settings(agent.plan).await?;
        let tool_settings = self.plan_settings.tool_settings(agent.plan).await?;

        let day_start = day_start(invocation_start);
        let mut usage = self.steps.daily_credit_usage(agent_id, day_start).await?;
        let soft_target = agent.daily_credit_soft_target;
        let hard_limit = daily_settings.hard_limit(soft_target);

        // Hard limit gate at entry
        if let Some(hard) = hard_limit {
            if usage >= hard {
                self.record_credit_limit(agent_id, credit_limit_reason::EXHAUSTED)
                    .await?;
                return Ok(LockedResult::terminal(LoopOutcome::CreditLimited));
            }
        }

        // Tool results produced in this invocation feed the next iteration
        let mut working_context: Vec<NarrativeEntry> = Vec::new();
        let mut steps_taken = 0u32;

        loop {
            if steps_taken >= self.config.max_steps_per_invocation {
                self.record_credit_limit(agent_id, credit_limit_reason::STEP_BUDGET)
                    .await?;
                return Ok(LockedResult::terminal(LoopOutcome::CreditLimited));
            }

            // Fresh state each iteration: operator writes and shutdowns land
            // between steps
            let Some(agent) = self.agents.get_agent(agent_id).await? else {
                return Ok(LockedResult::terminal(LoopOutcome::NotRunnable));
            };
            if !agent.is_runnable() {
                // Cancellation: finish without rescheduling
                return Ok(LockedResult::terminal(LoopOutcome::NotRunnable));
            }

            // One clock read per step keeps created_at monotonic
            let step_started_at = self.clock.now();
            let step_id = Uuid::now_v7();

            match self
                .run_step(
                    &agent,
                    &daily_settings,
                    &tool_settings,
                    step_id,
                    step_started_at,
                    &mut working_context,
                )
                .await
            {
                Ok(step_result) => {
                    steps_taken += 1;
                    usage = usage.saturating_add(step_result.cost);

                    // Soft-target crossing finishes the current step, then
                    // exits
                    if let Some(soft) = soft_target {
                        if usage > soft {
                            let reason = if hard_limit.is_some_and(|hard| usage >= hard) {
                                credit_limit_reason::EXHAUSTED
                            } else {
                                credit_limit_reason::MID_LOOP
                            };
                            self.record_credit_limit(agent_id, reason).await?;
                            return Ok(LockedResult::terminal(LoopOutcome::CreditLimited));
                        }
                    }

                    if step_result.stop {
                        // A stop only holds when no PROCESS_EVENTS marker
                        // arrived during the step
                        let pending = self
                            .steps
                            .system_steps_since(
                                agent_id,
                                SystemStepCode::ProcessEvents,
                                marker_watermark,
                            )
                            .await?;
                        if pending == 0 {
                            return Ok(LockedResult {
                                outcome: LoopOutcome::Completed { steps: steps_taken },
                                reentry_watermark: Some(marker_watermark),
                            });
                        }
                        marker_watermark = self.clock.now();
                    }
                }
                Err(EngineError::TierExhausted(detail)) => {
                    // Next external event triggers a fresh attempt
                    tracing::error!(agent_id = %agent_id, detail = %detail, "tier exhaustion; exiting loop");
                    self.record_failed_step(agent_id, step_id, &detail).await;
                    self.record_credit_limit(agent_id, credit_limit_reason::TIER_EXHAUSTED)
                        .await?;
                    return Ok(LockedResult::terminal(LoopOutcome::Completed {
                        steps: steps_taken,
                    }));
                }
                Err(err) => {
                    // A failed step does not poison the loop; the next
                    // iteration begins afresh
                    tracing::error!(agent_id = %agent_id, error = %err, "step failed");
                    self.record_failed_step(agent_id, step_id, &err.to_string())
                        .await;
                    steps_taken += 1;
                }
            }
        }
    }

    async fn record_failed_step(&self, agent_id: Uuid, step_id: Uuid, detail: &str) {
        let now = self.clock.now();
        let mut description = format!("Step failed: {detail}");
        description.truncate(500);
        let result = self
            .steps
            .create_step(NewStep {
                id: step_id,
                agent_id,
                description,
                credits_cost: Credits::ZERO,
                eval_run_id: None,
                created_at: now,
            })
            .await;
        if let Err(err) = result {
            tracing::error!(agent_id = %agent_id, error = %err, "failed recording failed step");
        }
    }

    /// One iteration: assemble, route, complete, dispatch tools, persist
    async fn run_step(
        &self,
        agent: &Agent,
        daily_settings: &DailyCreditSettings,
        tool_settings: &crate::config::ToolPlanSettings,
        step_id: Uuid,
        now: DateTime<Utc>,
        working_context: &mut Vec<NarrativeEntry>,
    ) -> Result<StepResult> {
        let profile = self.routing.active_profile().await?;

        // Route on the uncompacted estimate, then compact to the primary
        // endpoint's budget
        let inputs = self.gather_inputs(agent, working_context).await?;
        let rough_tokens = estimate_tokens(&format!("{}{}", agent.charter, join_entries(&inputs)));
        let sequence: Vec<ResolvedEndpoint> = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            profile.completion_sequence(rough_tokens, agent.preferred_tier, &mut *rng)
        };
        let Some(primary) = sequence.first() else {
            return Err(EngineError::TierExhausted(
                "no routable endpoints for this prompt".to_string(),
            ));
        };
        let token_budget = primary
            .endpoint
            .context_window
            .saturating_sub(self.config.reserved_reply_tokens);

        let summarizer = SequenceSummarizer {
            llm: &self.llm,
            sequence: &sequence,
            plan_multiplier: daily_settings.plan_credit_multiplier,
        };
        let prompt = assemble_prompt(&inputs, token_budget, Some(&summarizer)).await?;

        // Archive the render whenever compaction did any work
        if prompt.was_compacted() {
            let archive = NewPromptArchive {
                agent_id: agent.id,
                step_id: Some(step_id),
                storage_key: prompt.content_hash(),
                tokens_before: prompt.tokens_before,
                tokens_after: prompt.tokens_after,
                rendered_at: now,
            };
            if let Err(err) = self.archives.record(archive).await {
                tracing::warn!(agent_id = %agent.id, error = %err, "prompt archive write failed");
            }
        }

        let params = CompletionParams {
            messages: vec![
                ChatMessage::system(prompt.system.clone()),
                ChatMessage::user(prompt.user.clone()),
            ],
            tools: self.tools.visible_schemas(agent),
            temperature: None,
            max_tokens: Some(self.config.reserved_reply_tokens),
        };

        let completion = tokio::time::timeout(
            self.config.operation_timeout,
            self.llm
                .complete_sequence(&sequence, &params, daily_settings.plan_credit_multiplier),
        )
        .await
        .map_err(|_| EngineError::Timeout("LLM completion timed out".to_string()))??;

        let step_cost = completion.credit_cost.saturating_add(prompt.summarizer_cost);
        let reasoning = completion.response.content.clone();
        let tool_calls: Vec<ToolInvocation> = completion.response.tool_calls.clone();
        let mut stop = tool_calls.is_empty()
            || tool_calls.iter().any(|call| call.name == SLEEP_TOOL_NAME);

        // Dispatch tool calls in the model's declared order
        for call in &tool_calls {
            let outcome = self
                .dispatcher
                .dispatch(
                    agent,
                    tool_settings,
                    &self.deps,
                    step_id,
                    now,
                    &call.name,
                    call.arguments.clone(),
                )
                .await?;

            // A blocked duplicate is a valid reason to rest
            if outcome.payload.get("auto_sleep_ok").and_then(|v| v.as_bool()) == Some(true) {
                stop = true;
            }

            let compact = outcome.compact.clone().unwrap_or_else(|| {
                let rendered = outcome.payload.to_string();
                if rendered.len() > 2000 {
                    digest_text(&rendered).summary_line()
                } else {
                    rendered
                }
            });
            working_context.push(NarrativeEntry::new(
                now,
                working_context.len() as i64,
                format!("tool {} -> {}", call.name, compact),
            ));
        }

        let mut description = if reasoning.is_empty() {
            format!("{} tool call(s)", tool_calls.len())
        } else {
            reasoning
        };
        description.truncate(2000);

        self.steps
            .create_step(NewStep {
                id: step_id,
                agent_id: agent.id,
                description,
                credits_cost: step_cost,
                eval_run_id: None,
                created_at: now,
            })
            .await?;

        Ok(StepResult {
            cost: step_cost,
            stop,
        })
    }

    /// Fetch message history, recent step tail, and catalogs for assembly
    async fn gather_inputs(
        &self,
        agent: &Agent,
        working_context: &[NarrativeEntry],
    ) -> Result<PromptInputs> {
        let messages = self.messages.recent_messages(agent.id, 50).await?;
        let steps = self.steps.recent_steps(agent.id, 10).await?;
        let variables = self.variables.list(agent.id).await?;
        let files = self.files.recent_files(agent.id, 30).await?;
        let allowlist = self.messages.allowlist_snapshot(agent.id).await?;

        let mut entries: Vec<NarrativeEntry> = Vec::new();
        for message in messages.iter() {
            let direction = if message.is_outbound { "outbound" } else { "inbound" };
            let text = format!(
                "{direction} {} {} -> {}: {}",
                message.channel.as_str(),
                message.from_address,
                message.to_address,
                message.body
            );
            let entry = NarrativeEntry::new(message.timestamp, message.seq, text);
            let entry = if message.body.len() > 2000 {
                entry.with_compact(format!(
                    "{direction} {} message ({} chars): {}",
                    message.channel.as_str(),
                    message.body.len(),
                    digest_text(&message.body).summary_line()
                ))
            } else {
                entry
            };
            entries.push(entry);
        }
        for step in &steps {
            entries.push(NarrativeEntry::new(
                step.created_at,
                0,
                format!("prior step: {}", step.description),
            ));
        }
        entries.extend(working_context.iter().cloned());

        Ok(PromptInputs {
            agent_name: agent.name.clone(),
            charter: agent.charter.clone(),
            capability_hints: Vec::new(),
            plan_guidance: String::new(),
            entries,
            files,
            variables,
            allowlist,
            tool_schemas: self.tools.visible_schemas(agent),
        })
    }

}

struct StepResult {
    cost: Credits,
    stop: bool,
}

struct LockedResult {
    outcome: LoopOutcome,
    /// When set, markers created after this point trigger a re-enqueue
    reentry_watermark: Option<DateTime<Utc>>,
}

impl LockedResult {
    fn terminal(outcome: LoopOutcome) -> Self {
        Self {
            outcome,
            reentry_watermark: None,
        }
    }
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

fn join_entries(inputs: &PromptInputs) -> String {
    inputs
        .entries
        .iter()
        .map(|e| e.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Summarizer that routes through the same fallback sequence as the step
struct SequenceSummarizer<'a> {
    llm: &'a LlmClient,
    sequence: &'a [ResolvedEndpoint],
    plan_multiplier: f64,
}

#[async_trait::async_trait]
impl Summarizer for SequenceSummarizer<'_> {
    async fn summarize(&self, text: &str) -> Result<(String, Credits)> {
        let params = CompletionParams {
            messages: vec![
                ChatMessage::system(
                    "Summarize the following conversation history in a short paragraph. \
                     Preserve names, amounts, commitments, and open questions.",
                ),
                ChatMessage::user(text.to_string()),
            ],
            tools: Vec::new(),
            temperature: None,
            max_tokens: Some(512),
        };
        let outcome = self
            .llm
            .complete_sequence(self.sequence, &params, self.plan_multiplier)
            .await?;
        Ok((outcome.response.content, outcome.credit_cost))
    }
}
