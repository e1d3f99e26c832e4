// In-memory store backend.
//
// One struct implements every store trait over mutex-guarded maps. Used by
// the engine's own tests, by the worker's AGENT_STORE_MODE=memory deployment,
// and as the reference semantics the Postgres backend mirrors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::{Agent, LifeState, OwnerRef, PlanKind};
use crate::burn_rate::{BurnRateSnapshot, BurnRateStore, BurnScope};
use crate::compute::{ComputeControl, ComputeSession, ComputeSessionStore};
use crate::config::ToolPlanSettings;
use crate::credit::{Credits, DailyCreditSettings};
use crate::error::{EngineError, Result};
use crate::evals::{EvalRun, EvalStore, EvalSuite, EvalTask};
use crate::message::{CommsChannel, CommsEndpoint, Message, NewMessage};
use crate::prompt::{NewPromptArchive, PromptArchive};
use crate::routing::RoutingProfile;
use crate::step::{
    NewStep, NewSystemStep, NewToolCall, Step, SystemStep, SystemStepCode, ToolCallRecord,
};
use crate::traits::{
    AgentLock, AgentStore, FileInfo, FilesystemCatalog, JobQueue, LockTicket, MessageStore,
    OutboundTransport, PlanSettingsStore, ProactiveGate, PromptArchiveStore, PruneOutcome,
    RoutingStore, StepStore, VariableStore,
};
use crate::transfer::{TransferInvite, TransferStore};
use crate::variable::{NewVariable, Variable, MAX_VARIABLES_PER_AGENT};

#[derive(Default)]
struct State {
    agents: HashMap<Uuid, Agent>,
    steps: Vec<Step>,
    tool_calls: Vec<ToolCallRecord>,
    system_steps: Vec<SystemStep>,
    messages: Vec<Message>,
    seq_counters: HashMap<String, i64>,
    endpoints: HashMap<Uuid, CommsEndpoint>,
    variables: Vec<Variable>,
    archives: Vec<PromptArchive>,
    daily_settings: HashMap<PlanKind, DailyCreditSettings>,
    tool_settings: HashMap<PlanKind, ToolPlanSettings>,
    locks: HashMap<Uuid, (LockTicket, Instant)>,
    queue: Vec<Uuid>,
    gates: HashMap<Uuid, Instant>,
    files: HashMap<Uuid, Vec<FileInfo>>,
    delivered_email: Vec<Uuid>,
    delivered_sms: Vec<Uuid>,
    burn_snapshots: HashMap<(String, Uuid, u32), BurnRateSnapshot>,
    compute_sessions: HashMap<Uuid, ComputeSession>,
    stop_pod_calls: u32,
    invites: HashMap<Uuid, TransferInvite>,
    suites: HashMap<String, EvalSuite>,
    eval_runs: HashMap<Uuid, EvalRun>,
    eval_tasks: Vec<EvalTask>,
}

/// In-memory implementation of all engine store traits
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    profile: RwLock<Arc<RoutingProfile>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Seeding and inspection helpers
    // ------------------------------------------------------------------

    /// Insert or replace an agent row
    pub fn seed_agent(&self, agent: Agent) {
        self.lock_state().agents.insert(agent.id, agent);
    }

    /// Insert an endpoint, returning its id
    pub fn seed_endpoint(&self, endpoint: CommsEndpoint) -> Uuid {
        let id = endpoint.id;
        self.lock_state().endpoints.insert(id, endpoint);
        id
    }

    pub fn seed_files(&self, agent_id: Uuid, files: Vec<FileInfo>) {
        self.lock_state().files.insert(agent_id, files);
    }

    pub fn seed_suite(&self, suite: EvalSuite) {
        self.lock_state().suites.insert(suite.slug.clone(), suite);
    }

    /// Replace the active routing profile
    pub fn set_profile(&self, profile: RoutingProfile) {
        *self.profile.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(profile);
    }

    pub fn set_daily_credit_settings(&self, plan: PlanKind, settings: DailyCreditSettings) {
        self.lock_state().daily_settings.insert(plan, settings);
    }

    pub fn set_tool_settings(&self, plan: PlanKind, settings: ToolPlanSettings) {
        self.lock_state().tool_settings.insert(plan, settings);
    }

    /// Agent ids enqueued for processing, clearing the queue
    pub fn drain_queue(&self) -> Vec<Uuid> {
        std::mem::take(&mut self.lock_state().queue)
    }

    pub fn delivered_email_count(&self) -> usize {
        self.lock_state().delivered_email.len()
    }

    pub fn delivered_sms_count(&self) -> usize {
        self.lock_state().delivered_sms.len()
    }

    pub fn stop_pod_calls(&self) -> u32 {
        self.lock_state().stop_pod_calls
    }

    /// Notes of the most recent system step for an agent
    pub fn last_system_step_notes(&self, agent_id: Uuid) -> Option<serde_json::Value> {
        let state = self.lock_state();
        state
            .system_steps
            .iter()
            .rev()
            .find(|s| s.agent_id == agent_id)
            .map(|s| s.notes.clone())
    }

    /// All system steps recorded for an agent, oldest first
    pub fn system_steps(&self, agent_id: Uuid) -> Vec<SystemStep> {
        self.lock_state()
            .system_steps
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// All steps recorded for an agent, ordered by (created_at, id)
    pub fn steps(&self, agent_id: Uuid) -> Vec<Step> {
        let mut steps: Vec<Step> = self
            .lock_state()
            .steps
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        steps
    }

    pub fn tool_calls(&self, agent_id: Uuid) -> Vec<ToolCallRecord> {
        let mut calls: Vec<ToolCallRecord> = self
            .lock_state()
            .tool_calls
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        calls
    }

    pub fn messages(&self, agent_id: Uuid) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .lock_state()
            .messages
            .iter()
            .filter(|m| m.agent_id == agent_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        messages
    }

    pub fn archives(&self) -> Vec<PromptArchive> {
        self.lock_state().archives.clone()
    }
}

// ============================================================================
// AgentStore
// ============================================================================

#[async_trait]
impl AgentStore for InMemoryStore {
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        Ok(self.lock_state().agents.get(&agent_id).cloned())
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        self.lock_state().agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn proactive_candidates(&self, limit: usize) -> Result<Vec<Agent>> {
        let state = self.lock_state();
        let mut candidates: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| {
                a.proactive_opt_in
                    && a.is_active
                    && !a.shutdown_requested
                    && a.life_state == LifeState::Active
            })
            .cloned()
            .collect();
        // NULLS FIRST ordering: untriggered, then stalest
        candidates.sort_by(|a, b| {
            a.proactive_last_trigger_at
                .cmp(&b.proactive_last_trigger_at)
                .then(a.last_interaction_at.cmp(&b.last_interaction_at))
                .then(a.created_at.cmp(&b.created_at))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn expiration_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<Agent>> {
        let state = self.lock_state();
        Ok(state
            .agents
            .values()
            .filter(|a| {
                a.life_state == LifeState::Active
                    && a.is_active
                    && !a.schedule.is_empty()
                    && a.last_interaction_at.unwrap_or(a.created_at) <= cutoff
            })
            .cloned()
            .collect())
    }
}

// ============================================================================
// StepStore
// ============================================================================

#[async_trait]
impl StepStore for InMemoryStore {
    async fn create_step(&self, step: NewStep) -> Result<Step> {
        let row = Step {
            id: step.id,
            agent_id: step.agent_id,
            description: step.description,
            credits_cost: step.credits_cost,
            eval_run_id: step.eval_run_id,
            created_at: step.created_at,
        };
        self.lock_state().steps.push(row.clone());
        Ok(row)
    }

    async fn create_tool_call(&self, call: NewToolCall) -> Result<ToolCallRecord> {
        let row = ToolCallRecord {
            id: Uuid::now_v7(),
            step_id: call.step_id,
            agent_id: call.agent_id,
            tool_name: call.tool_name,
            params: call.params,
            result: call.result,
            created_at: call.created_at,
        };
        self.lock_state().tool_calls.push(row.clone());
        Ok(row)
    }

    async fn create_system_step(&self, step: NewSystemStep) -> Result<SystemStep> {
        let row = SystemStep {
            id: Uuid::now_v7(),
            step_id: step.step_id,
            agent_id: step.agent_id,
            code: step.code,
            notes: step.notes,
            created_at: step.created_at,
        };
        self.lock_state().system_steps.push(row.clone());
        Ok(row)
    }

    async fn recent_steps(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Step>> {
        let mut steps = self.steps(agent_id);
        if steps.len() > limit {
            steps.drain(..steps.len() - limit);
        }
        Ok(steps)
    }

    async fn recent_tool_calls(&self, agent_id: Uuid, limit: usize) -> Result<Vec<ToolCallRecord>> {
        let mut calls = self.tool_calls(agent_id);
        if calls.len() > limit {
            calls.drain(..calls.len() - limit);
        }
        Ok(calls)
    }

    async fn daily_credit_usage(&self, agent_id: Uuid, day_start: DateTime<Utc>) -> Result<Credits> {
        let state = self.lock_state();
        Ok(state
            .steps
            .iter()
            .filter(|s| s.agent_id == agent_id && s.created_at >= day_start)
            .fold(Credits::ZERO, |acc, s| acc.saturating_add(s.credits_cost)))
    }

    async fn credits_used_between(
        &self,
        owner: OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Credits> {
        let state = self.lock_state();
        let owned: Vec<Uuid> = state
            .agents
            .values()
            .filter(|a| a.owner == owner)
            .map(|a| a.id)
            .collect();
        Ok(state
            .steps
            .iter()
            .filter(|s| owned.contains(&s.agent_id) && s.created_at >= from && s.created_at < to)
            .fold(Credits::ZERO, |acc, s| acc.saturating_add(s.credits_cost)))
    }

    async fn system_steps_since(
        &self,
        agent_id: Uuid,
        code: SystemStepCode,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let state = self.lock_state();
        Ok(state
            .system_steps
            .iter()
            .filter(|s| s.agent_id == agent_id && s.code == code && s.created_at >= since)
            .count() as u32)
    }

    async fn tool_calls_for_owner_since(
        &self,
        owner: OwnerRef,
        tool_name: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let state = self.lock_state();
        let owned: Vec<Uuid> = state
            .agents
            .values()
            .filter(|a| a.owner == owner)
            .map(|a| a.id)
            .collect();
        Ok(state
            .tool_calls
            .iter()
            .filter(|c| {
                owned.contains(&c.agent_id) && c.tool_name == tool_name && c.created_at >= since
            })
            .count() as u32)
    }
}

// ============================================================================
// MessageStore
// ============================================================================

fn conversation_key(message: &NewMessage) -> String {
    match message.conversation_id {
        Some(id) => id.to_string(),
        None => {
            let counterpart = if message.is_outbound {
                &message.to_address
            } else {
                &message.from_address
            };
            format!(
                "{}:{}:{}",
                message.agent_id,
                message.channel.as_str(),
                counterpart.to_lowercase()
            )
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        let key = conversation_key(&message);
        let mut state = self.lock_state();
        let seq = state.seq_counters.entry(key).or_insert(0);
        *seq += 1;
        let row = Message {
            id: Uuid::now_v7(),
            agent_id: message.agent_id,
            conversation_id: message.conversation_id,
            channel: message.channel,
            from_address: message.from_address,
            to_address: message.to_address,
            is_outbound: message.is_outbound,
            body: message.body,
            subject: message.subject,
            attachment_ids: message.attachment_ids,
            seq: *seq,
            timestamp: message.timestamp,
            delivery_error: None,
        };
        state.messages.push(row.clone());
        Ok(row)
    }

    async fn recent_messages(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let mut messages = self.messages(agent_id);
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    async fn last_inbound(&self, agent_id: Uuid) -> Result<Option<Message>> {
        Ok(self
            .messages(agent_id)
            .into_iter()
            .rev()
            .find(|m| !m.is_outbound))
    }

    async fn last_outbound(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
        to_address: Option<&str>,
        conversation_id: Option<Uuid>,
    ) -> Result<Option<Message>> {
        Ok(self
            .messages(agent_id)
            .into_iter()
            .rev()
            .find(|m| {
                m.is_outbound
                    && m.channel == channel
                    && to_address.is_none_or(|to| m.to_address.eq_ignore_ascii_case(to))
                    && conversation_id.is_none_or(|c| m.conversation_id == Some(c))
            }))
    }

    async fn record_delivery_error(&self, message_id: Uuid, error: &str) -> Result<()> {
        let mut state = self.lock_state();
        if let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) {
            message.delivery_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn allowlist_snapshot(&self, agent_id: Uuid) -> Result<Vec<String>> {
        // Default policy: everyone the agent has already conversed with
        let mut addresses: Vec<String> = self
            .messages(agent_id)
            .iter()
            .map(|m| {
                if m.is_outbound {
                    m.to_address.to_lowercase()
                } else {
                    m.from_address.to_lowercase()
                }
            })
            .collect();
        addresses.sort();
        addresses.dedup();
        Ok(addresses)
    }

    async fn agent_endpoint(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
    ) -> Result<Option<CommsEndpoint>> {
        let state = self.lock_state();
        let mut owned: Vec<&CommsEndpoint> = state
            .endpoints
            .values()
            .filter(|e| e.owner_agent_id == Some(agent_id) && e.channel == channel)
            .collect();
        owned.sort_by_key(|e| !e.is_primary);
        Ok(owned.first().map(|e| (*e).clone()))
    }

    async fn endpoint(&self, endpoint_id: Uuid) -> Result<Option<CommsEndpoint>> {
        Ok(self.lock_state().endpoints.get(&endpoint_id).cloned())
    }
}

// ============================================================================
// VariableStore
// ============================================================================

#[async_trait]
impl VariableStore for InMemoryStore {
    async fn get_or_create(
        &self,
        agent_id: Uuid,
        variable: NewVariable,
        created_at: DateTime<Utc>,
    ) -> Result<(Variable, bool)> {
        let mut state = self.lock_state();

        if let Some(existing) = state
            .variables
            .iter()
            .find(|v| v.agent_id == agent_id && v.name == variable.name)
        {
            return Ok((existing.clone(), false));
        }

        let row = Variable {
            id: Uuid::now_v7(),
            agent_id,
            name: variable.name,
            value: variable.value,
            is_json: variable.is_json,
            size_bytes: variable.size_bytes,
            tool_call_id: variable.tool_call_id,
            summary: variable.summary,
            created_at,
        };
        state.variables.push(row.clone());

        // Enforce the per-agent cap: keep the most recent by (created_at, id)
        let mut mine: Vec<(DateTime<Utc>, Uuid)> = state
            .variables
            .iter()
            .filter(|v| v.agent_id == agent_id)
            .map(|v| (v.created_at, v.id))
            .collect();
        if mine.len() > MAX_VARIABLES_PER_AGENT {
            mine.sort_by(|a, b| b.cmp(a));
            let keep: Vec<Uuid> = mine
                .iter()
                .take(MAX_VARIABLES_PER_AGENT)
                .map(|(_, id)| *id)
                .collect();
            state
                .variables
                .retain(|v| v.agent_id != agent_id || keep.contains(&v.id));
        }

        Ok((row, true))
    }

    async fn get(&self, agent_id: Uuid, name: &str) -> Result<Option<Variable>> {
        Ok(self
            .lock_state()
            .variables
            .iter()
            .find(|v| v.agent_id == agent_id && v.name == name)
            .cloned())
    }

    async fn list(&self, agent_id: Uuid) -> Result<Vec<Variable>> {
        let mut variables: Vec<Variable> = self
            .lock_state()
            .variables
            .iter()
            .filter(|v| v.agent_id == agent_id)
            .cloned()
            .collect();
        variables.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(variables)
    }
}

// ============================================================================
// PromptArchiveStore
// ============================================================================

#[async_trait]
impl PromptArchiveStore for InMemoryStore {
    async fn record(&self, archive: NewPromptArchive) -> Result<PromptArchive> {
        let row = PromptArchive {
            id: Uuid::now_v7(),
            agent_id: archive.agent_id,
            step_id: archive.step_id,
            storage_key: archive.storage_key,
            tokens_before: archive.tokens_before,
            tokens_after: archive.tokens_after,
            tokens_saved: archive.tokens_before.saturating_sub(archive.tokens_after),
            rendered_at: archive.rendered_at,
        };
        self.lock_state().archives.push(row.clone());
        Ok(row)
    }

    async fn prune_older_than(
        &self,
        cutoff: DateTime<Utc>,
        _chunk_size: usize,
        dry_run: bool,
    ) -> Result<PruneOutcome> {
        let mut state = self.lock_state();
        let found = state
            .archives
            .iter()
            .filter(|a| a.rendered_at < cutoff)
            .count() as u64;
        if dry_run {
            return Ok(PruneOutcome { found, deleted: 0 });
        }
        state.archives.retain(|a| a.rendered_at >= cutoff);
        Ok(PruneOutcome {
            found,
            deleted: found,
        })
    }
}

// ============================================================================
// Routing / plan settings
// ============================================================================

#[async_trait]
impl RoutingStore for InMemoryStore {
    async fn active_profile(&self) -> Result<Arc<RoutingProfile>> {
        Ok(self.profile.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn invalidate(&self) {}
}

#[async_trait]
impl PlanSettingsStore for InMemoryStore {
    async fn daily_credit_settings(&self, plan: PlanKind) -> Result<DailyCreditSettings> {
        Ok(self
            .lock_state()
            .daily_settings
            .get(&plan)
            .cloned()
            .unwrap_or_default())
    }

    async fn tool_settings(&self, plan: PlanKind) -> Result<ToolPlanSettings> {
        Ok(self
            .lock_state()
            .tool_settings
            .get(&plan)
            .cloned()
            .unwrap_or_default())
    }

    async fn invalidate(&self) {}
}

// ============================================================================
// Lock / queue / gate
// ============================================================================

#[async_trait]
impl AgentLock for InMemoryStore {
    async fn try_acquire(&self, agent_id: Uuid, ttl: StdDuration) -> Result<Option<LockTicket>> {
        let mut state = self.lock_state();
        let now = Instant::now();
        if let Some((_, expires_at)) = state.locks.get(&agent_id) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let ticket = LockTicket(Uuid::now_v7());
        state.locks.insert(agent_id, (ticket, now + ttl));
        Ok(Some(ticket))
    }

    async fn release(&self, agent_id: Uuid, ticket: LockTicket) -> Result<()> {
        let mut state = self.lock_state();
        match state.locks.get(&agent_id) {
            Some((held, _)) if *held == ticket => {
                state.locks.remove(&agent_id);
                Ok(())
            }
            Some(_) => Err(EngineError::store("lock held by another ticket")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryStore {
    async fn enqueue_process_events(&self, agent_id: Uuid) -> Result<()> {
        self.lock_state().queue.push(agent_id);
        Ok(())
    }
}

#[async_trait]
impl ProactiveGate for InMemoryStore {
    async fn is_open(&self, user_id: Uuid) -> Result<bool> {
        let state = self.lock_state();
        Ok(match state.gates.get(&user_id) {
            Some(expires_at) => *expires_at <= Instant::now(),
            None => true,
        })
    }

    async fn set(&self, user_id: Uuid, ttl: StdDuration) -> Result<()> {
        self.lock_state().gates.insert(user_id, Instant::now() + ttl);
        Ok(())
    }

    async fn release(&self, user_id: Uuid) -> Result<()> {
        self.lock_state().gates.remove(&user_id);
        Ok(())
    }
}

// ============================================================================
// Filesystem / transport
// ============================================================================

#[async_trait]
impl FilesystemCatalog for InMemoryStore {
    async fn recent_files(&self, agent_id: Uuid, limit: usize) -> Result<Vec<FileInfo>> {
        let state = self.lock_state();
        let mut files = state.files.get(&agent_id).cloned().unwrap_or_default();
        files.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        files.truncate(limit);
        Ok(files)
    }
}

#[async_trait]
impl OutboundTransport for InMemoryStore {
    async fn deliver_email(&self, message: &Message) -> Result<()> {
        self.lock_state().delivered_email.push(message.id);
        Ok(())
    }

    async fn deliver_sms(&self, message: &Message) -> Result<()> {
        self.lock_state().delivered_sms.push(message.id);
        Ok(())
    }
}

// ============================================================================
// Burn rate / compute / transfer / evals
// ============================================================================

#[async_trait]
impl BurnRateStore for InMemoryStore {
    async fn upsert_snapshot(&self, snapshot: BurnRateSnapshot) -> Result<()> {
        let key = (
            snapshot.scope.scope_type().to_string(),
            snapshot.scope.scope_id(),
            snapshot.window_minutes,
        );
        self.lock_state().burn_snapshots.insert(key, snapshot);
        Ok(())
    }

    async fn get_snapshot(
        &self,
        scope: BurnScope,
        window_minutes: u32,
    ) -> Result<Option<BurnRateSnapshot>> {
        let key = (scope.scope_type().to_string(), scope.scope_id(), window_minutes);
        Ok(self.lock_state().burn_snapshots.get(&key).cloned())
    }
}

#[async_trait]
impl ComputeSessionStore for InMemoryStore {
    async fn get_for_agent(&self, agent_id: Uuid) -> Result<Option<ComputeSession>> {
        Ok(self.lock_state().compute_sessions.get(&agent_id).cloned())
    }

    async fn save(&self, session: &ComputeSession) -> Result<()> {
        self.lock_state()
            .compute_sessions
            .insert(session.agent_id, session.clone());
        Ok(())
    }

    async fn list_idle_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<ComputeSession>> {
        Ok(self
            .lock_state()
            .compute_sessions
            .values()
            .filter(|s| {
                s.state == crate::compute::ComputeState::Running && s.last_activity_at < cutoff
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ComputeControl for InMemoryStore {
    async fn stop_pod(&self, _session: &ComputeSession) -> Result<()> {
        self.lock_state().stop_pod_calls += 1;
        Ok(())
    }
}

#[async_trait]
impl TransferStore for InMemoryStore {
    async fn create_invite(&self, invite: TransferInvite) -> Result<()> {
        self.lock_state().invites.insert(invite.id, invite);
        Ok(())
    }

    async fn get_invite(&self, invite_id: Uuid) -> Result<Option<TransferInvite>> {
        Ok(self.lock_state().invites.get(&invite_id).cloned())
    }

    async fn update_invite(&self, invite: &TransferInvite) -> Result<()> {
        self.lock_state().invites.insert(invite.id, invite.clone());
        Ok(())
    }

    async fn pending_for_agent(&self, agent_id: Uuid) -> Result<Vec<TransferInvite>> {
        Ok(self
            .lock_state()
            .invites
            .values()
            .filter(|i| i.agent_id == agent_id && i.status.is_open())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EvalStore for InMemoryStore {
    async fn get_suite(&self, slug: &str) -> Result<Option<EvalSuite>> {
        Ok(self.lock_state().suites.get(slug).cloned())
    }

    async fn create_run(&self, run: EvalRun) -> Result<()> {
        self.lock_state().eval_runs.insert(run.id, run);
        Ok(())
    }

    async fn create_task(&self, task: EvalTask) -> Result<()> {
        self.lock_state().eval_tasks.push(task);
        Ok(())
    }

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<EvalTask>> {
        Ok(self
            .lock_state()
            .eval_tasks
            .iter()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn update_task(&self, task: &EvalTask) -> Result<()> {
        let mut state = self.lock_state();
        if let Some(existing) = state.eval_tasks.iter_mut().find(|t| t.id == task.id) {
            *existing = task.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn variable_get_or_create_is_idempotent() {
        let store = InMemoryStore::new();
        let agent_id = Uuid::now_v7();
        let variable = NewVariable::from_value("answer", &serde_json::json!(42), None, "");

        let (first, created) = store
            .get_or_create(agent_id, variable.clone(), Utc::now())
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .get_or_create(agent_id, variable, Utc::now())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.list(agent_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn message_seq_is_monotone_per_conversation() {
        let store = InMemoryStore::new();
        let agent_id = Uuid::now_v7();
        let now = Utc::now();

        for i in 0..3 {
            let message = store
                .create_message(NewMessage::inbound(
                    agent_id,
                    CommsChannel::Email,
                    "user@example.com",
                    "agent@example.com",
                    format!("message {i}"),
                    now,
                ))
                .await
                .unwrap();
            assert_eq!(message.seq, i + 1);
        }

        // A different counterpart starts its own sequence
        let other = store
            .create_message(NewMessage::inbound(
                agent_id,
                CommsChannel::Email,
                "other@example.com",
                "agent@example.com",
                "hello",
                now,
            ))
            .await
            .unwrap();
        assert_eq!(other.seq, 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = InMemoryStore::new();
        let agent_id = Uuid::now_v7();
        let ttl = StdDuration::from_secs(60);

        let ticket = store.try_acquire(agent_id, ttl).await.unwrap().unwrap();
        assert!(store.try_acquire(agent_id, ttl).await.unwrap().is_none());

        crate::traits::AgentLock::release(&store, agent_id, ticket).await.unwrap();
        assert!(store.try_acquire(agent_id, ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let store = InMemoryStore::new();
        let agent_id = Uuid::now_v7();

        let _ticket = store
            .try_acquire(agent_id, StdDuration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(store
            .try_acquire(agent_id, StdDuration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn archive_prune_respects_dry_run() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for days_ago in [1, 10, 40, 90] {
            store
                .record(NewPromptArchive {
                    agent_id: Uuid::now_v7(),
                    step_id: None,
                    storage_key: format!("key-{days_ago}"),
                    tokens_before: 1000,
                    tokens_after: 500,
                    rendered_at: now - chrono::Duration::days(days_ago),
                })
                .await
                .unwrap();
        }

        let cutoff = now - chrono::Duration::days(30);
        let dry = store.prune_older_than(cutoff, 500, true).await.unwrap();
        assert_eq!(dry, PruneOutcome { found: 2, deleted: 0 });
        assert_eq!(store.archives().len(), 4);

        let wet = store.prune_older_than(cutoff, 500, false).await.unwrap();
        assert_eq!(wet, PruneOutcome { found: 2, deleted: 2 });
        assert_eq!(store.archives().len(), 2);
    }
}
