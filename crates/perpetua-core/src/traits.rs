// Store and collaborator traits.
//
// The engine is DB-agnostic: every persistence and side-effect seam is an
// async trait implemented by perpetua-storage (Postgres or in-memory) or by
// the hosting binary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::{Agent, OwnerRef, PlanKind};
use crate::config::ToolPlanSettings;
use crate::credit::{Credits, DailyCreditSettings};
use crate::error::Result;
use crate::message::{CommsChannel, Message, NewMessage};
use crate::prompt::{NewPromptArchive, PromptArchive};
use crate::routing::RoutingProfile;
use crate::step::{
    NewStep, NewSystemStep, NewToolCall, Step, SystemStep, SystemStepCode, ToolCallRecord,
};
use crate::variable::{NewVariable, Variable};

// ============================================================================
// Agent store
// ============================================================================

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>>;

    async fn update_agent(&self, agent: &Agent) -> Result<()>;

    /// Proactive candidates: opted-in, active agents ordered by
    /// (proactive_last_trigger_at ASC NULLS FIRST, last_interaction_at ASC
    /// NULLS FIRST, created_at ASC), capped at `limit`.
    async fn proactive_candidates(&self, limit: usize) -> Result<Vec<Agent>>;

    /// Active agents with a non-empty schedule whose last interaction (or
    /// creation) predates `cutoff`.
    async fn expiration_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<Agent>>;
}

// ============================================================================
// Step store
// ============================================================================

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn create_step(&self, step: NewStep) -> Result<Step>;

    async fn create_tool_call(&self, call: NewToolCall) -> Result<ToolCallRecord>;

    async fn create_system_step(&self, step: NewSystemStep) -> Result<SystemStep>;

    /// Steps for an agent ordered by (created_at, id), newest last
    async fn recent_steps(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Step>>;

    /// Tool calls for an agent ordered by created_at, newest last
    async fn recent_tool_calls(&self, agent_id: Uuid, limit: usize) -> Result<Vec<ToolCallRecord>>;

    /// Sum of step credits for the agent since `day_start`
    async fn daily_credit_usage(&self, agent_id: Uuid, day_start: DateTime<Utc>)
        -> Result<Credits>;

    /// Sum of step credits across all agents of an owner in a window
    async fn credits_used_between(
        &self,
        owner: OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Credits>;

    /// Count of system steps with `code` for the agent created at or after
    /// `since`
    async fn system_steps_since(
        &self,
        agent_id: Uuid,
        code: SystemStepCode,
        since: DateTime<Utc>,
    ) -> Result<u32>;

    /// Count of tool calls with `tool_name` across all agents of an owner
    /// created at or after `since` (per-plan hourly rate limits)
    async fn tool_calls_for_owner_since(
        &self,
        owner: OwnerRef,
        tool_name: &str,
        since: DateTime<Utc>,
    ) -> Result<u32>;
}

// ============================================================================
// Message store
// ============================================================================

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning the next per-conversation `seq`
    async fn create_message(&self, message: NewMessage) -> Result<Message>;

    /// Messages for an agent ordered by (timestamp, seq), newest last
    async fn recent_messages(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Message>>;

    /// Most recent inbound message for the agent
    async fn last_inbound(&self, agent_id: Uuid) -> Result<Option<Message>>;

    /// Most recent outbound by this agent on a channel, optionally narrowed
    /// to a destination address or conversation (duplicate guard)
    async fn last_outbound(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
        to_address: Option<&str>,
        conversation_id: Option<Uuid>,
    ) -> Result<Option<Message>>;

    /// Record a transport delivery failure on the message
    async fn record_delivery_error(&self, message_id: Uuid, error: &str) -> Result<()>;

    /// Addresses currently allowed to converse with the agent
    async fn allowlist_snapshot(&self, agent_id: Uuid) -> Result<Vec<String>>;

    /// Agent-owned endpoint used as the "from" side for a channel,
    /// preferring the primary endpoint
    async fn agent_endpoint(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
    ) -> Result<Option<crate::message::CommsEndpoint>>;

    /// Look up an endpoint by id
    async fn endpoint(&self, endpoint_id: Uuid) -> Result<Option<crate::message::CommsEndpoint>>;
}

// ============================================================================
// Variable store
// ============================================================================

#[async_trait]
pub trait VariableStore: Send + Sync {
    /// Idempotent insert: returns the existing row when the name is taken.
    /// On insert, evicts beyond-cap variables oldest-first in the same
    /// transaction. The bool is true when a row was created.
    async fn get_or_create(
        &self,
        agent_id: Uuid,
        variable: NewVariable,
        created_at: DateTime<Utc>,
    ) -> Result<(Variable, bool)>;

    async fn get(&self, agent_id: Uuid, name: &str) -> Result<Option<Variable>>;

    /// All variables for the agent, newest first
    async fn list(&self, agent_id: Uuid) -> Result<Vec<Variable>>;
}

// ============================================================================
// Prompt archive store
// ============================================================================

/// Outcome of a retention prune pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub found: u64,
    pub deleted: u64,
}

#[async_trait]
pub trait PromptArchiveStore: Send + Sync {
    async fn record(&self, archive: NewPromptArchive) -> Result<PromptArchive>;

    /// Delete archives rendered before `cutoff`, scanning in chunks.
    /// Dry runs count without deleting. Per-row failures are logged and
    /// skipped.
    async fn prune_older_than(
        &self,
        cutoff: DateTime<Utc>,
        chunk_size: usize,
        dry_run: bool,
    ) -> Result<PruneOutcome>;
}

// ============================================================================
// Routing config
// ============================================================================

#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// The active routing profile. Read-mostly; implementations cache and
    /// bust on `invalidate`.
    async fn active_profile(&self) -> Result<Arc<RoutingProfile>>;

    async fn invalidate(&self);
}

// ============================================================================
// Plan settings
// ============================================================================

#[async_trait]
pub trait PlanSettingsStore: Send + Sync {
    async fn daily_credit_settings(&self, plan: PlanKind) -> Result<DailyCreditSettings>;

    async fn tool_settings(&self, plan: PlanKind) -> Result<ToolPlanSettings>;

    async fn invalidate(&self);
}

// ============================================================================
// Agent lock
// ============================================================================

/// Opaque ticket proving lock ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTicket(pub Uuid);

/// Advisory lock enforcing single-flight event processing per agent.
/// Implementations must expire held locks after the TTL so a crashed worker
/// cannot strand an agent.
#[async_trait]
pub trait AgentLock: Send + Sync {
    async fn try_acquire(&self, agent_id: Uuid, ttl: Duration) -> Result<Option<LockTicket>>;

    async fn release(&self, agent_id: Uuid, ticket: LockTicket) -> Result<()>;
}

// ============================================================================
// Job queue
// ============================================================================

/// Queue feeding the worker pool
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue_process_events(&self, agent_id: Uuid) -> Result<()>;
}

// ============================================================================
// Proactive user gate
// ============================================================================

/// Per-user TTL gate preventing multiple proactive triggers for one user
/// inside the effective interval
#[async_trait]
pub trait ProactiveGate: Send + Sync {
    /// True when no gate is currently held for the user
    async fn is_open(&self, user_id: Uuid) -> Result<bool>;

    async fn set(&self, user_id: Uuid, ttl: Duration) -> Result<()>;

    async fn release(&self, user_id: Uuid) -> Result<()>;
}

// ============================================================================
// Outbound transports
// ============================================================================

/// Pluggable delivery layer. The core persists the Message first, then calls
/// the transport; failures are recorded on the message and retried by the
/// transport layer, not by the core.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn deliver_email(&self, message: &Message) -> Result<()>;

    async fn deliver_sms(&self, message: &Message) -> Result<()>;
}

// ============================================================================
// Filesystem catalog
// ============================================================================

/// File entry surfaced to the prompt assembler
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size_bytes: u64,
    pub mime: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait FilesystemCatalog: Send + Sync {
    /// Most-recently-updated files for the agent, capped at `limit`
    async fn recent_files(&self, agent_id: Uuid, limit: usize) -> Result<Vec<FileInfo>>;
}
