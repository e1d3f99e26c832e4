// Database row models and conversions to the core domain types.

use chrono::{DateTime, Utc};
use perpetua_core::agent::{Agent, AllowlistPolicy, LifeState, OwnerRef, PlanKind, PreferredTier};
use perpetua_core::compute::{ComputeSession, ComputeState};
use perpetua_core::credit::Credits;
use perpetua_core::message::{CommsChannel, CommsEndpoint, Message};
use perpetua_core::prompt::PromptArchive;
use perpetua_core::step::{Step, SystemStep, SystemStepCode, ToolCallRecord};
use perpetua_core::transfer::{InviteStatus, TransferInvite};
use perpetua_core::variable::Variable;
use sqlx::FromRow;
use uuid::Uuid;

pub(crate) fn owner_from_parts(owner_type: &str, owner_id: Uuid) -> OwnerRef {
    match owner_type {
        "organization" => OwnerRef::Organization(owner_id),
        _ => OwnerRef::User(owner_id),
    }
}

pub(crate) fn owner_type(owner: OwnerRef) -> &'static str {
    match owner {
        OwnerRef::User(_) => "user",
        OwnerRef::Organization(_) => "organization",
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AgentRow {
    pub id: Uuid,
    pub name: String,
    pub owner_type: String,
    pub owner_id: Uuid,
    pub plan: String,
    pub charter: String,
    pub schedule: String,
    pub schedule_snapshot: String,
    pub life_state: String,
    pub is_active: bool,
    pub allowlist_policy: String,
    pub preferred_contact_endpoint_id: Option<Uuid>,
    pub daily_credit_soft_target_micros: Option<i64>,
    pub preferred_tier: String,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub last_expired_at: Option<DateTime<Utc>>,
    pub sent_expiration_notice: bool,
    pub proactive_opt_in: bool,
    pub proactive_min_interval_minutes: i32,
    pub proactive_max_daily: i32,
    pub proactive_last_trigger_at: Option<DateTime<Utc>>,
    pub cron_backoff_exponent: i32,
    pub cron_runs_skipped: i32,
    pub shutdown_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        Agent {
            id: row.id,
            name: row.name,
            owner: owner_from_parts(&row.owner_type, row.owner_id),
            plan: PlanKind::from(row.plan.as_str()),
            charter: row.charter,
            schedule: row.schedule,
            schedule_snapshot: row.schedule_snapshot,
            life_state: LifeState::from(row.life_state.as_str()),
            is_active: row.is_active,
            allowlist_policy: if row.allowlist_policy == "MANUAL" {
                AllowlistPolicy::Manual
            } else {
                AllowlistPolicy::Default
            },
            preferred_contact_endpoint_id: row.preferred_contact_endpoint_id,
            daily_credit_soft_target: row.daily_credit_soft_target_micros.map(Credits::from_micros),
            preferred_tier: PreferredTier::from(row.preferred_tier.as_str()),
            last_interaction_at: row.last_interaction_at,
            last_expired_at: row.last_expired_at,
            sent_expiration_notice: row.sent_expiration_notice,
            proactive_opt_in: row.proactive_opt_in,
            proactive_min_interval_minutes: row.proactive_min_interval_minutes.max(0) as u32,
            proactive_max_daily: row.proactive_max_daily.max(0) as u32,
            proactive_last_trigger_at: row.proactive_last_trigger_at,
            cron_backoff_exponent: row.cron_backoff_exponent.max(0) as u32,
            cron_runs_skipped: row.cron_runs_skipped.max(0) as u32,
            shutdown_requested: row.shutdown_requested,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct StepRow {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub description: String,
    pub credits_cost_micros: i64,
    pub eval_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<StepRow> for Step {
    fn from(row: StepRow) -> Self {
        Step {
            id: row.id,
            agent_id: row.agent_id,
            description: row.description,
            credits_cost: Credits::from_micros(row.credits_cost_micros),
            eval_run_id: row.eval_run_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ToolCallRow {
    pub id: Uuid,
    pub step_id: Uuid,
    pub agent_id: Uuid,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub result: String,
    pub created_at: DateTime<Utc>,
}

impl From<ToolCallRow> for ToolCallRecord {
    fn from(row: ToolCallRow) -> Self {
        ToolCallRecord {
            id: row.id,
            step_id: row.step_id,
            agent_id: row.agent_id,
            tool_name: row.tool_name,
            params: row.params,
            result: row.result,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SystemStepRow {
    pub id: Uuid,
    pub step_id: Uuid,
    pub agent_id: Uuid,
    pub code: String,
    pub notes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<SystemStepRow> for SystemStep {
    fn from(row: SystemStepRow) -> Self {
        SystemStep {
            id: row.id,
            step_id: row.step_id,
            agent_id: row.agent_id,
            code: SystemStepCode::from(row.code.as_str()),
            notes: row.notes,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub channel: String,
    pub from_address: String,
    pub to_address: String,
    pub is_outbound: bool,
    pub body: String,
    pub subject: Option<String>,
    pub attachment_ids: Vec<Uuid>,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub delivery_error: Option<String>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            agent_id: row.agent_id,
            conversation_id: row.conversation_id,
            channel: CommsChannel::from(row.channel.as_str()),
            from_address: row.from_address,
            to_address: row.to_address,
            is_outbound: row.is_outbound,
            body: row.body,
            subject: row.subject,
            attachment_ids: row.attachment_ids,
            seq: row.seq,
            timestamp: row.timestamp,
            delivery_error: row.delivery_error,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EndpointRow {
    pub id: Uuid,
    pub channel: String,
    pub address: String,
    pub owner_agent_id: Option<Uuid>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

impl From<EndpointRow> for CommsEndpoint {
    fn from(row: EndpointRow) -> Self {
        CommsEndpoint {
            id: row.id,
            channel: CommsChannel::from(row.channel.as_str()),
            address: row.address,
            owner_agent_id: row.owner_agent_id,
            is_primary: row.is_primary,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct VariableRow {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub value: String,
    pub is_json: bool,
    pub size_bytes: i64,
    pub tool_call_id: Option<Uuid>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl From<VariableRow> for Variable {
    fn from(row: VariableRow) -> Self {
        Variable {
            id: row.id,
            agent_id: row.agent_id,
            name: row.name,
            value: row.value,
            is_json: row.is_json,
            size_bytes: row.size_bytes.max(0) as usize,
            tool_call_id: row.tool_call_id,
            summary: row.summary,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PromptArchiveRow {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub step_id: Option<Uuid>,
    pub storage_key: String,
    pub tokens_before: i32,
    pub tokens_after: i32,
    pub tokens_saved: i32,
    pub rendered_at: DateTime<Utc>,
}

impl From<PromptArchiveRow> for PromptArchive {
    fn from(row: PromptArchiveRow) -> Self {
        PromptArchive {
            id: row.id,
            agent_id: row.agent_id,
            step_id: row.step_id,
            storage_key: row.storage_key,
            tokens_before: row.tokens_before.max(0) as u32,
            tokens_after: row.tokens_after.max(0) as u32,
            tokens_saved: row.tokens_saved.max(0) as u32,
            rendered_at: row.rendered_at,
        }
    }
}

// ============================================
// LLM routing rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ProviderRow {
    pub id: Uuid,
    pub key: String,
    pub display_name: String,
    pub enabled: bool,
    pub api_key_encrypted: Option<Vec<u8>>,
    pub env_var_name: String,
    pub backend: String,
    pub vertex_project: String,
    pub vertex_location: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct LlmEndpointRow {
    pub id: Uuid,
    pub key: String,
    pub provider_id: Uuid,
    pub model: String,
    pub base_url: Option<String>,
    pub enabled: bool,
    pub context_window: i32,
    pub supports_vision: bool,
    pub supports_tool_choice: bool,
    pub use_parallel_tool_calls: bool,
    pub supports_temperature: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenRangeRow {
    pub id: Uuid,
    pub name: String,
    pub min_tokens: i32,
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TierRow {
    pub id: Uuid,
    pub token_range_id: Uuid,
    pub tier_order: i32,
    pub description: String,
    pub credit_multiplier: f64,
    pub is_premium: bool,
    pub is_max: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct TierEndpointRow {
    pub tier_id: Uuid,
    pub endpoint_id: Uuid,
    pub weight: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct EmbeddingsTierRow {
    pub id: Uuid,
    pub tier_order: i32,
    pub model: String,
}

// ============================================
// Plan configuration rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct DailyCreditConfigRow {
    pub plan: String,
    pub slider_min_micros: i64,
    pub slider_max_micros: i64,
    pub slider_step_micros: i64,
    pub burn_rate_threshold_micros: i64,
    pub burn_rate_window_minutes: i32,
    pub hard_limit_multiplier: f64,
    pub plan_credit_multiplier: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ToolConfigRow {
    pub plan: String,
    pub min_cron_schedule_minutes: Option<i32>,
    pub search_result_count: i32,
    pub batch_query_limit: i32,
    pub duplicate_similarity_threshold: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ToolRateLimitRow {
    pub plan: String,
    pub tool_name: String,
    pub max_calls_per_hour: i32,
}

// ============================================
// Compute / transfer rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ComputeSessionRow {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub state: String,
    pub pod_name: String,
    pub workspace_pvc: String,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ComputeSessionRow> for ComputeSession {
    fn from(row: ComputeSessionRow) -> Self {
        let state = match row.state.as_str() {
            "CREATED" => ComputeState::Created,
            "RUNNING" => ComputeState::Running,
            "IDLE_STOPPING" => ComputeState::IdleStopping,
            "ERROR" => ComputeState::Error,
            _ => ComputeState::Stopped,
        };
        ComputeSession {
            id: row.id,
            agent_id: row.agent_id,
            state,
            pod_name: row.pod_name,
            workspace_pvc: row.workspace_pvc,
            last_activity_at: row.last_activity_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TransferInviteRow {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub from_owner_type: String,
    pub from_owner_id: Uuid,
    pub to_email: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl From<TransferInviteRow> for TransferInvite {
    fn from(row: TransferInviteRow) -> Self {
        let status = match row.status.as_str() {
            "ACCEPTED" => InviteStatus::Accepted,
            "DECLINED" => InviteStatus::Declined,
            "CANCELLED" => InviteStatus::Cancelled,
            _ => InviteStatus::Pending,
        };
        TransferInvite {
            id: row.id,
            agent_id: row.agent_id,
            from_owner: owner_from_parts(&row.from_owner_type, row.from_owner_id),
            to_email: row.to_email,
            status,
            created_at: row.created_at,
            responded_at: row.responded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_round_trip() {
        let id = Uuid::now_v7();
        let user = owner_from_parts("user", id);
        assert_eq!(user, OwnerRef::User(id));
        assert_eq!(owner_type(user), "user");

        let org = owner_from_parts("organization", id);
        assert_eq!(org, OwnerRef::Organization(id));
        assert_eq!(owner_type(org), "organization");
    }

    #[test]
    fn agent_row_converts_soft_target() {
        let now = Utc::now();
        let row = AgentRow {
            id: Uuid::now_v7(),
            name: "scout".to_string(),
            owner_type: "user".to_string(),
            owner_id: Uuid::now_v7(),
            plan: "startup".to_string(),
            charter: String::new(),
            schedule: String::new(),
            schedule_snapshot: String::new(),
            life_state: "ACTIVE".to_string(),
            is_active: true,
            allowlist_policy: "DEFAULT".to_string(),
            preferred_contact_endpoint_id: None,
            daily_credit_soft_target_micros: Some(5_000_000),
            preferred_tier: "premium".to_string(),
            last_interaction_at: None,
            last_expired_at: None,
            sent_expiration_notice: false,
            proactive_opt_in: false,
            proactive_min_interval_minutes: 0,
            proactive_max_daily: 0,
            proactive_last_trigger_at: None,
            cron_backoff_exponent: 0,
            cron_runs_skipped: 0,
            shutdown_requested: false,
            created_at: now,
            updated_at: now,
        };
        let agent: Agent = row.into();
        assert_eq!(agent.daily_credit_soft_target, Some(Credits::from_whole(5)));
        assert_eq!(agent.plan, PlanKind::Startup);
        assert_eq!(agent.preferred_tier, PreferredTier::Premium);
    }
}
