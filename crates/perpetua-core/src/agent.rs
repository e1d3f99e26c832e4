// Agent domain entity.
//
// An agent is a long-lived actor owned by a user or organization. The event
// loop drives it from inbound events to a stable rest state; the fields the
// loop manages (last_interaction_at, proactive_last_trigger_at, life_state)
// are only written while holding the agent lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credit::Credits;

/// Lifecycle state of an agent
///
/// Transitions are monotonic except ACTIVE <-> EXPIRED (restore on
/// interaction) and hard delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifeState {
    Active,
    Paused,
    Expired,
    Deleted,
}

impl LifeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifeState::Active => "ACTIVE",
            LifeState::Paused => "PAUSED",
            LifeState::Expired => "EXPIRED",
            LifeState::Deleted => "DELETED",
        }
    }
}

impl From<&str> for LifeState {
    fn from(s: &str) -> Self {
        match s {
            "PAUSED" => LifeState::Paused,
            "EXPIRED" => LifeState::Expired,
            "DELETED" => LifeState::Deleted,
            _ => LifeState::Active,
        }
    }
}

/// Preferred LLM tier selected by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredTier {
    #[default]
    Standard,
    Premium,
    Max,
}

impl PreferredTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferredTier::Standard => "standard",
            PreferredTier::Premium => "premium",
            PreferredTier::Max => "max",
        }
    }
}

impl From<&str> for PreferredTier {
    fn from(s: &str) -> Self {
        match s {
            "premium" => PreferredTier::Premium,
            "max" => PreferredTier::Max,
            _ => PreferredTier::Standard,
        }
    }
}

/// Billing plan of the owning principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    #[default]
    Free,
    Startup,
    Enterprise,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Free => "free",
            PlanKind::Startup => "startup",
            PlanKind::Enterprise => "enterprise",
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, PlanKind::Free)
    }
}

impl From<&str> for PlanKind {
    fn from(s: &str) -> Self {
        match s {
            "startup" => PlanKind::Startup,
            "enterprise" => PlanKind::Enterprise,
            _ => PlanKind::Free,
        }
    }
}

/// Owning principal of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum OwnerRef {
    User(Uuid),
    Organization(Uuid),
}

impl OwnerRef {
    pub fn id(&self) -> Uuid {
        match self {
            OwnerRef::User(id) | OwnerRef::Organization(id) => *id,
        }
    }
}

/// Contact allowlist policy for inbound/outbound communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllowlistPolicy {
    /// Owner and their registered contacts only
    #[default]
    Default,
    /// Explicit allowlist entries only
    Manual,
}

/// Agent configuration and loop-managed state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub owner: OwnerRef,
    pub plan: PlanKind,
    /// Operator-authored charter text driving the system prompt
    pub charter: String,
    /// Cron-like schedule expression; empty when no schedule is configured.
    /// Must be empty whenever life_state != ACTIVE.
    pub schedule: String,
    /// Schedule saved when the agent was soft-expired, restored on wake
    pub schedule_snapshot: String,
    pub life_state: LifeState,
    /// Manual pause switch, independent of life_state
    pub is_active: bool,
    pub allowlist_policy: AllowlistPolicy,
    /// Endpoint id the agent prefers for operator-facing notifications
    pub preferred_contact_endpoint_id: Option<Uuid>,
    /// Daily credit soft target; None = unlimited
    pub daily_credit_soft_target: Option<Credits>,
    pub preferred_tier: PreferredTier,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub last_expired_at: Option<DateTime<Utc>>,
    pub sent_expiration_notice: bool,
    pub proactive_opt_in: bool,
    pub proactive_min_interval_minutes: u32,
    /// 0 disables the per-day cap
    pub proactive_max_daily: u32,
    pub proactive_last_trigger_at: Option<DateTime<Utc>>,
    /// Exponential backoff state for scheduled runs on low-tier accounts
    pub cron_backoff_exponent: u32,
    /// Scheduled runs skipped since the last executed one
    pub cron_runs_skipped: u32,
    /// Set when a shutdown has been requested; re-entries short-circuit
    pub shutdown_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Minimal active agent used as a starting point by callers and tests
    pub fn new(name: impl Into<String>, owner: OwnerRef, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            owner,
            plan: PlanKind::Free,
            charter: String::new(),
            schedule: String::new(),
            schedule_snapshot: String::new(),
            life_state: LifeState::Active,
            is_active: true,
            allowlist_policy: AllowlistPolicy::Default,
            preferred_contact_endpoint_id: None,
            daily_credit_soft_target: None,
            preferred_tier: PreferredTier::Standard,
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
        }
    }

    /// Whether the event loop should process events for this agent at all
    pub fn is_runnable(&self) -> bool {
        self.is_active && !self.shutdown_requested && self.life_state == LifeState::Active
    }

    /// Restore a soft-expired agent on new inbound interaction
    pub fn restore_from_expiration(&mut self, now: DateTime<Utc>) {
        if self.life_state != LifeState::Expired {
            return;
        }
        self.life_state = LifeState::Active;
        self.schedule = std::mem::take(&mut self.schedule_snapshot);
        self.sent_expiration_notice = false;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new("scout", OwnerRef::User(Uuid::now_v7()), Utc::now())
    }

    #[test]
    fn life_state_round_trip() {
        for state in [
            LifeState::Active,
            LifeState::Paused,
            LifeState::Expired,
            LifeState::Deleted,
        ] {
            assert_eq!(LifeState::from(state.as_str()), state);
        }
    }

    #[test]
    fn restore_from_expiration_puts_schedule_back() {
        let mut a = agent();
        a.schedule_snapshot = "0 9 * * *".to_string();
        a.life_state = LifeState::Expired;
        a.sent_expiration_notice = true;

        a.restore_from_expiration(Utc::now());

        assert_eq!(a.life_state, LifeState::Active);
        assert_eq!(a.schedule, "0 9 * * *");
        assert!(a.schedule_snapshot.is_empty());
        assert!(!a.sent_expiration_notice);
    }

    #[test]
    fn restore_is_noop_for_active_agents() {
        let mut a = agent();
        a.schedule = "*/30 * * * *".to_string();
        a.restore_from_expiration(Utc::now());
        assert_eq!(a.schedule, "*/30 * * * *");
        assert_eq!(a.life_state, LifeState::Active);
    }

    #[test]
    fn runnable_requires_active_state() {
        let mut a = agent();
        assert!(a.is_runnable());
        a.is_active = false;
        assert!(!a.is_runnable());
        a.is_active = true;
        a.shutdown_requested = true;
        assert!(!a.is_runnable());
    }
}
