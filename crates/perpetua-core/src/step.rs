// Step records: one immutable row per LLM turn, with tool calls and
// engine-generated system markers as children.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credit::Credits;

/// Immutable record of one LLM turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub description: String,
    pub credits_cost: Credits,
    pub eval_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a step.
///
/// The id is caller-generated (UUID v7) so tool-call children can reference
/// the step before its row is written at the end of the iteration.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub description: String,
    pub credits_cost: Credits,
    pub eval_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl NewStep {
    /// Zero-cost step shell with a fresh time-ordered id
    pub fn marker(agent_id: Uuid, description: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            agent_id,
            description: description.into(),
            credits_cost: Credits::ZERO,
            eval_run_id: None,
            created_at,
        }
    }
}

/// Tool call child of a step; ordering is the model's declared ordering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: Uuid,
    pub step_id: Uuid,
    pub agent_id: Uuid,
    pub tool_name: String,
    /// Params after variable resolution
    pub params: serde_json::Value,
    /// Raw result text (JSON-encoded when the handler returned a structure)
    pub result: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewToolCall {
    pub step_id: Uuid,
    pub agent_id: Uuid,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub result: String,
    pub created_at: DateTime<Utc>,
}

/// Engine-generated directive or marker attached to a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStepCode {
    /// Re-entry signal: events arrived while the loop was running
    ProcessEvents,
    /// Engine-initiated wake-up for a quiet agent
    ProactiveTrigger,
    /// Operator settings changed mid-flight; resume with new configuration
    SystemDirective,
    /// Daily credit budget or step budget exhausted
    CreditLimitHit,
}

impl SystemStepCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStepCode::ProcessEvents => "PROCESS_EVENTS",
            SystemStepCode::ProactiveTrigger => "PROACTIVE_TRIGGER",
            SystemStepCode::SystemDirective => "SYSTEM_DIRECTIVE",
            SystemStepCode::CreditLimitHit => "CREDIT_LIMIT_HIT",
        }
    }
}

impl From<&str> for SystemStepCode {
    fn from(s: &str) -> Self {
        match s {
            "PROACTIVE_TRIGGER" => SystemStepCode::ProactiveTrigger,
            "SYSTEM_DIRECTIVE" => SystemStepCode::SystemDirective,
            "CREDIT_LIMIT_HIT" => SystemStepCode::CreditLimitHit,
            _ => SystemStepCode::ProcessEvents,
        }
    }
}

/// Reasons recorded in CREDIT_LIMIT_HIT notes
pub mod credit_limit_reason {
    pub const MID_LOOP: &str = "daily_credit_limit_mid_loop";
    pub const EXHAUSTED: &str = "daily_credit_limit_exhausted";
    pub const STEP_BUDGET: &str = "step_budget";
    pub const TIER_EXHAUSTED: &str = "tier_exhausted";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStep {
    pub id: Uuid,
    pub step_id: Uuid,
    pub agent_id: Uuid,
    pub code: SystemStepCode,
    /// Small structured payload
    pub notes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSystemStep {
    pub step_id: Uuid,
    pub agent_id: Uuid,
    pub code: SystemStepCode,
    pub notes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_step_code_round_trip() {
        for code in [
            SystemStepCode::ProcessEvents,
            SystemStepCode::ProactiveTrigger,
            SystemStepCode::SystemDirective,
            SystemStepCode::CreditLimitHit,
        ] {
            assert_eq!(SystemStepCode::from(code.as_str()), code);
        }
    }

    #[test]
    fn system_step_code_serde_uses_screaming_snake() {
        let json = serde_json::to_string(&SystemStepCode::ProcessEvents).unwrap();
        assert_eq!(json, "\"PROCESS_EVENTS\"");
    }
}
