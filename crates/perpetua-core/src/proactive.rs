// Proactive activation: engine-initiated wake-ups for quiet agents.
//
// A periodic tick selects eligible opted-in agents (at most one per user per
// tick), records a PROACTIVE_TRIGGER system step with lightweight context
// metadata, and returns the triggered agents so their event loops can be
// enqueued. A per-user TTL gate enforces the effective interval across
// workers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::Agent;
use crate::clock::Clock;
use crate::error::Result;
use crate::step::{NewStep, NewSystemStep, SystemStepCode};
use crate::traits::{AgentStore, MessageStore, ProactiveGate, StepStore};

/// Candidates scanned per tick; heavy opt-in waits extra ticks by design
pub const SCAN_LIMIT: usize = 50;
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Global weekly floor on the per-agent trigger interval
pub const MIN_TRIGGER_INTERVAL_MINUTES: u32 = 7 * 24 * 60;
/// Gate TTL floor when the effective interval is somehow shorter
pub const USER_COOLDOWN_FALLBACK_MINUTES: u32 = 360;
/// Quiet period required after the last human interaction
const MIN_ACTIVITY_COOLDOWN_DAYS: i64 = 3;

/// Open work surfaced in trigger metadata
#[derive(Debug, Clone)]
pub struct OpenTaskSummary {
    pub id: Uuid,
    pub status: String,
    pub prompt: String,
}

/// Optional side context for trigger metadata (web tasks, credentials).
/// The default implementations surface nothing.
#[async_trait]
pub trait ProactiveContextSource: Send + Sync {
    async fn open_tasks(&self, _agent_id: Uuid) -> Result<Vec<OpenTaskSummary>> {
        Ok(Vec::new())
    }

    async fn pending_credentials(&self, _agent_id: Uuid) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Context source with nothing to report
pub struct NullContextSource;

#[async_trait]
impl ProactiveContextSource for NullContextSource {}

/// Outcome of one trigger
#[derive(Debug, Clone)]
pub struct ProactiveTrigger {
    pub agent: Agent,
    pub step_id: Uuid,
    pub metadata: Value,
}

pub struct ProactiveActivation {
    agents: Arc<dyn AgentStore>,
    steps: Arc<dyn StepStore>,
    messages: Arc<dyn MessageStore>,
    gate: Arc<dyn ProactiveGate>,
    context: Arc<dyn ProactiveContextSource>,
    clock: Arc<dyn Clock>,
}

impl ProactiveActivation {
    pub fn new(
        agents: Arc<dyn AgentStore>,
        steps: Arc<dyn StepStore>,
        messages: Arc<dyn MessageStore>,
        gate: Arc<dyn ProactiveGate>,
        context: Arc<dyn ProactiveContextSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agents,
            steps,
            messages,
            gate,
            context,
            clock,
        }
    }

    /// Select eligible agents, record proactive triggers, and return the
    /// triggered agents so their event loops can be enqueued.
    pub async fn trigger_agents(&self, batch_size: Option<usize>) -> Result<Vec<Agent>> {
        let batch = batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let now = self.clock.now();
        let candidates = self.agents.proactive_candidates(SCAN_LIMIT).await?;

        let mut triggered: Vec<Agent> = Vec::new();
        let mut seen_users: Vec<Uuid> = Vec::new();

        for agent in candidates {
            let user_id = agent.owner.id();
            if seen_users.contains(&user_id) {
                continue;
            }
            if !self.daily_cap_satisfied(&agent, now).await? {
                continue;
            }
            if !activity_cooldown_satisfied(&agent, now) {
                continue;
            }
            let effective_minutes = effective_min_interval_minutes(&agent);
            if !min_interval_satisfied(&agent, now, effective_minutes) {
                continue;
            }
            if !self.gate.is_open(user_id).await.unwrap_or(true) {
                continue;
            }

            let metadata = self.build_metadata(&agent, now).await;

            let trigger = match self.record_trigger(&agent, now, metadata).await {
                Ok(trigger) => trigger,
                Err(err) => {
                    tracing::error!(agent_id = %agent.id, error = %err, "failed to record proactive trigger");
                    continue;
                }
            };

            seen_users.push(user_id);
            let ttl_minutes = effective_minutes.max(USER_COOLDOWN_FALLBACK_MINUTES);
            if let Err(err) = self
                .gate
                .set(user_id, std::time::Duration::from_secs(ttl_minutes as u64 * 60))
                .await
            {
                tracing::error!(user_id = %user_id, error = %err, "failed setting proactive gate");
            }

            triggered.push(trigger.agent);
            if triggered.len() >= batch {
                break;
            }
        }

        Ok(triggered)
    }

    async fn daily_cap_satisfied(&self, agent: &Agent, now: DateTime<Utc>) -> Result<bool> {
        if agent.proactive_max_daily == 0 {
            return Ok(true);
        }
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let today = self
            .steps
            .system_steps_since(agent.id, SystemStepCode::ProactiveTrigger, day_start)
            .await?;
        Ok(today < agent.proactive_max_daily)
    }

    /// Collect lightweight context to guide proactive outreach
    async fn build_metadata(&self, agent: &Agent, now: DateTime<Utc>) -> Value {
        let mut hints: Vec<String> = Vec::new();

        let recent_inbound = self.messages.last_inbound(agent.id).await.unwrap_or(None);
        let recent_inbound_payload = recent_inbound.map(|message| {
            hints.push(
                "Follow up on the most recent user message if it still needs action.".to_string(),
            );
            let preview: String = message.body.chars().take(160).collect();
            json!({
                "sender": message.from_address,
                "timestamp": message.timestamp.to_rfc3339(),
                "preview": preview.replace('\n', " "),
            })
        });

        let open_tasks = self.context.open_tasks(agent.id).await.unwrap_or_default();
        let open_tasks_payload: Vec<Value> = open_tasks
            .iter()
            .take(5)
            .map(|task| {
                json!({
                    "id": task.id.to_string(),
                    "status": task.status,
                    "prompt": task.prompt.chars().take(120).collect::<String>().replace('\n', " "),
                })
            })
            .collect();
        if !open_tasks_payload.is_empty() {
            hints.push(
                "Review active web tasks and update the user on progress or next steps."
                    .to_string(),
            );
        }

        let pending_credentials: Vec<String> = self
            .context
            .pending_credentials(agent.id)
            .await
            .unwrap_or_default()
            .into_iter()
            .take(5)
            .collect();
        if !pending_credentials.is_empty() {
            hints.push(
                "Remind the user about pending credential requests if they block progress."
                    .to_string(),
            );
        }

        let mut summary_parts: Vec<&str> = Vec::new();
        if recent_inbound_payload.is_some() {
            summary_parts.push("recent inbound message awaiting response");
        }
        if !open_tasks_payload.is_empty() {
            summary_parts.push("active browser tasks in progress");
        }
        if !pending_credentials.is_empty() {
            summary_parts.push("credentials waiting on the user");
        }
        let summary = if summary_parts.is_empty() {
            "check in context and offer related help".to_string()
        } else {
            summary_parts.join(", ")
        };

        json!({
            "triggered_at": now.to_rfc3339(),
            "summary": summary,
            "hints": hints,
            "recent_inbound": recent_inbound_payload,
            "open_tasks": open_tasks_payload,
            "pending_secrets": pending_credentials,
        })
    }

    /// Persist the trigger step and advance the agent's trigger timestamp
    async fn record_trigger(
        &self,
        agent: &Agent,
        now: DateTime<Utc>,
        metadata: Value,
    ) -> Result<ProactiveTrigger> {
        let summary = metadata
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or("Proactive outreach trigger recorded.");

        let step = self
            .steps
            .create_step(NewStep::marker(
                agent.id,
                format!("Proactive trigger: {summary}"),
                now,
            ))
            .await?;
        self.steps
            .create_system_step(NewSystemStep {
                step_id: step.id,
                agent_id: agent.id,
                code: SystemStepCode::ProactiveTrigger,
                notes: metadata.clone(),
                created_at: now,
            })
            .await?;

        let mut updated = agent.clone();
        updated.proactive_last_trigger_at = Some(now);
        self.agents.update_agent(&updated).await?;

        Ok(ProactiveTrigger {
            agent: updated,
            step_id: step.id,
            metadata,
        })
    }
}

/// Apply the global weekly floor to per-agent interval settings
pub fn effective_min_interval_minutes(agent: &Agent) -> u32 {
    agent
        .proactive_min_interval_minutes
        .max(MIN_TRIGGER_INTERVAL_MINUTES)
}

fn min_interval_satisfied(agent: &Agent, now: DateTime<Utc>, required_minutes: u32) -> bool {
    if required_minutes == 0 {
        return true;
    }
    match agent.proactive_last_trigger_at {
        None => true,
        Some(last) => now - last >= Duration::minutes(required_minutes as i64),
    }
}

fn activity_cooldown_satisfied(agent: &Agent, now: DateTime<Utc>) -> bool {
    let anchor = agent.last_interaction_at.unwrap_or(agent.created_at);
    now - anchor >= Duration::days(MIN_ACTIVITY_COOLDOWN_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::OwnerRef;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryStore;
    use crate::message::{CommsChannel, NewMessage};

    fn quiet_agent(store: &InMemoryStore, now: DateTime<Utc>) -> Agent {
        let mut agent = Agent::new("scout", OwnerRef::User(Uuid::now_v7()), now - Duration::days(30));
        agent.proactive_opt_in = true;
        agent.last_interaction_at = Some(now - Duration::days(10));
        store.seed_agent(agent.clone());
        agent
    }

    fn service(store: &Arc<InMemoryStore>, clock: &ManualClock) -> ProactiveActivation {
        ProactiveActivation::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NullContextSource),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn quiet_agent_triggers_once() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let agent = quiet_agent(&store, now);

        let triggered = service(&store, &clock).trigger_agents(None).await.unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].id, agent.id);
        assert_eq!(triggered[0].proactive_last_trigger_at, Some(now));

        let count = store
            .system_steps_since(agent.id, SystemStepCode::ProactiveTrigger, now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn user_gate_prevents_immediate_retrigger() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        quiet_agent(&store, clock.now());
        let service = service(&store, &clock);

        let first = service.trigger_agents(None).await.unwrap();
        assert_eq!(first.len(), 1);

        // Gate holds within the effective interval even though the agent
        // would otherwise requalify after the clock jumps
        clock.advance(Duration::days(8));
        let second = service.trigger_agents(None).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn weekly_floor_applies_to_short_intervals() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let mut agent = quiet_agent(&store, now);
        agent.proactive_min_interval_minutes = 60;
        agent.proactive_last_trigger_at = Some(now - Duration::days(2));
        store.seed_agent(agent);

        // Two days since the last trigger is under the weekly floor
        let triggered = service(&store, &clock).trigger_agents(None).await.unwrap();
        assert!(triggered.is_empty());
    }

    #[tokio::test]
    async fn recent_interaction_blocks_trigger() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let mut agent = quiet_agent(&store, now);
        agent.last_interaction_at = Some(now - Duration::days(1));
        store.seed_agent(agent);

        let triggered = service(&store, &clock).trigger_agents(None).await.unwrap();
        assert!(triggered.is_empty());
    }

    #[tokio::test]
    async fn one_agent_per_user_per_tick() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let owner = OwnerRef::User(Uuid::now_v7());

        for name in ["first", "second"] {
            let mut agent = Agent::new(name, owner, now - Duration::days(30));
            agent.proactive_opt_in = true;
            agent.last_interaction_at = Some(now - Duration::days(10));
            store.seed_agent(agent);
        }

        let triggered = service(&store, &clock).trigger_agents(None).await.unwrap();
        assert_eq!(triggered.len(), 1);
    }

    #[tokio::test]
    async fn metadata_includes_recent_inbound_preview() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let agent = quiet_agent(&store, now);
        store
            .create_message(NewMessage::inbound(
                agent.id,
                CommsChannel::Email,
                "user@example.com",
                "agent@example.com",
                "please check the\nwidget order",
                now - Duration::days(9),
            ))
            .await
            .unwrap();

        service(&store, &clock).trigger_agents(None).await.unwrap();

        let notes = store.last_system_step_notes(agent.id).unwrap();
        assert_eq!(
            notes["summary"],
            "recent inbound message awaiting response"
        );
        let preview = notes["recent_inbound"]["preview"].as_str().unwrap();
        assert!(preview.contains("please check the widget order"));
    }
}
