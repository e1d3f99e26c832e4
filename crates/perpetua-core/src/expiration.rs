// Soft-expiration and cron throttling for free-plan agents.
//
// The hourly sweep puts long-idle scheduled agents to sleep: the schedule is
// snapshotted and cleared, life-state flips ACTIVE -> EXPIRED, and a one-time
// sleep notice goes out on the preferred endpoint. Any new inbound
// interaction restores the snapshot. Scheduled runs on low-tier accounts
// back off exponentially while the operator stays quiet.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::agent::{Agent, LifeState, OwnerRef};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::lifecycle::{LifecycleRegistry, ShutdownReason};
use crate::message::{CommsChannel, NewMessage};
use crate::traits::{AgentStore, MessageStore, OutboundTransport};

/// Human interaction within this window resets the cron backoff
const RECENT_INTERACTION_DAYS: i64 = 3;
/// Cap on the backoff exponent (2^6 - 1 = 63 skipped runs max)
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Billing facts the sweeper needs about an owner
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// When the owner was last downgraded to the free plan, if ever
    async fn downgraded_at(&self, _owner: OwnerRef) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

/// Billing source with no downgrade history
pub struct NoBillingHistory;

#[async_trait]
impl BillingStore for NoBillingHistory {}

pub struct SoftExpiration {
    agents: Arc<dyn AgentStore>,
    messages: Arc<dyn MessageStore>,
    transport: Arc<dyn OutboundTransport>,
    billing: Arc<dyn BillingStore>,
    lifecycle: Arc<LifecycleRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl SoftExpiration {
    pub fn new(
        agents: Arc<dyn AgentStore>,
        messages: Arc<dyn MessageStore>,
        transport: Arc<dyn OutboundTransport>,
        billing: Arc<dyn BillingStore>,
        lifecycle: Arc<LifecycleRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            agents,
            messages,
            transport,
            billing,
            lifecycle,
            clock,
            config,
        }
    }

    /// Scan for eligible agents and soft-expire them. Returns the number
    /// expired. Per-agent failures are logged and skipped.
    pub async fn sweep(&self) -> Result<u32> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(self.config.soft_expiration_inactivity_days);
        let candidates = self.agents.expiration_candidates(cutoff).await?;

        let mut expired = 0u32;
        for candidate in candidates {
            match self.expire_one(candidate.id, now, cutoff).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(agent_id = %candidate.id, error = %err, "soft-expiration failed for agent");
                }
            }
        }

        tracing::info!(expired, "soft-expiration sweep completed");
        Ok(expired)
    }

    /// Re-load and re-check one candidate, then expire it
    async fn expire_one(&self, agent_id: Uuid, now: DateTime<Utc>, cutoff: DateTime<Utc>) -> Result<bool> {
        let Some(mut agent) = self.agents.get_agent(agent_id).await? else {
            return Ok(false);
        };

        // Re-evaluate with fresh state; the candidate list may be stale
        let last_ts = agent.last_interaction_at.unwrap_or(agent.created_at);
        if agent.life_state != LifeState::Active
            || !agent.is_active
            || agent.schedule.is_empty()
            || last_ts > cutoff
            || !agent.plan.is_free()
            || self.within_downgrade_grace(&agent, now).await
        {
            return Ok(false);
        }

        agent.schedule_snapshot = std::mem::take(&mut agent.schedule);
        agent.life_state = LifeState::Expired;
        agent.last_expired_at = Some(now);
        agent.updated_at = now;
        self.agents.update_agent(&agent).await?;

        if let Err(err) = self.send_sleep_notification(&mut agent, now).await {
            tracing::error!(agent_id = %agent.id, error = %err, "failed sending sleep notification");
        }

        self.lifecycle
            .shutdown(
                agent.id,
                ShutdownReason::SoftExpire,
                &json!({"expired_at": now.to_rfc3339()}),
            )
            .await;

        Ok(true)
    }

    async fn within_downgrade_grace(&self, agent: &Agent, now: DateTime<Utc>) -> bool {
        match self.billing.downgraded_at(agent.owner).await {
            Ok(Some(downgraded_at)) => {
                now < downgraded_at + Duration::hours(self.config.downgrade_grace_hours)
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(agent_id = %agent.id, error = %err, "billing lookup failed; no grace applies");
                false
            }
        }
    }

    /// Send the friendly sleep notice via the preferred endpoint, at most
    /// once per quiet period
    async fn send_sleep_notification(&self, agent: &mut Agent, now: DateTime<Utc>) -> Result<()> {
        if agent.sent_expiration_notice {
            return Ok(());
        }
        let Some(endpoint_id) = agent.preferred_contact_endpoint_id else {
            tracing::info!(agent_id = %agent.id, "no preferred contact endpoint; skipping sleep notification");
            return Ok(());
        };

        // The preferred endpoint determines both channel and destination
        let Some(preferred) = self.messages.endpoint(endpoint_id).await? else {
            return Ok(());
        };
        let channel = preferred.channel;
        if !matches!(channel, CommsChannel::Email | CommsChannel::Sms) {
            tracing::info!(agent_id = %agent.id, channel = channel.as_str(), "channel not supported for sleep notification");
            return Ok(());
        }
        let Some(from) = self.messages.agent_endpoint(agent.id, channel).await? else {
            tracing::info!(agent_id = %agent.id, "agent has no sending endpoint; cannot send sleep notification");
            return Ok(());
        };
        let to = preferred.address;

        let body = match channel {
            CommsChannel::Email => format!(
                "Since I haven't heard from you in a while, I'm going to take a nap to save resources.\n\
                 Need me? Just reply to this message to wake me up anytime.\n\
                 Best,\n{}",
                agent.name
            ),
            _ => format!(
                "I haven't heard from you lately, so I'm going to sleep. \
                 Text me to wake me anytime. -{}",
                agent.name
            ),
        };

        let mut message = NewMessage::outbound(agent.id, channel, from.address, to, body, now);
        if channel == CommsChannel::Email {
            message.subject = Some("I'm going to sleep for now".to_string());
        }
        let persisted = self.messages.create_message(message).await?;

        let delivery = match channel {
            CommsChannel::Email => self.transport.deliver_email(&persisted).await,
            _ => self.transport.deliver_sms(&persisted).await,
        };
        if let Err(err) = delivery {
            self.messages
                .record_delivery_error(persisted.id, &err.to_string())
                .await?;
        }

        agent.sent_expiration_notice = true;
        self.agents.update_agent(agent).await?;
        Ok(())
    }
}

// ============================================================================
// Cron throttle
// ============================================================================

/// Decision for one scheduled run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronDecision {
    Run,
    Skip,
}

fn has_recent_interaction(agent: &Agent, now: DateTime<Utc>) -> bool {
    agent
        .last_interaction_at
        .is_some_and(|last| now - last < Duration::days(RECENT_INTERACTION_DAYS))
}

/// Decide whether a scheduled run executes, updating the agent's backoff
/// state in place. Low-tier accounts without recent human interaction skip
/// `2^exponent - 1` runs between executions; interaction resets the backoff.
/// The caller persists the mutated agent.
pub fn throttle_scheduled_run(agent: &mut Agent, now: DateTime<Utc>) -> CronDecision {
    if !agent.plan.is_free() {
        return CronDecision::Run;
    }
    if has_recent_interaction(agent, now) {
        agent.cron_backoff_exponent = 0;
        agent.cron_runs_skipped = 0;
        return CronDecision::Run;
    }

    let skips_needed = 2u32.saturating_pow(agent.cron_backoff_exponent) - 1;
    if agent.cron_runs_skipped < skips_needed {
        agent.cron_runs_skipped += 1;
        return CronDecision::Skip;
    }

    agent.cron_runs_skipped = 0;
    agent.cron_backoff_exponent = (agent.cron_backoff_exponent + 1).min(MAX_BACKOFF_EXPONENT);
    CronDecision::Run
}

/// Reset the backoff when a human interacts with the agent
pub fn reset_cron_backoff(agent: &mut Agent) {
    agent.cron_backoff_exponent = 0;
    agent.cron_runs_skipped = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::PlanKind;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryStore;
    use crate::message::CommsEndpoint;

    fn sweeper(store: &Arc<InMemoryStore>, clock: &ManualClock) -> SoftExpiration {
        SoftExpiration::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NoBillingHistory),
            Arc::new(LifecycleRegistry::new()),
            Arc::new(clock.clone()),
            EngineConfig::default(),
        )
    }

    fn idle_scheduled_agent(store: &InMemoryStore, now: DateTime<Utc>) -> Agent {
        let mut agent = Agent::new(
            "scout",
            OwnerRef::User(Uuid::now_v7()),
            now - Duration::days(60),
        );
        agent.schedule = "0 9 * * *".to_string();
        agent.last_interaction_at = Some(now - Duration::days(30));
        store.seed_agent(agent.clone());
        agent
    }

    #[tokio::test]
    async fn idle_free_agent_expires_with_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let agent = idle_scheduled_agent(&store, now);

        let expired = sweeper(&store, &clock).sweep().await.unwrap();
        assert_eq!(expired, 1);

        let reloaded = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(reloaded.life_state, LifeState::Expired);
        assert_eq!(reloaded.schedule, "");
        assert_eq!(reloaded.schedule_snapshot, "0 9 * * *");
        assert_eq!(reloaded.last_expired_at, Some(now));
    }

    #[tokio::test]
    async fn expiration_happens_once_per_quiet_period() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        idle_scheduled_agent(&store, clock.now());
        let sweeper = sweeper(&store, &clock);

        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        // Second sweep finds no active scheduled agent
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recently_active_agents_are_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let mut agent = idle_scheduled_agent(&store, now);
        agent.last_interaction_at = Some(now - Duration::days(2));
        store.seed_agent(agent);

        assert_eq!(sweeper(&store, &clock).sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn paid_agents_never_soft_expire() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let mut agent = idle_scheduled_agent(&store, now);
        agent.plan = PlanKind::Startup;
        store.seed_agent(agent);

        assert_eq!(sweeper(&store, &clock).sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unscheduled_agents_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let mut agent = idle_scheduled_agent(&store, now);
        agent.schedule = String::new();
        store.seed_agent(agent);

        assert_eq!(sweeper(&store, &clock).sweep().await.unwrap(), 0);
    }

    struct GracefulBilling {
        downgraded_at: DateTime<Utc>,
    }

    #[async_trait]
    impl BillingStore for GracefulBilling {
        async fn downgraded_at(&self, _owner: OwnerRef) -> Result<Option<DateTime<Utc>>> {
            Ok(Some(self.downgraded_at))
        }
    }

    #[tokio::test]
    async fn downgrade_grace_window_suppresses_expiration() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        idle_scheduled_agent(&store, now);

        let sweeper = SoftExpiration::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(GracefulBilling {
                downgraded_at: now - Duration::hours(12),
            }),
            Arc::new(LifecycleRegistry::new()),
            Arc::new(clock.clone()),
            EngineConfig::default(),
        );
        assert_eq!(sweeper.sweep().await.unwrap(), 0);

        // Past the 48-hour window the agent expires
        clock.advance(Duration::hours(48));
        assert_eq!(sweeper.sweep().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sleep_notification_sent_once_via_preferred_endpoint() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();
        let mut agent = idle_scheduled_agent(&store, now);

        let agent_ep = store.seed_endpoint(CommsEndpoint {
            id: Uuid::now_v7(),
            channel: CommsChannel::Email,
            address: "scout@agents.example.com".to_string(),
            owner_agent_id: Some(agent.id),
            is_primary: true,
            created_at: now,
        });
        let user_ep = store.seed_endpoint(CommsEndpoint {
            id: Uuid::now_v7(),
            channel: CommsChannel::Email,
            address: "owner@example.com".to_string(),
            owner_agent_id: None,
            is_primary: false,
            created_at: now,
        });
        let _ = agent_ep;
        agent.preferred_contact_endpoint_id = Some(user_ep);
        store.seed_agent(agent.clone());

        sweeper(&store, &clock).sweep().await.unwrap();

        let outbound = store
            .last_outbound(agent.id, CommsChannel::Email, None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(outbound.body.contains("take a nap"));
        assert_eq!(outbound.to_address, "owner@example.com");
        assert_eq!(store.delivered_email_count(), 1);

        let reloaded = store.get_agent(agent.id).await.unwrap().unwrap();
        assert!(reloaded.sent_expiration_notice);
    }

    // ------------------------------------------------------------------
    // Cron throttle
    // ------------------------------------------------------------------

    fn throttled_agent(now: DateTime<Utc>) -> Agent {
        let mut agent = Agent::new("cron", OwnerRef::User(Uuid::now_v7()), now - Duration::days(60));
        agent.last_interaction_at = Some(now - Duration::days(20));
        agent
    }

    #[test]
    fn backoff_skips_grow_exponentially() {
        let now = Utc::now();
        let mut agent = throttled_agent(now);

        let mut decisions = Vec::new();
        for _ in 0..12 {
            decisions.push(throttle_scheduled_run(&mut agent, now));
        }

        // exponent 0: run; exponent 1: skip 1 then run; exponent 2: skip 3 then run...
        assert_eq!(decisions[0], CronDecision::Run);
        assert_eq!(decisions[1], CronDecision::Skip);
        assert_eq!(decisions[2], CronDecision::Run);
        assert_eq!(&decisions[3..6], &[CronDecision::Skip; 3]);
        assert_eq!(decisions[6], CronDecision::Run);
        assert_eq!(&decisions[7..12], &[CronDecision::Skip; 5]);
    }

    #[test]
    fn interaction_resets_backoff() {
        let now = Utc::now();
        let mut agent = throttled_agent(now);
        for _ in 0..6 {
            throttle_scheduled_run(&mut agent, now);
        }
        assert!(agent.cron_backoff_exponent > 1);

        agent.last_interaction_at = Some(now - Duration::hours(2));
        assert_eq!(throttle_scheduled_run(&mut agent, now), CronDecision::Run);
        assert_eq!(agent.cron_backoff_exponent, 0);
        assert_eq!(agent.cron_runs_skipped, 0);
    }

    #[test]
    fn paid_plans_never_throttle() {
        let now = Utc::now();
        let mut agent = throttled_agent(now);
        agent.plan = PlanKind::Enterprise;
        for _ in 0..10 {
            assert_eq!(throttle_scheduled_run(&mut agent, now), CronDecision::Run);
        }
    }
}
