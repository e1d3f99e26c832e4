// Burn-rate snapshots: rolling-window credit totals with per-hour and
// per-day projections, upserted per (scope, window) by a periodic refresh.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::OwnerRef;
use crate::clock::Clock;
use crate::credit::{Credits, DailyCreditSettings};
use crate::error::Result;
use crate::traits::StepStore;

/// Scope a snapshot aggregates over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope_type", content = "scope_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BurnScope {
    User(Uuid),
    Org(Uuid),
    Agent(Uuid),
}

impl BurnScope {
    pub fn scope_type(&self) -> &'static str {
        match self {
            BurnScope::User(_) => "USER",
            BurnScope::Org(_) => "ORG",
            BurnScope::Agent(_) => "AGENT",
        }
    }

    pub fn scope_id(&self) -> Uuid {
        match self {
            BurnScope::User(id) | BurnScope::Org(id) | BurnScope::Agent(id) => *id,
        }
    }
}

impl From<OwnerRef> for BurnScope {
    fn from(owner: OwnerRef) -> Self {
        match owner {
            OwnerRef::User(id) => BurnScope::User(id),
            OwnerRef::Organization(id) => BurnScope::Org(id),
        }
    }
}

/// Rolling-window totals and projections; unique per (scope, window_minutes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurnRateSnapshot {
    pub scope: BurnScope,
    pub window_minutes: u32,
    pub window_credits: Credits,
    pub projected_per_hour: Credits,
    pub projected_per_day: Credits,
    pub computed_at: DateTime<Utc>,
}

#[async_trait]
pub trait BurnRateStore: Send + Sync {
    /// Insert or replace the snapshot for (scope, window_minutes)
    async fn upsert_snapshot(&self, snapshot: BurnRateSnapshot) -> Result<()>;

    async fn get_snapshot(
        &self,
        scope: BurnScope,
        window_minutes: u32,
    ) -> Result<Option<BurnRateSnapshot>>;
}

/// Project window totals to per-hour and per-day rates
pub fn project(window_credits: Credits, window_minutes: u32) -> (Credits, Credits) {
    if window_minutes == 0 {
        return (Credits::ZERO, Credits::ZERO);
    }
    let per_minute = window_credits.as_f64() / window_minutes as f64;
    (
        Credits::from_f64(per_minute * 60.0),
        Credits::from_f64(per_minute * 60.0 * 24.0),
    )
}

/// Whether the projected hourly rate crosses the plan's alert threshold
pub fn exceeds_threshold(snapshot: &BurnRateSnapshot, settings: &DailyCreditSettings) -> bool {
    snapshot.projected_per_hour > settings.burn_rate_threshold_per_hour
}

pub struct BurnRateRefresher {
    steps: Arc<dyn StepStore>,
    store: Arc<dyn BurnRateStore>,
    clock: Arc<dyn Clock>,
}

impl BurnRateRefresher {
    pub fn new(
        steps: Arc<dyn StepStore>,
        store: Arc<dyn BurnRateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { steps, store, clock }
    }

    /// Recompute and upsert the owner-scoped snapshot for one window
    pub async fn refresh_owner(
        &self,
        owner: OwnerRef,
        window_minutes: u32,
    ) -> Result<BurnRateSnapshot> {
        let now = self.clock.now();
        let from = now - Duration::minutes(window_minutes as i64);
        let window_credits = self.steps.credits_used_between(owner, from, now).await?;
        let (per_hour, per_day) = project(window_credits, window_minutes);

        let snapshot = BurnRateSnapshot {
            scope: owner.into(),
            window_minutes,
            window_credits,
            projected_per_hour: per_hour,
            projected_per_day: per_day,
            computed_at: now,
        };
        self.store.upsert_snapshot(snapshot.clone()).await?;
        Ok(snapshot)
    }

    /// Recompute and upsert the agent-scoped snapshot for one window
    pub async fn refresh_agent(
        &self,
        agent_id: Uuid,
        window_minutes: u32,
    ) -> Result<BurnRateSnapshot> {
        let now = self.clock.now();
        let from = now - Duration::minutes(window_minutes as i64);
        let window_credits = self.steps.daily_credit_usage(agent_id, from).await?;
        let (per_hour, per_day) = project(window_credits, window_minutes);

        let snapshot = BurnRateSnapshot {
            scope: BurnScope::Agent(agent_id),
            window_minutes,
            window_credits,
            projected_per_hour: per_hour,
            projected_per_day: per_day,
            computed_at: now,
        };
        self.store.upsert_snapshot(snapshot.clone()).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_scales_linearly() {
        let (per_hour, per_day) = project(Credits::from_whole(3), 60);
        assert_eq!(per_hour, Credits::from_whole(3));
        assert_eq!(per_day, Credits::from_whole(72));

        let (per_hour, per_day) = project(Credits::from_whole(1), 30);
        assert_eq!(per_hour, Credits::from_whole(2));
        assert_eq!(per_day, Credits::from_whole(48));
    }

    #[test]
    fn zero_window_projects_zero() {
        let (per_hour, per_day) = project(Credits::from_whole(10), 0);
        assert_eq!(per_hour, Credits::ZERO);
        assert_eq!(per_day, Credits::ZERO);
    }

    #[test]
    fn threshold_comparison_uses_hourly_projection() {
        let snapshot = BurnRateSnapshot {
            scope: BurnScope::Agent(Uuid::now_v7()),
            window_minutes: 60,
            window_credits: Credits::from_whole(4),
            projected_per_hour: Credits::from_whole(4),
            projected_per_day: Credits::from_whole(96),
            computed_at: Utc::now(),
        };
        let settings = DailyCreditSettings::default();
        assert!(exceeds_threshold(&snapshot, &settings));

        let calm = BurnRateSnapshot {
            projected_per_hour: Credits::from_whole(2),
            ..snapshot
        };
        assert!(!exceeds_threshold(&calm, &settings));
    }

    #[test]
    fn scope_type_strings() {
        assert_eq!(BurnScope::User(Uuid::now_v7()).scope_type(), "USER");
        assert_eq!(BurnScope::Org(Uuid::now_v7()).scope_type(), "ORG");
        assert_eq!(BurnScope::Agent(Uuid::now_v7()).scope_type(), "AGENT");
    }
}
