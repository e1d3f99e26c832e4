// Eval orchestration: suites of scenarios dispatched as runs of tasks.
//
// The CLI dispatches runs and polls until every task reaches a terminal
// state; workers execute the tasks through the normal event loop with an
// eval_run_id attached to the steps they produce.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalRunType {
    OneOff,
    Official,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStrategy {
    /// Fresh agent per scenario, discarded afterwards
    EphemeralPerScenario,
    /// Reuse one designated agent for every scenario
    ReuseAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvalTaskStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Error,
}

impl EvalTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvalTaskStatus::Passed | EvalTaskStatus::Failed | EvalTaskStatus::Error
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalScenario {
    pub slug: String,
    pub prompt: String,
    pub expectation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSuite {
    pub slug: String,
    pub name: String,
    pub scenarios: Vec<EvalScenario>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRun {
    pub id: Uuid,
    pub suite_slug: String,
    pub run_type: EvalRunType,
    pub strategy: AgentStrategy,
    /// Designated agent for ReuseAgent strategy
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub scenario_slug: String,
    pub status: EvalTaskStatus,
    pub detail: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait EvalStore: Send + Sync {
    async fn get_suite(&self, slug: &str) -> Result<Option<EvalSuite>>;

    async fn create_run(&self, run: EvalRun) -> Result<()>;

    async fn create_task(&self, task: EvalTask) -> Result<()>;

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<EvalTask>>;

    async fn update_task(&self, task: &EvalTask) -> Result<()>;
}

/// Aggregate outcome across the polled runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
}

impl EvalSummary {
    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}

pub struct EvalDispatcher {
    store: Arc<dyn EvalStore>,
    clock: Arc<dyn Clock>,
}

impl EvalDispatcher {
    pub fn new(store: Arc<dyn EvalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create one run per suite with one queued task per (filtered) scenario
    pub async fn dispatch(
        &self,
        suite_slugs: &[String],
        scenario_filter: Option<&str>,
        run_type: EvalRunType,
        strategy: AgentStrategy,
        agent_id: Option<Uuid>,
    ) -> Result<Vec<EvalRun>> {
        if suite_slugs.is_empty() {
            return Err(EngineError::config("at least one suite is required"));
        }
        if strategy == AgentStrategy::ReuseAgent && agent_id.is_none() {
            return Err(EngineError::config(
                "reuse_agent strategy requires an agent id",
            ));
        }

        let now = self.clock.now();
        let mut runs = Vec::new();
        for slug in suite_slugs {
            let suite = self
                .store
                .get_suite(slug)
                .await?
                .ok_or_else(|| EngineError::config(format!("unknown suite: {slug}")))?;

            let scenarios: Vec<&EvalScenario> = suite
                .scenarios
                .iter()
                .filter(|s| scenario_filter.is_none_or(|f| s.slug == f))
                .collect();
            if scenarios.is_empty() {
                return Err(EngineError::config(format!(
                    "no scenarios matched in suite {slug}"
                )));
            }

            let run = EvalRun {
                id: Uuid::now_v7(),
                suite_slug: suite.slug.clone(),
                run_type,
                strategy,
                agent_id,
                created_at: now,
            };
            self.store.create_run(run.clone()).await?;

            for scenario in scenarios {
                self.store
                    .create_task(EvalTask {
                        id: Uuid::now_v7(),
                        run_id: run.id,
                        scenario_slug: scenario.slug.clone(),
                        status: EvalTaskStatus::Queued,
                        detail: String::new(),
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;
            }
            runs.push(run);
        }
        Ok(runs)
    }

    /// Poll until every task across the runs is terminal, or the timeout
    /// elapses
    pub async fn poll_until_terminal(
        &self,
        runs: &[EvalRun],
        interval: StdDuration,
        timeout: StdDuration,
    ) -> Result<EvalSummary> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut summary = EvalSummary::default();
            let mut pending = 0u32;
            for run in runs {
                for task in self.store.list_tasks(run.id).await? {
                    summary.total += 1;
                    match task.status {
                        EvalTaskStatus::Passed => summary.passed += 1,
                        EvalTaskStatus::Failed => summary.failed += 1,
                        EvalTaskStatus::Error => summary.errored += 1,
                        EvalTaskStatus::Queued | EvalTaskStatus::Running => pending += 1,
                    }
                }
            }

            if pending == 0 {
                return Ok(summary);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "{pending} eval tasks still pending"
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryStore;

    fn suite() -> EvalSuite {
        EvalSuite {
            slug: "email-basics".to_string(),
            name: "Email basics".to_string(),
            scenarios: vec![
                EvalScenario {
                    slug: "reply".to_string(),
                    prompt: "reply to the inbound email".to_string(),
                    expectation: "one outbound email".to_string(),
                },
                EvalScenario {
                    slug: "no-dup".to_string(),
                    prompt: "do not send twice".to_string(),
                    expectation: "duplicate blocked".to_string(),
                },
            ],
        }
    }

    fn dispatcher(store: &Arc<InMemoryStore>) -> EvalDispatcher {
        EvalDispatcher::new(store.clone(), Arc::new(ManualClock::new(Utc::now())))
    }

    #[tokio::test]
    async fn dispatch_creates_one_task_per_scenario() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_suite(suite());
        let runs = dispatcher(&store)
            .dispatch(
                &["email-basics".to_string()],
                None,
                EvalRunType::OneOff,
                AgentStrategy::EphemeralPerScenario,
                None,
            )
            .await
            .unwrap();

        assert_eq!(runs.len(), 1);
        let tasks = store.list_tasks(runs[0].id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == EvalTaskStatus::Queued));
    }

    #[tokio::test]
    async fn scenario_filter_narrows_dispatch() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_suite(suite());
        let runs = dispatcher(&store)
            .dispatch(
                &["email-basics".to_string()],
                Some("reply"),
                EvalRunType::OneOff,
                AgentStrategy::EphemeralPerScenario,
                None,
            )
            .await
            .unwrap();
        let tasks = store.list_tasks(runs[0].id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].scenario_slug, "reply");
    }

    #[tokio::test]
    async fn unknown_suite_is_config_error() {
        let store = Arc::new(InMemoryStore::new());
        let err = dispatcher(&store)
            .dispatch(
                &["missing".to_string()],
                None,
                EvalRunType::OneOff,
                AgentStrategy::EphemeralPerScenario,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn reuse_agent_requires_agent_id() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_suite(suite());
        let err = dispatcher(&store)
            .dispatch(
                &["email-basics".to_string()],
                None,
                EvalRunType::Official,
                AgentStrategy::ReuseAgent,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn poll_summarizes_terminal_states() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_suite(suite());
        let dispatcher = dispatcher(&store);
        let runs = dispatcher
            .dispatch(
                &["email-basics".to_string()],
                None,
                EvalRunType::OneOff,
                AgentStrategy::EphemeralPerScenario,
                None,
            )
            .await
            .unwrap();

        let mut tasks = store.list_tasks(runs[0].id).await.unwrap();
        tasks[0].status = EvalTaskStatus::Passed;
        tasks[1].status = EvalTaskStatus::Failed;
        for task in &tasks {
            store.update_task(task).await.unwrap();
        }

        let summary = dispatcher
            .poll_until_terminal(
                &runs,
                StdDuration::from_millis(1),
                StdDuration::from_millis(50),
            )
            .await
            .unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_passed());
    }

    #[tokio::test]
    async fn poll_times_out_on_stuck_tasks() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_suite(suite());
        let dispatcher = dispatcher(&store);
        let runs = dispatcher
            .dispatch(
                &["email-basics".to_string()],
                None,
                EvalRunType::OneOff,
                AgentStrategy::EphemeralPerScenario,
                None,
            )
            .await
            .unwrap();

        let err = dispatcher
            .poll_until_terminal(
                &runs,
                StdDuration::from_millis(1),
                StdDuration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
