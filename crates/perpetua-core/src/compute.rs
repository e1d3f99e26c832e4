// Sandbox compute sessions.
//
// Each agent has at most one sandbox session moving through
// CREATED -> RUNNING -> IDLE_STOPPING -> STOPPED | ERROR. The engine only
// tracks state and drives the idle sweep; pod control is an external
// collaborator behind ComputeControl.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::lifecycle::{ShutdownHandler, ShutdownReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeState {
    Created,
    Running,
    IdleStopping,
    Stopped,
    Error,
}

impl ComputeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeState::Created => "CREATED",
            ComputeState::Running => "RUNNING",
            ComputeState::IdleStopping => "IDLE_STOPPING",
            ComputeState::Stopped => "STOPPED",
            ComputeState::Error => "ERROR",
        }
    }

    /// Legal transitions of the session state machine
    pub fn can_transition_to(&self, next: ComputeState) -> bool {
        use ComputeState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Error)
                | (Running, IdleStopping)
                | (Running, Stopped)
                | (Running, Error)
                | (IdleStopping, Stopped)
                | (IdleStopping, Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ComputeState::Stopped | ComputeState::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSession {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub state: ComputeState,
    pub pod_name: String,
    pub workspace_pvc: String,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ComputeSessionStore: Send + Sync {
    async fn get_for_agent(&self, agent_id: Uuid) -> Result<Option<ComputeSession>>;

    async fn save(&self, session: &ComputeSession) -> Result<()>;

    /// Running sessions whose last activity predates the cutoff
    async fn list_idle_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<ComputeSession>>;
}

/// Narrow interface to the sandbox backend
#[async_trait]
pub trait ComputeControl: Send + Sync {
    async fn stop_pod(&self, session: &ComputeSession) -> Result<()>;
}

/// Periodic task stopping sandbox sessions idle past the TTL
pub struct IdleSweep {
    store: Arc<dyn ComputeSessionStore>,
    control: Arc<dyn ComputeControl>,
    clock: Arc<dyn Clock>,
    idle_ttl: StdDuration,
}

impl IdleSweep {
    pub fn new(
        store: Arc<dyn ComputeSessionStore>,
        control: Arc<dyn ComputeControl>,
        clock: Arc<dyn Clock>,
        idle_ttl: StdDuration,
    ) -> Self {
        Self {
            store,
            control,
            clock,
            idle_ttl,
        }
    }

    /// Stop idle sessions; returns the number stopped
    pub async fn sweep(&self) -> Result<u32> {
        let now = self.clock.now();
        let cutoff = now - Duration::seconds(self.idle_ttl.as_secs() as i64);
        let idle = self.store.list_idle_running(cutoff).await?;

        let mut stopped = 0u32;
        for mut session in idle {
            session.state = ComputeState::IdleStopping;
            session.updated_at = now;
            self.store.save(&session).await?;

            match self.control.stop_pod(&session).await {
                Ok(()) => {
                    session.state = ComputeState::Stopped;
                    stopped += 1;
                }
                Err(err) => {
                    tracing::error!(session_id = %session.id, error = %err, "failed stopping idle sandbox");
                    session.state = ComputeState::Error;
                }
            }
            session.updated_at = now;
            self.store.save(&session).await?;
        }
        Ok(stopped)
    }
}

/// Shutdown handler terminating any live sandbox session for the agent
pub struct ComputeShutdownHandler {
    store: Arc<dyn ComputeSessionStore>,
    control: Arc<dyn ComputeControl>,
    clock: Arc<dyn Clock>,
}

impl ComputeShutdownHandler {
    pub fn new(
        store: Arc<dyn ComputeSessionStore>,
        control: Arc<dyn ComputeControl>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            control,
            clock,
        }
    }
}

#[async_trait]
impl ShutdownHandler for ComputeShutdownHandler {
    fn name(&self) -> &str {
        "terminate_compute_session"
    }

    async fn on_shutdown(&self, agent_id: Uuid, reason: ShutdownReason, _meta: &Value) {
        let session = match self.store.get_for_agent(agent_id).await {
            Ok(Some(session)) if !session.state.is_terminal() => session,
            Ok(_) => return,
            Err(err) => {
                tracing::error!(agent_id = %agent_id, error = %err, "compute session lookup failed");
                return;
            }
        };

        let mut session = session;
        let result = self.control.stop_pod(&session).await;
        session.state = match result {
            Ok(()) => ComputeState::Stopped,
            Err(ref err) => {
                tracing::error!(session_id = %session.id, error = %err, "sandbox stop failed during shutdown");
                ComputeState::Error
            }
        };
        session.updated_at = self.clock.now();
        if let Err(err) = self.store.save(&session).await {
            tracing::error!(session_id = %session.id, error = %err, "failed saving compute session state");
        } else {
            tracing::info!(
                agent_id = %agent_id,
                reason = reason.as_str(),
                state = session.state.as_str(),
                "compute session terminated"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryStore;

    fn session(agent_id: Uuid, state: ComputeState, last_activity: DateTime<Utc>) -> ComputeSession {
        ComputeSession {
            id: Uuid::now_v7(),
            agent_id,
            state,
            pod_name: "sandbox-pod-1".to_string(),
            workspace_pvc: "workspace-pvc-1".to_string(),
            last_activity_at: last_activity,
            created_at: last_activity,
            updated_at: last_activity,
        }
    }

    #[test]
    fn state_machine_transitions() {
        use ComputeState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(IdleStopping));
        assert!(IdleStopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Error));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Created.can_transition_to(Stopped));
        assert!(!Error.can_transition_to(Running));
    }

    #[tokio::test]
    async fn idle_sweep_stops_stale_sessions() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let now = clock.now();

        let stale = session(Uuid::now_v7(), ComputeState::Running, now - Duration::hours(2));
        let fresh = session(Uuid::now_v7(), ComputeState::Running, now - Duration::minutes(5));
        store.save(&stale).await.unwrap();
        store.save(&fresh).await.unwrap();

        let sweep = IdleSweep::new(
            store.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            StdDuration::from_secs(3600),
        );
        assert_eq!(sweep.sweep().await.unwrap(), 1);

        let stale_after = store.get_for_agent(stale.agent_id).await.unwrap().unwrap();
        assert_eq!(stale_after.state, ComputeState::Stopped);
        let fresh_after = store.get_for_agent(fresh.agent_id).await.unwrap().unwrap();
        assert_eq!(fresh_after.state, ComputeState::Running);
    }

    #[tokio::test]
    async fn shutdown_handler_terminates_live_session() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let agent_id = Uuid::now_v7();
        store
            .save(&session(agent_id, ComputeState::Running, clock.now()))
            .await
            .unwrap();

        let handler = ComputeShutdownHandler::new(store.clone(), store.clone(), Arc::new(clock));
        handler
            .on_shutdown(agent_id, ShutdownReason::HardDelete, &serde_json::json!({}))
            .await;

        let after = store.get_for_agent(agent_id).await.unwrap().unwrap();
        assert_eq!(after.state, ComputeState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_handler_ignores_terminal_sessions() {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let agent_id = Uuid::now_v7();
        store
            .save(&session(agent_id, ComputeState::Stopped, clock.now()))
            .await
            .unwrap();

        let handler = ComputeShutdownHandler::new(store.clone(), store.clone(), Arc::new(clock));
        handler
            .on_shutdown(agent_id, ShutdownReason::Pause, &serde_json::json!({}))
            .await;
        assert_eq!(store.stop_pod_calls(), 0);
    }
}
