// Agent shutdown lifecycle.
//
// Handlers register for a subset of shutdown reasons (or all) and fan out
// when an agent is deleted, paused, cron-disabled, or soft-expired. Callers
// invoke the registry only after the triggering database transaction has
// committed. Handlers MUST be idempotent and MUST log-and-swallow their own
// errors so one failure does not prevent siblings from running.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Why the agent is being shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownReason {
    HardDelete,
    Pause,
    CronDisabled,
    SoftExpire,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::HardDelete => "HARD_DELETE",
            ShutdownReason::Pause => "PAUSE",
            ShutdownReason::CronDisabled => "CRON_DISABLED",
            ShutdownReason::SoftExpire => "SOFT_EXPIRE",
        }
    }
}

/// Cleanup handler invoked on shutdown. Implementations are responsible for
/// their own error handling; `on_shutdown` has no error channel on purpose.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn on_shutdown(&self, agent_id: Uuid, reason: ShutdownReason, meta: &Value);
}

/// In-process registry of shutdown handlers with reason filtering
#[derive(Clone, Default)]
pub struct LifecycleRegistry {
    handlers: Vec<(Arc<dyn ShutdownHandler>, Option<HashSet<ShutdownReason>>)>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for all reasons
    pub fn register(&mut self, handler: Arc<dyn ShutdownHandler>) {
        self.push_unique(handler, None);
    }

    /// Register a handler for a subset of reasons
    pub fn register_for(&mut self, handler: Arc<dyn ShutdownHandler>, reasons: &[ShutdownReason]) {
        self.push_unique(handler, Some(reasons.iter().copied().collect()));
    }

    fn push_unique(
        &mut self,
        handler: Arc<dyn ShutdownHandler>,
        reasons: Option<HashSet<ShutdownReason>>,
    ) {
        // Avoid duplicate entries for the same handler + reason set
        let exists = self.handlers.iter().any(|(existing, existing_reasons)| {
            Arc::ptr_eq(existing, &handler) && *existing_reasons == reasons
        });
        if !exists {
            self.handlers.push((handler, reasons));
        }
    }

    /// Handlers matching a reason, in registration order
    pub fn handlers_for(&self, reason: ShutdownReason) -> Vec<Arc<dyn ShutdownHandler>> {
        self.handlers
            .iter()
            .filter(|(_, reasons)| reasons.as_ref().is_none_or(|set| set.contains(&reason)))
            .map(|(handler, _)| handler.clone())
            .collect()
    }

    /// Fan out to all matching handlers. Call after the triggering
    /// transaction commits.
    pub async fn shutdown(&self, agent_id: Uuid, reason: ShutdownReason, meta: &Value) {
        for handler in self.handlers_for(reason) {
            tracing::info!(
                agent_id = %agent_id,
                reason = reason.as_str(),
                handler = handler.name(),
                "running shutdown handler"
            );
            handler.on_shutdown(agent_id, reason, meta).await;
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ============================================================================
// Remote integration seam + built-in handlers
// ============================================================================

/// External integration provider holding per-agent remote state
#[async_trait]
pub trait RemoteIntegration: Send + Sync {
    /// Mark any pending connect sessions for the agent as errored.
    /// Idempotent: affects zero rows when nothing is pending.
    async fn mark_pending_sessions_errored(&self, agent_id: Uuid) -> crate::error::Result<u64>;

    /// Delete the remote external-user record for the agent.
    /// 404 on the remote side counts as success.
    async fn delete_external_user(&self, agent_id: Uuid) -> crate::error::Result<()>;
}

/// Marks pending remote-integration sessions as errored (all reasons)
pub struct ErrorPendingSessionsHandler {
    integration: Arc<dyn RemoteIntegration>,
}

impl ErrorPendingSessionsHandler {
    pub fn new(integration: Arc<dyn RemoteIntegration>) -> Self {
        Self { integration }
    }
}

#[async_trait]
impl ShutdownHandler for ErrorPendingSessionsHandler {
    fn name(&self) -> &str {
        "error_pending_sessions"
    }

    async fn on_shutdown(&self, agent_id: Uuid, reason: ShutdownReason, _meta: &Value) {
        match self.integration.mark_pending_sessions_errored(agent_id).await {
            Ok(updated) if updated > 0 => {
                tracing::info!(
                    agent_id = %agent_id,
                    reason = reason.as_str(),
                    updated,
                    "pending integration sessions marked errored"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(agent_id = %agent_id, error = %err, "session cleanup failed");
            }
        }
    }
}

/// Deletes the remote external-user record. Registered only for final
/// shutdowns (HARD_DELETE, SOFT_EXPIRE) so transient pauses never remove
/// remote accounts.
pub struct DeleteExternalUserHandler {
    integration: Arc<dyn RemoteIntegration>,
}

impl DeleteExternalUserHandler {
    pub fn new(integration: Arc<dyn RemoteIntegration>) -> Self {
        Self { integration }
    }

    pub const REASONS: [ShutdownReason; 2] =
        [ShutdownReason::HardDelete, ShutdownReason::SoftExpire];
}

#[async_trait]
impl ShutdownHandler for DeleteExternalUserHandler {
    fn name(&self) -> &str {
        "delete_external_user"
    }

    async fn on_shutdown(&self, agent_id: Uuid, reason: ShutdownReason, _meta: &Value) {
        match self.integration.delete_external_user(agent_id).await {
            Ok(()) => {
                tracing::info!(
                    agent_id = %agent_id,
                    reason = reason.as_str(),
                    "remote external user deleted"
                );
            }
            Err(err) => {
                tracing::warn!(agent_id = %agent_id, error = %err, "remote external user delete failed");
            }
        }
    }
}
