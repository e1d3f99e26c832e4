// Agent transfer invites.
//
// An owner can offer an agent to another user by email. One pending invite
// exists per agent at a time; accepting re-homes the agent and resolves the
// invite, declining or cancelling just closes it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::OwnerRef;
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::traits::AgentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
}

impl InviteStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, InviteStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInvite {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub from_owner: OwnerRef,
    pub to_email: String,
    pub status: InviteStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn create_invite(&self, invite: TransferInvite) -> Result<()>;

    async fn get_invite(&self, invite_id: Uuid) -> Result<Option<TransferInvite>>;

    async fn update_invite(&self, invite: &TransferInvite) -> Result<()>;

    async fn pending_for_agent(&self, agent_id: Uuid) -> Result<Vec<TransferInvite>>;
}

pub struct TransferService {
    store: Arc<dyn TransferStore>,
    agents: Arc<dyn AgentStore>,
    clock: Arc<dyn Clock>,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn TransferStore>,
        agents: Arc<dyn AgentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            agents,
            clock,
        }
    }

    /// Create a pending invite, cancelling any prior pending invite for the
    /// same agent
    pub async fn create_invite(
        &self,
        agent_id: Uuid,
        to_email: &str,
    ) -> Result<TransferInvite> {
        let agent = self
            .agents
            .get_agent(agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(agent_id))?;
        let now = self.clock.now();

        for mut prior in self.store.pending_for_agent(agent_id).await? {
            prior.status = InviteStatus::Cancelled;
            prior.responded_at = Some(now);
            self.store.update_invite(&prior).await?;
        }

        let invite = TransferInvite {
            id: Uuid::now_v7(),
            agent_id,
            from_owner: agent.owner,
            to_email: to_email.trim().to_lowercase(),
            status: InviteStatus::Pending,
            created_at: now,
            responded_at: None,
        };
        self.store.create_invite(invite.clone()).await?;
        Ok(invite)
    }

    /// Accept an invite: re-home the agent to the new owner and close the
    /// invite
    pub async fn accept(&self, invite_id: Uuid, new_owner: OwnerRef) -> Result<TransferInvite> {
        let mut invite = self.open_invite(invite_id).await?;
        let mut agent = self
            .agents
            .get_agent(invite.agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(invite.agent_id))?;

        let now = self.clock.now();
        agent.owner = new_owner;
        agent.updated_at = now;
        self.agents.update_agent(&agent).await?;

        invite.status = InviteStatus::Accepted;
        invite.responded_at = Some(now);
        self.store.update_invite(&invite).await?;
        Ok(invite)
    }

    pub async fn decline(&self, invite_id: Uuid) -> Result<TransferInvite> {
        self.close(invite_id, InviteStatus::Declined).await
    }

    pub async fn cancel(&self, invite_id: Uuid) -> Result<TransferInvite> {
        self.close(invite_id, InviteStatus::Cancelled).await
    }

    async fn close(&self, invite_id: Uuid, status: InviteStatus) -> Result<TransferInvite> {
        let mut invite = self.open_invite(invite_id).await?;
        invite.status = status;
        invite.responded_at = Some(self.clock.now());
        self.store.update_invite(&invite).await?;
        Ok(invite)
    }

    async fn open_invite(&self, invite_id: Uuid) -> Result<TransferInvite> {
        let invite = self
            .store
            .get_invite(invite_id)
            .await?
            .ok_or_else(|| EngineError::store(format!("invite {invite_id} not found")))?;
        if !invite.status.is_open() {
            return Err(EngineError::store(format!(
                "invite {invite_id} is not pending"
            )));
        }
        Ok(invite)
    }
}
