// Communication entities: channels, endpoints, conversations, and messages.
//
// Messages carry a per-conversation monotone `seq`; the prompt assembler
// orders by (timestamp, seq).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Communication channel for a message or endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommsChannel {
    Email,
    Sms,
    Slack,
    Discord,
    Web,
    Other,
}

impl CommsChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommsChannel::Email => "email",
            CommsChannel::Sms => "sms",
            CommsChannel::Slack => "slack",
            CommsChannel::Discord => "discord",
            CommsChannel::Web => "web",
            CommsChannel::Other => "other",
        }
    }
}

impl From<&str> for CommsChannel {
    fn from(s: &str) -> Self {
        match s {
            "email" => CommsChannel::Email,
            "sms" => CommsChannel::Sms,
            "slack" => CommsChannel::Slack,
            "discord" => CommsChannel::Discord,
            "web" => CommsChannel::Web,
            _ => CommsChannel::Other,
        }
    }
}

/// A (channel, address) pair. Unique case-insensitively on the pair;
/// agent-owned endpoints are the "from" side for outbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommsEndpoint {
    pub id: Uuid,
    pub channel: CommsChannel,
    pub address: String,
    /// Set when the endpoint belongs to an agent
    pub owner_agent_id: Option<Uuid>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

impl CommsEndpoint {
    /// Normalized key for case-insensitive uniqueness
    pub fn unique_key(channel: CommsChannel, address: &str) -> String {
        format!("{}:{}", channel.as_str(), address.to_lowercase())
    }
}

/// Role of a conversation participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Agent,
    External,
}

/// A conversation groups messages by (agent, channel, address)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub channel: CommsChannel,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub endpoint_id: Uuid,
    pub role: ParticipantRole,
}

/// Inbound or outbound communication tied to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub channel: CommsChannel,
    pub from_address: String,
    pub to_address: String,
    pub is_outbound: bool,
    /// Plain-text body
    pub body: String,
    /// Optional subject (email)
    pub subject: Option<String>,
    /// Filesystem node references
    pub attachment_ids: Vec<Uuid>,
    /// Per-conversation monotone sequence
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    /// Last transport delivery error, recorded by the transport layer
    pub delivery_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub agent_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub channel: CommsChannel,
    pub from_address: String,
    pub to_address: String,
    pub is_outbound: bool,
    pub body: String,
    pub subject: Option<String>,
    pub attachment_ids: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl NewMessage {
    /// Inbound message helper used by ingestion paths and tests
    pub fn inbound(
        agent_id: Uuid,
        channel: CommsChannel,
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            conversation_id: None,
            channel,
            from_address: from_address.into(),
            to_address: to_address.into(),
            is_outbound: false,
            body: body.into(),
            subject: None,
            attachment_ids: Vec::new(),
            timestamp,
        }
    }

    /// Outbound message helper used by send tools
    pub fn outbound(
        agent_id: Uuid,
        channel: CommsChannel,
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            conversation_id: None,
            channel,
            from_address: from_address.into(),
            to_address: to_address.into(),
            is_outbound: true,
            body: body.into(),
            subject: None,
            attachment_ids: Vec::new(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_key_is_case_insensitive() {
        let a = CommsEndpoint::unique_key(CommsChannel::Email, "User@Example.COM");
        let b = CommsEndpoint::unique_key(CommsChannel::Email, "user@example.com");
        assert_eq!(a, b);
    }

    #[test]
    fn endpoint_key_distinguishes_channels() {
        let a = CommsEndpoint::unique_key(CommsChannel::Email, "+15550100");
        let b = CommsEndpoint::unique_key(CommsChannel::Sms, "+15550100");
        assert_ne!(a, b);
    }

    #[test]
    fn channel_round_trip() {
        for ch in [
            CommsChannel::Email,
            CommsChannel::Sms,
            CommsChannel::Slack,
            CommsChannel::Discord,
            CommsChannel::Web,
            CommsChannel::Other,
        ] {
            assert_eq!(CommsChannel::from(ch.as_str()), ch);
        }
    }
}
