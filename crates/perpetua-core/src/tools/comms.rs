// Communication tools: outbound email/SMS plus the explicit sleep marker.
//
// Send tools run the duplicate guard before persisting anything. The core
// persists the Message row first and then hands it to the transport;
// transport failures are recorded on the message and retried by the
// transport layer, never by the loop.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::message::{CommsChannel, NewMessage};
use crate::tools::{Tool, ToolContext, ToolExecutionResult};
use crate::traits::{MessageStore, OutboundTransport};

/// Calling this tool asserts the agent is done until the next trigger
pub const SLEEP_TOOL_NAME: &str = "sleep_until_next_trigger";

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

async fn send_on_channel(
    ctx: &ToolContext<'_>,
    channel: CommsChannel,
    params: &Value,
) -> ToolExecutionResult {
    let Some(to_address) = str_param(params, "to") else {
        return ToolExecutionResult::Error("missing required parameter: to".to_string());
    };
    let Some(body) = str_param(params, "body") else {
        return ToolExecutionResult::Error("missing required parameter: body".to_string());
    };

    let threshold = ctx.settings.normalized_similarity_threshold();
    let detection = match ctx
        .deps
        .dup_guard
        .check(ctx.agent.id, channel, body, Some(to_address), None, threshold)
        .await
    {
        Ok(detection) => detection,
        Err(err) => {
            tracing::warn!(error = %err, "duplicate guard failed open");
            None
        }
    };
    if let Some(detection) = detection {
        return ToolExecutionResult::Success(detection.to_error_response());
    }

    let from_address = match ctx.deps.messages.agent_endpoint(ctx.agent.id, channel).await {
        Ok(Some(endpoint)) => endpoint.address,
        Ok(None) => {
            return ToolExecutionResult::Error(format!(
                "agent has no {} endpoint to send from",
                channel.as_str()
            ));
        }
        Err(err) => return ToolExecutionResult::Error(err.to_string()),
    };

    let mut message = NewMessage::outbound(
        ctx.agent.id,
        channel,
        from_address,
        to_address,
        body,
        ctx.now,
    );
    if channel == CommsChannel::Email {
        message.subject = str_param(params, "subject").map(|s| s.to_string());
    }

    let persisted = match ctx.deps.messages.create_message(message).await {
        Ok(persisted) => persisted,
        Err(err) => return ToolExecutionResult::Error(err.to_string()),
    };

    let delivery = match channel {
        CommsChannel::Email => ctx.deps.transport.deliver_email(&persisted).await,
        CommsChannel::Sms => ctx.deps.transport.deliver_sms(&persisted).await,
        other => {
            return ToolExecutionResult::Error(format!(
                "no outbound transport for channel {}",
                other.as_str()
            ));
        }
    };
    if let Err(err) = delivery {
        tracing::warn!(message_id = %persisted.id, error = %err, "transport delivery failed");
        if let Err(record_err) = ctx
            .deps
            .messages
            .record_delivery_error(persisted.id, &err.to_string())
            .await
        {
            tracing::error!(message_id = %persisted.id, error = %record_err, "failed to record delivery error");
        }
    }

    ToolExecutionResult::Success(json!({
        "status": "ok",
        "message_id": persisted.id,
        "to": persisted.to_address,
    }))
}

/// Send an email from the agent's email endpoint
pub struct SendEmailTool;

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Send an email to a contact. Requires to and body; subject is optional."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": {"type": "string", "description": "Recipient email address"},
                "subject": {"type": "string"},
                "body": {"type": "string", "description": "Plain-text body"}
            },
            "required": ["to", "body"]
        })
    }

    async fn execute(&self, ctx: &ToolContext<'_>, params: Value) -> ToolExecutionResult {
        send_on_channel(ctx, CommsChannel::Email, &params).await
    }
}

/// Send an SMS from the agent's SMS endpoint
pub struct SendSmsTool;

#[async_trait]
impl Tool for SendSmsTool {
    fn name(&self) -> &str {
        "send_sms"
    }

    fn description(&self) -> &str {
        "Send a text message to a contact. Requires to and body."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": {"type": "string", "description": "Recipient phone number"},
                "body": {"type": "string"}
            },
            "required": ["to", "body"]
        })
    }

    async fn execute(&self, ctx: &ToolContext<'_>, params: Value) -> ToolExecutionResult {
        send_on_channel(ctx, CommsChannel::Sms, &params).await
    }
}

/// Explicit stop marker: nothing further to do until the next trigger
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        SLEEP_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Go to sleep until the next inbound event or scheduled trigger. \
         Call this when there is nothing further to do."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _ctx: &ToolContext<'_>, _params: Value) -> ToolExecutionResult {
        ToolExecutionResult::Success(json!({"status": "ok", "sleeping": true}))
    }
}
