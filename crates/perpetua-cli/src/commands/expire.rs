// soft-expire-agents: run the soft-expiration sweeper.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use perpetua_core::clock::SystemClock;
use perpetua_core::error::Result as CoreResult;
use perpetua_core::expiration::{NoBillingHistory, SoftExpiration};
use perpetua_core::message::Message;
use perpetua_core::traits::OutboundTransport;
use perpetua_core::{EngineConfig, LifecycleRegistry};

use crate::EXIT_OK;

#[derive(Args)]
pub struct SoftExpireArgs {
    /// Accepted for compatibility with scheduled invocations; the sweep
    /// currently always runs in-process
    #[arg(long = "async")]
    pub run_async: bool,
}

/// Sleep notifications from the CLI only log; delivery belongs to the
/// worker's transport.
struct LogTransport;

#[async_trait]
impl OutboundTransport for LogTransport {
    async fn deliver_email(&self, message: &Message) -> CoreResult<()> {
        tracing::info!(message_id = %message.id, "sleep notice queued for email delivery");
        Ok(())
    }

    async fn deliver_sms(&self, message: &Message) -> CoreResult<()> {
        tracing::info!(message_id = %message.id, "sleep notice queued for sms delivery");
        Ok(())
    }
}

pub async fn run(args: SoftExpireArgs) -> anyhow::Result<i32> {
    if args.run_async {
        tracing::info!("--async requested; running sweep inline");
    }

    let stores = match super::connect().await? {
        Ok(stores) => stores,
        Err(code) => return Ok(code),
    };
    let stores = Arc::new(stores);

    let sweeper = SoftExpiration::new(
        stores.clone(),
        stores.clone(),
        Arc::new(LogTransport),
        Arc::new(NoBillingHistory),
        Arc::new(LifecycleRegistry::new()),
        Arc::new(SystemClock),
        EngineConfig::default(),
    );

    let expired = sweeper.sweep().await?;
    println!("soft-expiration completed; expired {expired} agents");
    Ok(EXIT_OK)
}
