// Periodic tasks: proactive activation, soft-expiration, sandbox idle
// sweep, and prompt-archive retention.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use perpetua_core::compute::IdleSweep;
use perpetua_core::expiration::{NoBillingHistory, SoftExpiration};
use perpetua_core::proactive::{NullContextSource, ProactiveActivation};
use perpetua_core::traits::{JobQueue, PromptArchiveStore};

use crate::config::WorkerConfig;
use crate::runtime::{InProcessQueue, Services};

/// Spawn all periodic tasks; each runs on its own interval until the
/// process exits.
pub fn spawn_all(
    config: &WorkerConfig,
    services: &Services,
    queue: &InProcessQueue,
    lifecycle: &Arc<perpetua_core::LifecycleRegistry>,
) {
    spawn_proactive(config, services, queue);
    spawn_soft_expiration(config, services, lifecycle);
    spawn_sandbox_sweep(config, services);
    spawn_archive_prune(config, services);
}

fn spawn_proactive(config: &WorkerConfig, services: &Services, queue: &InProcessQueue) {
    let activation = ProactiveActivation::new(
        services.agents.clone(),
        services.steps.clone(),
        services.messages.clone(),
        services.gate.clone(),
        Arc::new(NullContextSource),
        services.clock.clone(),
    );
    let queue = queue.clone();
    let interval = config.proactive_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match activation.trigger_agents(None).await {
                Ok(triggered) => {
                    for agent in triggered {
                        if let Err(err) = queue.enqueue_process_events(agent.id).await {
                            tracing::error!(agent_id = %agent.id, error = %err, "failed to enqueue proactive agent");
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "proactive tick failed");
                }
            }
        }
    });
}

fn spawn_soft_expiration(
    config: &WorkerConfig,
    services: &Services,
    lifecycle: &Arc<perpetua_core::LifecycleRegistry>,
) {
    let sweeper = SoftExpiration::new(
        services.agents.clone(),
        services.messages.clone(),
        services.transport.clone(),
        Arc::new(NoBillingHistory),
        lifecycle.clone(),
        services.clock.clone(),
        config.engine.clone(),
    );
    let interval = config.soft_expiration_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper.sweep().await {
                tracing::error!(error = %err, "soft-expiration sweep failed");
            }
        }
    });
}

fn spawn_sandbox_sweep(config: &WorkerConfig, services: &Services) {
    let sweep = IdleSweep::new(
        services.compute_store.clone(),
        services.compute_control.clone(),
        services.clock.clone(),
        config.engine.sandbox_idle_ttl,
    );
    let interval = config.sandbox_sweep_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match sweep.sweep().await {
                Ok(stopped) if stopped > 0 => {
                    tracing::info!(stopped, "stopped idle sandbox sessions");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "sandbox idle sweep failed");
                }
            }
        }
    });
}

fn spawn_archive_prune(config: &WorkerConfig, services: &Services) {
    let archives = services.archives.clone();
    let clock = services.clock.clone();
    let retention_days = config.engine.prompt_archive_retention_days;
    let interval = config.archive_prune_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let cutoff = clock.now() - ChronoDuration::days(retention_days);
            match archives.prune_older_than(cutoff, 500, false).await {
                Ok(outcome) if outcome.deleted > 0 => {
                    tracing::info!(deleted = outcome.deleted, "pruned prompt archives");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "prompt archive prune failed");
                }
            }
        }
    });
}
