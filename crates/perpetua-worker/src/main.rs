// Worker entry point.

use tracing_subscriber::EnvFilter;

use perpetua_worker::{periodic, WorkerConfig, WorkerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        mode = ?config.store_mode,
        concurrency = config.concurrency,
        "starting perpetua worker"
    );

    let runtime = WorkerRuntime::build(config.clone()).await?;
    periodic::spawn_all(&config, &runtime.services, &runtime.queue, &runtime.lifecycle);

    tokio::select! {
        _ = runtime.run_pool() => {
            tracing::warn!("worker pool exited");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}
