// Worker configuration from the environment, read once at startup.

use std::time::Duration;

use perpetua_core::EngineConfig;

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// In-memory stores; state dies with the process (dev/test)
    Memory,
    /// Postgres via DATABASE_URL
    Postgres,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store_mode: StoreMode,
    pub database_url: Option<String>,
    /// Concurrent event-loop invocations across agents
    pub concurrency: usize,
    pub proactive_interval: Duration,
    pub soft_expiration_interval: Duration,
    pub sandbox_sweep_interval: Duration,
    pub archive_prune_interval: Duration,
    pub engine: EngineConfig,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").ok();
        let store_mode = match std::env::var("AGENT_STORE_MODE").as_deref() {
            Ok("memory") => StoreMode::Memory,
            Ok("postgres") => StoreMode::Postgres,
            _ if database_url.is_some() => StoreMode::Postgres,
            _ => StoreMode::Memory,
        };
        if store_mode == StoreMode::Postgres && database_url.is_none() {
            anyhow::bail!("AGENT_STORE_MODE=postgres requires DATABASE_URL");
        }

        let mut engine = EngineConfig::default();
        engine.max_steps_per_invocation =
            env_u64("MAX_STEPS_PER_INVOCATION", engine.max_steps_per_invocation as u64) as u32;
        engine.sandbox_idle_ttl =
            Duration::from_secs(env_u64("SANDBOX_IDLE_TTL_SECONDS", 3600));
        engine.prompt_archive_retention_days =
            env_u64("PROMPT_ARCHIVE_RETENTION_DAYS", 30) as i64;
        engine.soft_expiration_inactivity_days =
            env_u64("AGENT_SOFT_EXPIRATION_INACTIVITY_DAYS", 14) as i64;

        Ok(Self {
            store_mode,
            database_url,
            concurrency: env_u64("WORKER_CONCURRENCY", 4) as usize,
            proactive_interval: Duration::from_secs(env_u64("PROACTIVE_TICK_SECONDS", 900)),
            soft_expiration_interval: Duration::from_secs(env_u64(
                "SOFT_EXPIRATION_SWEEP_SECONDS",
                3600,
            )),
            sandbox_sweep_interval: Duration::from_secs(env_u64("SANDBOX_SWEEP_SECONDS", 300)),
            archive_prune_interval: Duration::from_secs(env_u64(
                "ARCHIVE_PRUNE_SECONDS",
                24 * 3600,
            )),
            engine,
        })
    }
}
