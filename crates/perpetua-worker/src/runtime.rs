// Worker runtime wiring: stores, engine, job queue, and worker pool.
//
// Parallel workers pull event-processing jobs from the in-process queue;
// single-flight per agent is enforced by the agent lock, so concurrency
// exists only between agents.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use perpetua_core::burn_rate::{BurnRateRefresher, BurnRateStore};
use perpetua_core::clock::{Clock, SystemClock};
use perpetua_core::compute::{ComputeControl, ComputeSession, ComputeSessionStore};
use perpetua_core::error::Result as CoreResult;
use perpetua_core::lifecycle::LifecycleRegistry;
use perpetua_core::message::Message;
use perpetua_core::tools::{SendEmailTool, SendSmsTool, SleepTool};
use perpetua_core::traits::{
    AgentStore, FileInfo, FilesystemCatalog, JobQueue, MessageStore, OutboundTransport,
    PlanSettingsStore, ProactiveGate, PromptArchiveStore, RoutingStore, StepStore, VariableStore,
};
use perpetua_core::{
    CompletionDriver, DriverRegistry, Engine, EngineParts, InMemoryStore, ProviderBackend,
    ToolRegistry,
};
use perpetua_storage::{Database, PgStores, SecretCipher};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{StoreMode, WorkerConfig};

// ============================================================================
// Worker-local collaborators
// ============================================================================

/// Queue feeding the worker pool within this process
#[derive(Clone)]
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<Uuid>,
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue_process_events(&self, agent_id: Uuid) -> CoreResult<()> {
        self.tx
            .send(agent_id)
            .map_err(|_| perpetua_core::EngineError::store("job queue closed"))?;
        Ok(())
    }
}

/// Transport placeholder until a real delivery backend is wired in; the
/// message row is already persisted when this runs.
struct LogTransport;

#[async_trait]
impl OutboundTransport for LogTransport {
    async fn deliver_email(&self, message: &Message) -> CoreResult<()> {
        tracing::info!(message_id = %message.id, to = %message.to_address, "email handed to transport");
        Ok(())
    }

    async fn deliver_sms(&self, message: &Message) -> CoreResult<()> {
        tracing::info!(message_id = %message.id, to = %message.to_address, "sms handed to transport");
        Ok(())
    }
}

/// Agents without a managed filesystem surface no catalog
struct EmptyCatalog;

#[async_trait]
impl FilesystemCatalog for EmptyCatalog {
    async fn recent_files(&self, _agent_id: Uuid, _limit: usize) -> CoreResult<Vec<FileInfo>> {
        Ok(Vec::new())
    }
}

/// Per-process TTL gate. Cross-host protection comes from the per-agent
/// trigger interval re-check; this gate only prevents same-tick storms.
#[derive(Default)]
pub struct LocalGate {
    entries: StdMutex<HashMap<Uuid, Instant>>,
}

#[async_trait]
impl ProactiveGate for LocalGate {
    async fn is_open(&self, user_id: Uuid) -> CoreResult<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(&user_id).is_none_or(|expiry| *expiry <= Instant::now()))
    }

    async fn set(&self, user_id: Uuid, ttl: Duration) -> CoreResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id, Instant::now() + ttl);
        Ok(())
    }

    async fn release(&self, user_id: Uuid) -> CoreResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&user_id);
        Ok(())
    }
}

/// Sandbox control placeholder; the Kubernetes backend is an external
/// collaborator deployed separately.
struct LogComputeControl;

#[async_trait]
impl ComputeControl for LogComputeControl {
    async fn stop_pod(&self, session: &ComputeSession) -> CoreResult<()> {
        tracing::info!(pod = %session.pod_name, "sandbox stop requested");
        Ok(())
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Store handles shared by the engine and the periodic tasks
#[derive(Clone)]
pub struct Services {
    pub agents: Arc<dyn AgentStore>,
    pub steps: Arc<dyn StepStore>,
    pub messages: Arc<dyn MessageStore>,
    pub variables: Arc<dyn VariableStore>,
    pub archives: Arc<dyn PromptArchiveStore>,
    pub routing: Arc<dyn RoutingStore>,
    pub plan_settings: Arc<dyn PlanSettingsStore>,
    pub lock: Arc<dyn perpetua_core::traits::AgentLock>,
    pub transport: Arc<dyn OutboundTransport>,
    pub files: Arc<dyn FilesystemCatalog>,
    pub gate: Arc<dyn ProactiveGate>,
    pub compute_store: Arc<dyn ComputeSessionStore>,
    pub compute_control: Arc<dyn ComputeControl>,
    pub burn_store: Arc<dyn BurnRateStore>,
    pub clock: Arc<dyn Clock>,
}

pub struct WorkerRuntime {
    pub engine: Arc<Engine>,
    pub services: Services,
    pub queue: InProcessQueue,
    pub lifecycle: Arc<LifecycleRegistry>,
    config: WorkerConfig,
    rx: mpsc::UnboundedReceiver<Uuid>,
}

fn build_drivers() -> DriverRegistry {
    let openai = Arc::new(perpetua_openai::OpenAiDriver::new());
    let anthropic = Arc::new(perpetua_anthropic::AnthropicDriver::new());

    let mut drivers = DriverRegistry::new();
    drivers.register_completion(ProviderBackend::OpenAi, openai.clone());
    drivers.register_completion(
        ProviderBackend::OpenAiCompat,
        openai.clone() as Arc<dyn CompletionDriver>,
    );
    drivers.register_completion(ProviderBackend::Anthropic, anthropic);
    drivers.register_embeddings(ProviderBackend::OpenAi, openai.clone());
    drivers.register_embeddings(ProviderBackend::OpenAiCompat, openai);
    drivers
}

fn build_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(SendEmailTool);
    tools.register(SendSmsTool);
    tools.register(SleepTool);
    tools
}

impl WorkerRuntime {
    pub async fn build(config: WorkerConfig) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = InProcessQueue { tx };

        let services = match config.store_mode {
            StoreMode::Memory => {
                tracing::warn!("running with in-memory stores; state dies with the process");
                let store = Arc::new(InMemoryStore::new());
                Services {
                    agents: store.clone(),
                    steps: store.clone(),
                    messages: store.clone(),
                    variables: store.clone(),
                    archives: store.clone(),
                    routing: store.clone(),
                    plan_settings: store.clone(),
                    lock: store.clone(),
                    transport: store.clone(),
                    files: store.clone(),
                    gate: store.clone(),
                    compute_store: store.clone(),
                    compute_control: store.clone(),
                    burn_store: store.clone(),
                    clock: clock.clone(),
                }
            }
            StoreMode::Postgres => {
                let Some(url) = config.database_url.as_deref() else {
                    anyhow::bail!("postgres store mode requires DATABASE_URL");
                };
                let db = Database::from_url(url).await?;
                db.run_migrations().await?;
                let cipher = match SecretCipher::from_env() {
                    Ok(cipher) => Some(cipher),
                    Err(err) => {
                        tracing::warn!(error = %err, "no secrets key configured; encrypted provider keys unavailable");
                        None
                    }
                };
                let pg = Arc::new(PgStores::new(db, cipher));
                Services {
                    agents: pg.clone(),
                    steps: pg.clone(),
                    messages: pg.clone(),
                    variables: pg.clone(),
                    archives: pg.clone(),
                    routing: pg.clone(),
                    plan_settings: pg.clone(),
                    lock: pg.clone(),
                    transport: Arc::new(LogTransport),
                    files: Arc::new(EmptyCatalog),
                    gate: Arc::new(LocalGate::default()),
                    compute_store: pg.clone(),
                    compute_control: Arc::new(LogComputeControl),
                    burn_store: pg.clone(),
                    clock: clock.clone(),
                }
            }
        };

        let mut lifecycle = LifecycleRegistry::new();
        lifecycle.register(Arc::new(perpetua_core::compute::ComputeShutdownHandler::new(
            services.compute_store.clone(),
            services.compute_control.clone(),
            services.clock.clone(),
        )));
        let lifecycle = Arc::new(lifecycle);

        let engine = Arc::new(Engine::new(EngineParts {
            agents: services.agents.clone(),
            steps: services.steps.clone(),
            messages: services.messages.clone(),
            variables: services.variables.clone(),
            archives: services.archives.clone(),
            routing: services.routing.clone(),
            plan_settings: services.plan_settings.clone(),
            lock: services.lock.clone(),
            queue: Arc::new(queue.clone()),
            files: services.files.clone(),
            transport: services.transport.clone(),
            tools: Arc::new(build_tools()),
            guards: Arc::new(perpetua_core::tools::GuardRegistry::with_builtins()),
            drivers: build_drivers(),
            clock: services.clock.clone(),
            config: config.engine.clone(),
        }));

        Ok(Self {
            engine,
            services,
            queue,
            lifecycle,
            config,
            rx,
        })
    }

    /// Run the worker pool until the queue closes. Each job holds one
    /// concurrency permit; burn-rate snapshots refresh after every job.
    pub async fn run_pool(mut self) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.concurrency));
        let refresher = Arc::new(BurnRateRefresher::new(
            self.services.steps.clone(),
            self.services.burn_store.clone(),
            self.services.clock.clone(),
        ));

        while let Some(agent_id) = self.rx.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let engine = self.engine.clone();
            let agents = self.services.agents.clone();
            let refresher = refresher.clone();

            tokio::spawn(async move {
                let _permit = permit;
                match engine.process_agent_events(agent_id).await {
                    Ok(outcome) => {
                        tracing::info!(agent_id = %agent_id, ?outcome, "event loop finished");
                    }
                    Err(err) => {
                        tracing::error!(agent_id = %agent_id, error = %err, "event loop failed");
                    }
                }

                // Keep the burn-rate projections fresh for this agent and
                // its owner
                if let Ok(Some(agent)) = agents.get_agent(agent_id).await {
                    if let Err(err) = refresher.refresh_agent(agent_id, 60).await {
                        tracing::debug!(agent_id = %agent_id, error = %err, "agent burn-rate refresh failed");
                    }
                    if let Err(err) = refresher.refresh_owner(agent.owner, 60).await {
                        tracing::debug!(agent_id = %agent_id, error = %err, "owner burn-rate refresh failed");
                    }
                }
            });
        }
    }
}
