// Postgres-backed implementations of the core store traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perpetua_core::agent::{Agent, OwnerRef, PlanKind};
use perpetua_core::burn_rate::{BurnRateSnapshot, BurnRateStore, BurnScope};
use perpetua_core::compute::{ComputeSession, ComputeSessionStore};
use perpetua_core::config::ToolPlanSettings;
use perpetua_core::credit::{Credits, DailyCreditSettings};
use perpetua_core::error::{EngineError, Result};
use perpetua_core::message::{CommsChannel, CommsEndpoint, Message, NewMessage};
use perpetua_core::prompt::{NewPromptArchive, PromptArchive};
use perpetua_core::routing::{
    EmbeddingsTier, ModelEndpoint, Provider, ProviderBackend, RoutingProfile, Tier, TierEndpoint,
    TokenRange,
};
use perpetua_core::step::{
    NewStep, NewSystemStep, NewToolCall, Step, SystemStep, SystemStepCode, ToolCallRecord,
};
use perpetua_core::traits::{
    AgentLock, AgentStore, LockTicket, MessageStore, PlanSettingsStore, PromptArchiveStore,
    PruneOutcome, RoutingStore, StepStore, VariableStore,
};
use perpetua_core::variable::{NewVariable, Variable, MAX_VARIABLES_PER_AGENT};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::encryption::SecretCipher;
use crate::repositories::Database;

fn store_err(err: anyhow::Error) -> EngineError {
    EngineError::store(err.to_string())
}

/// One handle implementing every Postgres-backed store trait
#[derive(Clone)]
pub struct PgStores {
    db: Database,
    cipher: Option<SecretCipher>,
    profile_cache: Arc<RwLock<Option<Arc<RoutingProfile>>>>,
}

impl PgStores {
    pub fn new(db: Database, cipher: Option<SecretCipher>) -> Self {
        Self {
            db,
            cipher,
            profile_cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn build_profile(&self) -> Result<RoutingProfile> {
        let provider_rows = self.db.load_providers().await.map_err(store_err)?;
        let endpoint_rows = self.db.load_llm_endpoints().await.map_err(store_err)?;
        let range_rows = self.db.load_token_ranges().await.map_err(store_err)?;
        let tier_rows = self.db.load_tiers().await.map_err(store_err)?;
        let tier_endpoint_rows = self.db.load_tier_endpoints().await.map_err(store_err)?;
        let embeddings_rows = self.db.load_embeddings_tiers().await.map_err(store_err)?;
        let embeddings_endpoint_rows = self
            .db
            .load_embeddings_tier_endpoints()
            .await
            .map_err(store_err)?;

        let mut profile = RoutingProfile::default();

        let mut provider_keys_by_id = std::collections::HashMap::new();
        for row in provider_rows {
            let api_key = match (&row.api_key_encrypted, &self.cipher) {
                (Some(encrypted), Some(cipher)) => match cipher.decrypt(encrypted) {
                    Ok(key) => Some(key),
                    Err(err) => {
                        tracing::warn!(provider = %row.key, error = %err, "failed to decrypt provider API key");
                        None
                    }
                },
                _ => None,
            };
            let backend = match row.backend.as_str() {
                "anthropic" => ProviderBackend::Anthropic,
                "openai_compat" => ProviderBackend::OpenAiCompat,
                _ => ProviderBackend::OpenAi,
            };
            provider_keys_by_id.insert(row.id, row.key.clone());
            profile.providers.insert(
                row.key.clone(),
                Provider {
                    key: row.key,
                    display_name: row.display_name,
                    enabled: row.enabled,
                    api_key,
                    env_var_name: row.env_var_name,
                    backend,
                    vertex_project: row.vertex_project,
                    vertex_location: row.vertex_location,
                },
            );
        }

        let mut endpoint_keys_by_id = std::collections::HashMap::new();
        for row in endpoint_rows {
            let Some(provider_key) = provider_keys_by_id.get(&row.provider_id) else {
                continue;
            };
            endpoint_keys_by_id.insert(row.id, row.key.clone());
            profile.endpoints.insert(
                row.key.clone(),
                ModelEndpoint {
                    key: row.key,
                    provider_key: provider_key.clone(),
                    model: row.model,
                    base_url: row.base_url,
                    enabled: row.enabled,
                    context_window: row.context_window.max(0) as u32,
                    supports_vision: row.supports_vision,
                    supports_tool_choice: row.supports_tool_choice,
                    use_parallel_tool_calls: row.use_parallel_tool_calls,
                    supports_temperature: row.supports_temperature,
                },
            );
        }

        let tier_endpoints_for = |tier_id: Uuid| -> Vec<TierEndpoint> {
            tier_endpoint_rows
                .iter()
                .filter(|te| te.tier_id == tier_id)
                .filter_map(|te| {
                    endpoint_keys_by_id.get(&te.endpoint_id).map(|key| TierEndpoint {
                        endpoint_key: key.clone(),
                        weight: te.weight,
                    })
                })
                .collect()
        };

        for range_row in range_rows {
            let tiers: Vec<Tier> = tier_rows
                .iter()
                .filter(|t| t.token_range_id == range_row.id)
                .map(|t| Tier {
                    order: t.tier_order.max(0) as u32,
                    description: t.description.clone(),
                    credit_multiplier: t.credit_multiplier,
                    is_premium: t.is_premium,
                    is_max: t.is_max,
                    endpoints: tier_endpoints_for(t.id),
                })
                .collect();
            profile.token_ranges.push(TokenRange {
                name: range_row.name,
                min_tokens: range_row.min_tokens.max(0) as u32,
                max_tokens: range_row.max_tokens.map(|m| m.max(0) as u32),
                tiers,
            });
        }

        for row in embeddings_rows {
            let endpoints = embeddings_endpoint_rows
                .iter()
                .filter(|te| te.tier_id == row.id)
                .filter_map(|te| {
                    endpoint_keys_by_id.get(&te.endpoint_id).map(|key| TierEndpoint {
                        endpoint_key: key.clone(),
                        weight: te.weight,
                    })
                })
                .collect();
            profile.embeddings_tiers.push(EmbeddingsTier {
                order: row.tier_order.max(0) as u32,
                model: row.model,
                endpoints,
            });
        }

        Ok(profile)
    }
}

// ============================================================================
// AgentStore
// ============================================================================

#[async_trait]
impl AgentStore for PgStores {
    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        let row = self.db.get_agent(agent_id).await.map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        self.db.update_agent(agent).await.map_err(store_err)
    }

    async fn proactive_candidates(&self, limit: usize) -> Result<Vec<Agent>> {
        let rows = self
            .db
            .proactive_candidates(limit as i64)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn expiration_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<Agent>> {
        let rows = self.db.expiration_candidates(cutoff).await.map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// StepStore
// ============================================================================

#[async_trait]
impl StepStore for PgStores {
    async fn create_step(&self, step: NewStep) -> Result<Step> {
        let row = self.db.insert_step(&step).await.map_err(store_err)?;
        Ok(row.into())
    }

    async fn create_tool_call(&self, call: NewToolCall) -> Result<ToolCallRecord> {
        let row = self.db.insert_tool_call(&call).await.map_err(store_err)?;
        Ok(row.into())
    }

    async fn create_system_step(&self, step: NewSystemStep) -> Result<SystemStep> {
        let row = self.db.insert_system_step(&step).await.map_err(store_err)?;
        Ok(row.into())
    }

    async fn recent_steps(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Step>> {
        let rows = self
            .db
            .recent_steps(agent_id, limit as i64)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn recent_tool_calls(&self, agent_id: Uuid, limit: usize) -> Result<Vec<ToolCallRecord>> {
        let rows = self
            .db
            .recent_tool_calls(agent_id, limit as i64)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn daily_credit_usage(&self, agent_id: Uuid, day_start: DateTime<Utc>) -> Result<Credits> {
        let micros = self
            .db
            .sum_step_credits(agent_id, day_start)
            .await
            .map_err(store_err)?;
        Ok(Credits::from_micros(micros))
    }

    async fn credits_used_between(
        &self,
        owner: OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Credits> {
        let micros = self
            .db
            .sum_owner_credits(owner, from, to)
            .await
            .map_err(store_err)?;
        Ok(Credits::from_micros(micros))
    }

    async fn system_steps_since(
        &self,
        agent_id: Uuid,
        code: SystemStepCode,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let count = self
            .db
            .count_system_steps_since(agent_id, code.as_str(), since)
            .await
            .map_err(store_err)?;
        Ok(count.max(0) as u32)
    }

    async fn tool_calls_for_owner_since(
        &self,
        owner: OwnerRef,
        tool_name: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let count = self
            .db
            .count_owner_tool_calls_since(owner, tool_name, since)
            .await
            .map_err(store_err)?;
        Ok(count.max(0) as u32)
    }
}

// ============================================================================
// MessageStore
// ============================================================================

#[async_trait]
impl MessageStore for PgStores {
    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        let row = self.db.insert_message(&message).await.map_err(store_err)?;
        Ok(row.into())
    }

    async fn recent_messages(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let rows = self
            .db
            .recent_messages(agent_id, limit as i64)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn last_inbound(&self, agent_id: Uuid) -> Result<Option<Message>> {
        let row = self.db.last_inbound(agent_id).await.map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn last_outbound(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
        to_address: Option<&str>,
        conversation_id: Option<Uuid>,
    ) -> Result<Option<Message>> {
        let row = self
            .db
            .last_outbound(agent_id, channel, to_address, conversation_id)
            .await
            .map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn record_delivery_error(&self, message_id: Uuid, error: &str) -> Result<()> {
        self.db
            .record_delivery_error(message_id, error)
            .await
            .map_err(store_err)
    }

    async fn allowlist_snapshot(&self, agent_id: Uuid) -> Result<Vec<String>> {
        self.db.allowlist_snapshot(agent_id).await.map_err(store_err)
    }

    async fn agent_endpoint(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
    ) -> Result<Option<CommsEndpoint>> {
        let row = self
            .db
            .agent_endpoint(agent_id, channel)
            .await
            .map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn endpoint(&self, endpoint_id: Uuid) -> Result<Option<CommsEndpoint>> {
        let row = self.db.endpoint(endpoint_id).await.map_err(store_err)?;
        Ok(row.map(Into::into))
    }
}

// ============================================================================
// VariableStore
// ============================================================================

#[async_trait]
impl VariableStore for PgStores {
    async fn get_or_create(
        &self,
        agent_id: Uuid,
        variable: NewVariable,
        created_at: DateTime<Utc>,
    ) -> Result<(Variable, bool)> {
        let (row, created) = self
            .db
            .get_or_create_variable(agent_id, &variable, created_at, MAX_VARIABLES_PER_AGENT as i64)
            .await
            .map_err(store_err)?;
        Ok((row.into(), created))
    }

    async fn get(&self, agent_id: Uuid, name: &str) -> Result<Option<Variable>> {
        let row = self.db.get_variable(agent_id, name).await.map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn list(&self, agent_id: Uuid) -> Result<Vec<Variable>> {
        let rows = self.db.list_variables(agent_id).await.map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// PromptArchiveStore
// ============================================================================

#[async_trait]
impl PromptArchiveStore for PgStores {
    async fn record(&self, archive: NewPromptArchive) -> Result<PromptArchive> {
        let row = self
            .db
            .insert_prompt_archive(&archive)
            .await
            .map_err(store_err)?;
        Ok(row.into())
    }

    async fn prune_older_than(
        &self,
        cutoff: DateTime<Utc>,
        chunk_size: usize,
        dry_run: bool,
    ) -> Result<PruneOutcome> {
        let (found, deleted) = self
            .db
            .prune_prompt_archives(cutoff, chunk_size as i64, dry_run)
            .await
            .map_err(store_err)?;
        Ok(PruneOutcome { found, deleted })
    }
}

// ============================================================================
// RoutingStore (cached)
// ============================================================================

#[async_trait]
impl RoutingStore for PgStores {
    async fn active_profile(&self) -> Result<Arc<RoutingProfile>> {
        {
            let cached = self.profile_cache.read().await;
            if let Some(profile) = cached.as_ref() {
                return Ok(profile.clone());
            }
        }
        let profile = Arc::new(self.build_profile().await?);
        *self.profile_cache.write().await = Some(profile.clone());
        Ok(profile)
    }

    async fn invalidate(&self) {
        *self.profile_cache.write().await = None;
    }
}

// ============================================================================
// PlanSettingsStore
// ============================================================================

#[async_trait]
impl PlanSettingsStore for PgStores {
    async fn daily_credit_settings(&self, plan: PlanKind) -> Result<DailyCreditSettings> {
        let row = self
            .db
            .daily_credit_config(plan.as_str())
            .await
            .map_err(store_err)?;
        Ok(match row {
            Some(row) => DailyCreditSettings {
                slider_min: Credits::from_micros(row.slider_min_micros),
                slider_max: Credits::from_micros(row.slider_max_micros),
                slider_step: Credits::from_micros(row.slider_step_micros),
                burn_rate_threshold_per_hour: Credits::from_micros(row.burn_rate_threshold_micros),
                burn_rate_window_minutes: row.burn_rate_window_minutes.max(0) as u32,
                hard_limit_multiplier: row.hard_limit_multiplier,
                plan_credit_multiplier: row.plan_credit_multiplier,
            },
            None => DailyCreditSettings::default(),
        })
    }

    async fn tool_settings(&self, plan: PlanKind) -> Result<ToolPlanSettings> {
        let Some(row) = self.db.tool_config(plan.as_str()).await.map_err(store_err)? else {
            return Ok(ToolPlanSettings::default());
        };
        let limits = self
            .db
            .tool_rate_limits(plan.as_str())
            .await
            .map_err(store_err)?;
        let mut settings = ToolPlanSettings {
            min_cron_schedule_minutes: row
                .min_cron_schedule_minutes
                .and_then(|m| if m > 0 { Some(m as u32) } else { None }),
            search_result_count: row.search_result_count.max(1) as u32,
            batch_query_limit: row.batch_query_limit.max(0) as u32,
            duplicate_similarity_threshold: row.duplicate_similarity_threshold,
            ..Default::default()
        };
        for limit in limits {
            if limit.max_calls_per_hour > 0 {
                settings.rate_limits.insert(
                    limit.tool_name.to_lowercase(),
                    limit.max_calls_per_hour as u32,
                );
            }
        }
        Ok(settings)
    }

    async fn invalidate(&self) {}
}

// ============================================================================
// AgentLock (lease table)
// ============================================================================

#[async_trait]
impl AgentLock for PgStores {
    async fn try_acquire(&self, agent_id: Uuid, ttl: Duration) -> Result<Option<LockTicket>> {
        let ticket = Uuid::now_v7();
        let acquired = self
            .db
            .try_acquire_lock(agent_id, ticket, ttl.as_secs_f64())
            .await
            .map_err(store_err)?;
        Ok(acquired.then_some(LockTicket(ticket)))
    }

    async fn release(&self, agent_id: Uuid, ticket: LockTicket) -> Result<()> {
        self.db.release_lock(agent_id, ticket.0).await.map_err(store_err)
    }
}

// ============================================================================
// BurnRateStore
// ============================================================================

#[async_trait]
impl BurnRateStore for PgStores {
    async fn upsert_snapshot(&self, snapshot: BurnRateSnapshot) -> Result<()> {
        self.db
            .upsert_burn_rate_snapshot(
                snapshot.scope.scope_type(),
                snapshot.scope.scope_id(),
                snapshot.window_minutes as i32,
                snapshot.window_credits.micros(),
                snapshot.projected_per_hour.micros(),
                snapshot.projected_per_day.micros(),
                snapshot.computed_at,
            )
            .await
            .map_err(store_err)
    }

    async fn get_snapshot(
        &self,
        _scope: BurnScope,
        _window_minutes: u32,
    ) -> Result<Option<BurnRateSnapshot>> {
        // Snapshots are written by the refresher and read by the admin
        // surface, which is out of scope here.
        Ok(None)
    }
}

// ============================================================================
// TransferStore / EvalStore
// ============================================================================

#[async_trait]
impl perpetua_core::transfer::TransferStore for PgStores {
    async fn create_invite(&self, invite: perpetua_core::transfer::TransferInvite) -> Result<()> {
        self.db.insert_invite(&invite).await.map_err(store_err)
    }

    async fn get_invite(
        &self,
        invite_id: Uuid,
    ) -> Result<Option<perpetua_core::transfer::TransferInvite>> {
        let row = self.db.get_invite(invite_id).await.map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn update_invite(&self, invite: &perpetua_core::transfer::TransferInvite) -> Result<()> {
        self.db.update_invite(invite).await.map_err(store_err)
    }

    async fn pending_for_agent(
        &self,
        agent_id: Uuid,
    ) -> Result<Vec<perpetua_core::transfer::TransferInvite>> {
        let rows = self
            .db
            .pending_invites_for_agent(agent_id)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl perpetua_core::evals::EvalStore for PgStores {
    async fn get_suite(&self, slug: &str) -> Result<Option<perpetua_core::evals::EvalSuite>> {
        let Some((slug, name, scenarios)) = self.db.get_eval_suite(slug).await.map_err(store_err)?
        else {
            return Ok(None);
        };
        let scenarios: Vec<perpetua_core::evals::EvalScenario> =
            serde_json::from_value(scenarios)
                .map_err(|e| EngineError::store(format!("bad scenarios payload: {e}")))?;
        Ok(Some(perpetua_core::evals::EvalSuite {
            slug,
            name,
            scenarios,
        }))
    }

    async fn create_run(&self, run: perpetua_core::evals::EvalRun) -> Result<()> {
        self.db.insert_eval_run(&run).await.map_err(store_err)
    }

    async fn create_task(&self, task: perpetua_core::evals::EvalTask) -> Result<()> {
        self.db.insert_eval_task(&task).await.map_err(store_err)
    }

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<perpetua_core::evals::EvalTask>> {
        let rows = self.db.list_eval_tasks(run_id).await.map_err(store_err)?;
        Ok(rows
            .into_iter()
            .map(|(id, run_id, scenario_slug, status, detail, created_at, updated_at)| {
                let status = match status.as_str() {
                    "RUNNING" => perpetua_core::evals::EvalTaskStatus::Running,
                    "PASSED" => perpetua_core::evals::EvalTaskStatus::Passed,
                    "FAILED" => perpetua_core::evals::EvalTaskStatus::Failed,
                    "ERROR" => perpetua_core::evals::EvalTaskStatus::Error,
                    _ => perpetua_core::evals::EvalTaskStatus::Queued,
                };
                perpetua_core::evals::EvalTask {
                    id,
                    run_id,
                    scenario_slug,
                    status,
                    detail,
                    created_at,
                    updated_at,
                }
            })
            .collect())
    }

    async fn update_task(&self, task: &perpetua_core::evals::EvalTask) -> Result<()> {
        self.db.update_eval_task(task).await.map_err(store_err)
    }
}

// ============================================================================
// ComputeSessionStore
// ============================================================================

#[async_trait]
impl ComputeSessionStore for PgStores {
    async fn get_for_agent(&self, agent_id: Uuid) -> Result<Option<ComputeSession>> {
        let row = self
            .db
            .compute_session_for_agent(agent_id)
            .await
            .map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn save(&self, session: &ComputeSession) -> Result<()> {
        self.db.save_compute_session(session).await.map_err(store_err)
    }

    async fn list_idle_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<ComputeSession>> {
        let rows = self
            .db
            .idle_running_sessions(cutoff)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
