// Repository layer for database operations.
//
// Thin SQL wrapper around the pool; the store layer maps rows into core
// domain types and implements the engine traits.

use anyhow::Result;
use chrono::{DateTime, Utc};
use perpetua_core::agent::OwnerRef;
use perpetua_core::message::{CommsChannel, NewMessage};
use perpetua_core::step::{NewStep, NewSystemStep, NewToolCall};
use perpetua_core::variable::NewVariable;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ============================================
    // Agents
    // ============================================

    pub async fn get_agent(&self, id: Uuid) -> Result<Option<AgentRow>> {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn update_agent(&self, agent: &perpetua_core::Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (
                id, name, owner_type, owner_id, plan, charter, schedule, schedule_snapshot,
                life_state, is_active, allowlist_policy, preferred_contact_endpoint_id,
                daily_credit_soft_target_micros, preferred_tier, last_interaction_at,
                last_expired_at, sent_expiration_notice, proactive_opt_in,
                proactive_min_interval_minutes, proactive_max_daily, proactive_last_trigger_at,
                cron_backoff_exponent, cron_runs_skipped, shutdown_requested, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                plan = EXCLUDED.plan,
                charter = EXCLUDED.charter,
                schedule = EXCLUDED.schedule,
                schedule_snapshot = EXCLUDED.schedule_snapshot,
                life_state = EXCLUDED.life_state,
                is_active = EXCLUDED.is_active,
                allowlist_policy = EXCLUDED.allowlist_policy,
                preferred_contact_endpoint_id = EXCLUDED.preferred_contact_endpoint_id,
                daily_credit_soft_target_micros = EXCLUDED.daily_credit_soft_target_micros,
                preferred_tier = EXCLUDED.preferred_tier,
                last_interaction_at = EXCLUDED.last_interaction_at,
                last_expired_at = EXCLUDED.last_expired_at,
                sent_expiration_notice = EXCLUDED.sent_expiration_notice,
                proactive_opt_in = EXCLUDED.proactive_opt_in,
                proactive_min_interval_minutes = EXCLUDED.proactive_min_interval_minutes,
                proactive_max_daily = EXCLUDED.proactive_max_daily,
                proactive_last_trigger_at = EXCLUDED.proactive_last_trigger_at,
                cron_backoff_exponent = EXCLUDED.cron_backoff_exponent,
                cron_runs_skipped = EXCLUDED.cron_runs_skipped,
                shutdown_requested = EXCLUDED.shutdown_requested,
                owner_type = EXCLUDED.owner_type,
                owner_id = EXCLUDED.owner_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(owner_type(agent.owner))
        .bind(agent.owner.id())
        .bind(agent.plan.as_str())
        .bind(&agent.charter)
        .bind(&agent.schedule)
        .bind(&agent.schedule_snapshot)
        .bind(agent.life_state.as_str())
        .bind(agent.is_active)
        .bind(match agent.allowlist_policy {
            perpetua_core::AllowlistPolicy::Manual => "MANUAL",
            perpetua_core::AllowlistPolicy::Default => "DEFAULT",
        })
        .bind(agent.preferred_contact_endpoint_id)
        .bind(agent.daily_credit_soft_target.map(|c| c.micros()))
        .bind(agent.preferred_tier.as_str())
        .bind(agent.last_interaction_at)
        .bind(agent.last_expired_at)
        .bind(agent.sent_expiration_notice)
        .bind(agent.proactive_opt_in)
        .bind(agent.proactive_min_interval_minutes as i32)
        .bind(agent.proactive_max_daily as i32)
        .bind(agent.proactive_last_trigger_at)
        .bind(agent.cron_backoff_exponent as i32)
        .bind(agent.cron_runs_skipped as i32)
        .bind(agent.shutdown_requested)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn proactive_candidates(&self, limit: i64) -> Result<Vec<AgentRow>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT * FROM agents
            WHERE proactive_opt_in AND is_active AND NOT shutdown_requested
              AND life_state = 'ACTIVE'
            ORDER BY proactive_last_trigger_at ASC NULLS FIRST,
                     last_interaction_at ASC NULLS FIRST,
                     created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn expiration_candidates(&self, cutoff: DateTime<Utc>) -> Result<Vec<AgentRow>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT * FROM agents
            WHERE life_state = 'ACTIVE' AND is_active AND schedule <> ''
              AND COALESCE(last_interaction_at, created_at) <= $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ============================================
    // Steps and children
    // ============================================

    pub async fn insert_step(&self, step: &NewStep) -> Result<StepRow> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            INSERT INTO steps (id, agent_id, description, credits_cost_micros, eval_run_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(step.id)
        .bind(step.agent_id)
        .bind(&step.description)
        .bind(step.credits_cost.micros())
        .bind(step.eval_run_id)
        .bind(step.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert_tool_call(&self, call: &NewToolCall) -> Result<ToolCallRow> {
        let row = sqlx::query_as::<_, ToolCallRow>(
            r#"
            INSERT INTO tool_calls (id, step_id, agent_id, tool_name, params, result, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(call.step_id)
        .bind(call.agent_id)
        .bind(&call.tool_name)
        .bind(&call.params)
        .bind(&call.result)
        .bind(call.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert_system_step(&self, step: &NewSystemStep) -> Result<SystemStepRow> {
        let row = sqlx::query_as::<_, SystemStepRow>(
            r#"
            INSERT INTO system_steps (id, step_id, agent_id, code, notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(step.step_id)
        .bind(step.agent_id)
        .bind(step.code.as_str())
        .bind(&step.notes)
        .bind(step.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn recent_steps(&self, agent_id: Uuid, limit: i64) -> Result<Vec<StepRow>> {
        let mut rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT * FROM steps
            WHERE agent_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn recent_tool_calls(&self, agent_id: Uuid, limit: i64) -> Result<Vec<ToolCallRow>> {
        let mut rows = sqlx::query_as::<_, ToolCallRow>(
            r#"
            SELECT * FROM tool_calls
            WHERE agent_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn sum_step_credits(&self, agent_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let micros: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(credits_cost_micros) FROM steps WHERE agent_id = $1 AND created_at >= $2",
        )
        .bind(agent_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(micros.unwrap_or(0))
    }

    pub async fn sum_owner_credits(
        &self,
        owner: OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let micros: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(s.credits_cost_micros)
            FROM steps s
            JOIN agents a ON a.id = s.agent_id
            WHERE a.owner_type = $1 AND a.owner_id = $2
              AND s.created_at >= $3 AND s.created_at < $4
            "#,
        )
        .bind(owner_type(owner))
        .bind(owner.id())
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(micros.unwrap_or(0))
    }

    pub async fn count_system_steps_since(
        &self,
        agent_id: Uuid,
        code: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM system_steps WHERE agent_id = $1 AND code = $2 AND created_at >= $3",
        )
        .bind(agent_id)
        .bind(code)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_owner_tool_calls_since(
        &self,
        owner: OwnerRef,
        tool_name: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM tool_calls t
            JOIN agents a ON a.id = t.agent_id
            WHERE a.owner_type = $1 AND a.owner_id = $2
              AND t.tool_name = $3 AND t.created_at >= $4
            "#,
        )
        .bind(owner_type(owner))
        .bind(owner.id())
        .bind(tool_name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // ============================================
    // Messages and endpoints
    // ============================================

    /// Insert a message, assigning the next per-conversation seq in one
    /// statement so concurrent writers cannot produce duplicates.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow> {
        let counterpart = if message.is_outbound {
            message.to_address.to_lowercase()
        } else {
            message.from_address.to_lowercase()
        };
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (
                id, agent_id, conversation_id, channel, from_address, to_address,
                is_outbound, body, subject, attachment_ids, seq, timestamp
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                   COALESCE(MAX(m.seq), 0) + 1, $11
            FROM (SELECT 1) one
            LEFT JOIN messages m
              ON (($3::uuid IS NOT NULL AND m.conversation_id = $3)
                  OR ($3::uuid IS NULL
                      AND m.agent_id = $2
                      AND m.channel = $4
                      AND LOWER(CASE WHEN m.is_outbound THEN m.to_address ELSE m.from_address END) = $12))
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(message.agent_id)
        .bind(message.conversation_id)
        .bind(message.channel.as_str())
        .bind(&message.from_address)
        .bind(&message.to_address)
        .bind(message.is_outbound)
        .bind(&message.body)
        .bind(&message.subject)
        .bind(&message.attachment_ids)
        .bind(message.timestamp)
        .bind(counterpart)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn recent_messages(&self, agent_id: Uuid, limit: i64) -> Result<Vec<MessageRow>> {
        let mut rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM messages
            WHERE agent_id = $1
            ORDER BY timestamp DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn last_inbound(&self, agent_id: Uuid) -> Result<Option<MessageRow>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM messages
            WHERE agent_id = $1 AND NOT is_outbound
            ORDER BY timestamp DESC, seq DESC
            LIMIT 1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn last_outbound(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
        to_address: Option<&str>,
        conversation_id: Option<Uuid>,
    ) -> Result<Option<MessageRow>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM messages
            WHERE agent_id = $1 AND is_outbound AND channel = $2
              AND ($3::text IS NULL OR LOWER(to_address) = LOWER($3))
              AND ($4::uuid IS NULL OR conversation_id = $4)
            ORDER BY timestamp DESC, seq DESC
            LIMIT 1
            "#,
        )
        .bind(agent_id)
        .bind(channel.as_str())
        .bind(to_address)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn record_delivery_error(&self, message_id: Uuid, error: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET delivery_error = $2 WHERE id = $1")
            .bind(message_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn allowlist_snapshot(&self, agent_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT LOWER(CASE WHEN is_outbound THEN to_address ELSE from_address END)
            FROM messages
            WHERE agent_id = $1
            ORDER BY 1
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn agent_endpoint(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
    ) -> Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT * FROM comms_endpoints
            WHERE owner_agent_id = $1 AND channel = $2
            ORDER BY is_primary DESC, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(agent_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn endpoint(&self, endpoint_id: Uuid) -> Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>("SELECT * FROM comms_endpoints WHERE id = $1")
            .bind(endpoint_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // ============================================
    // Variables
    // ============================================

    /// Idempotent insert with LRU eviction beyond the per-agent cap, all in
    /// one transaction.
    pub async fn get_or_create_variable(
        &self,
        agent_id: Uuid,
        variable: &NewVariable,
        created_at: DateTime<Utc>,
        cap: i64,
    ) -> Result<(VariableRow, bool)> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, VariableRow>(
            r#"
            INSERT INTO variables (id, agent_id, name, value, is_json, size_bytes, tool_call_id, summary, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (agent_id, name) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(agent_id)
        .bind(&variable.name)
        .bind(&variable.value)
        .bind(variable.is_json)
        .bind(variable.size_bytes as i64)
        .bind(variable.tool_call_id)
        .bind(&variable.summary)
        .bind(created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let (row, created) = match inserted {
            Some(row) => {
                sqlx::query(
                    r#"
                    DELETE FROM variables
                    WHERE agent_id = $1 AND id NOT IN (
                        SELECT id FROM variables
                        WHERE agent_id = $1
                        ORDER BY created_at DESC, id DESC
                        LIMIT $2
                    )
                    "#,
                )
                .bind(agent_id)
                .bind(cap)
                .execute(&mut *tx)
                .await?;
                (row, true)
            }
            None => {
                let existing = sqlx::query_as::<_, VariableRow>(
                    "SELECT * FROM variables WHERE agent_id = $1 AND name = $2",
                )
                .bind(agent_id)
                .bind(&variable.name)
                .fetch_one(&mut *tx)
                .await?;
                (existing, false)
            }
        };

        tx.commit().await?;
        Ok((row, created))
    }

    pub async fn get_variable(&self, agent_id: Uuid, name: &str) -> Result<Option<VariableRow>> {
        let row = sqlx::query_as::<_, VariableRow>(
            "SELECT * FROM variables WHERE agent_id = $1 AND name = $2",
        )
        .bind(agent_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_variables(&self, agent_id: Uuid) -> Result<Vec<VariableRow>> {
        let rows = sqlx::query_as::<_, VariableRow>(
            "SELECT * FROM variables WHERE agent_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ============================================
    // Prompt archives
    // ============================================

    pub async fn insert_prompt_archive(
        &self,
        archive: &perpetua_core::prompt::NewPromptArchive,
    ) -> Result<PromptArchiveRow> {
        let tokens_saved = archive.tokens_before.saturating_sub(archive.tokens_after);
        let row = sqlx::query_as::<_, PromptArchiveRow>(
            r#"
            INSERT INTO prompt_archives
                (id, agent_id, step_id, storage_key, tokens_before, tokens_after, tokens_saved, rendered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(archive.agent_id)
        .bind(archive.step_id)
        .bind(&archive.storage_key)
        .bind(archive.tokens_before as i32)
        .bind(archive.tokens_after as i32)
        .bind(tokens_saved as i32)
        .bind(archive.rendered_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Delete archives rendered before the cutoff in id-ordered chunks.
    /// Returns (found, deleted).
    pub async fn prune_prompt_archives(
        &self,
        cutoff: DateTime<Utc>,
        chunk_size: i64,
        dry_run: bool,
    ) -> Result<(u64, u64)> {
        let found: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM prompt_archives WHERE rendered_at < $1")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
        if dry_run {
            return Ok((found as u64, 0));
        }

        let mut deleted: u64 = 0;
        loop {
            let result = sqlx::query(
                r#"
                DELETE FROM prompt_archives
                WHERE id IN (
                    SELECT id FROM prompt_archives
                    WHERE rendered_at < $1
                    ORDER BY rendered_at
                    LIMIT $2
                )
                "#,
            )
            .bind(cutoff)
            .bind(chunk_size)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                break;
            }
            deleted += result.rows_affected();
        }
        Ok((found as u64, deleted))
    }

    // ============================================
    // Routing configuration
    // ============================================

    pub async fn load_providers(&self) -> Result<Vec<ProviderRow>> {
        Ok(sqlx::query_as::<_, ProviderRow>("SELECT * FROM llm_providers")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn load_llm_endpoints(&self) -> Result<Vec<LlmEndpointRow>> {
        Ok(sqlx::query_as::<_, LlmEndpointRow>("SELECT * FROM llm_endpoints")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn load_token_ranges(&self) -> Result<Vec<TokenRangeRow>> {
        Ok(
            sqlx::query_as::<_, TokenRangeRow>("SELECT * FROM token_ranges ORDER BY min_tokens")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn load_tiers(&self) -> Result<Vec<TierRow>> {
        Ok(
            sqlx::query_as::<_, TierRow>("SELECT * FROM llm_tiers ORDER BY tier_order")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn load_tier_endpoints(&self) -> Result<Vec<TierEndpointRow>> {
        Ok(
            sqlx::query_as::<_, TierEndpointRow>("SELECT tier_id, endpoint_id, weight FROM tier_endpoints")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn load_embeddings_tiers(&self) -> Result<Vec<EmbeddingsTierRow>> {
        Ok(sqlx::query_as::<_, EmbeddingsTierRow>(
            "SELECT * FROM embeddings_tiers ORDER BY tier_order",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn load_embeddings_tier_endpoints(&self) -> Result<Vec<TierEndpointRow>> {
        Ok(sqlx::query_as::<_, TierEndpointRow>(
            "SELECT tier_id, endpoint_id, weight FROM embeddings_tier_endpoints",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    // ============================================
    // Plan configuration
    // ============================================

    pub async fn daily_credit_config(&self, plan: &str) -> Result<Option<DailyCreditConfigRow>> {
        Ok(sqlx::query_as::<_, DailyCreditConfigRow>(
            "SELECT * FROM daily_credit_configs WHERE plan = $1",
        )
        .bind(plan)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn tool_config(&self, plan: &str) -> Result<Option<ToolConfigRow>> {
        Ok(
            sqlx::query_as::<_, ToolConfigRow>("SELECT * FROM tool_configs WHERE plan = $1")
                .bind(plan)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn tool_rate_limits(&self, plan: &str) -> Result<Vec<ToolRateLimitRow>> {
        Ok(
            sqlx::query_as::<_, ToolRateLimitRow>("SELECT * FROM tool_rate_limits WHERE plan = $1")
                .bind(plan)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ============================================
    // Agent lock (lease table)
    // ============================================

    /// Acquire the lease unless a live one exists. A crashed worker's lease
    /// expires on its own, so no lock outlives its TTL.
    pub async fn try_acquire_lock(
        &self,
        agent_id: Uuid,
        ticket: Uuid,
        ttl_seconds: f64,
    ) -> Result<bool> {
        let acquired: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO agent_locks (agent_id, ticket, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (agent_id) DO UPDATE
                SET ticket = EXCLUDED.ticket, expires_at = EXCLUDED.expires_at
                WHERE agent_locks.expires_at < NOW()
            RETURNING ticket
            "#,
        )
        .bind(agent_id)
        .bind(ticket)
        .bind(ttl_seconds)
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    pub async fn release_lock(&self, agent_id: Uuid, ticket: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM agent_locks WHERE agent_id = $1 AND ticket = $2")
            .bind(agent_id)
            .bind(ticket)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============================================
    // Burn rate snapshots
    // ============================================

    pub async fn upsert_burn_rate_snapshot(
        &self,
        scope_type: &str,
        scope_id: Uuid,
        window_minutes: i32,
        window_micros: i64,
        per_hour_micros: i64,
        per_day_micros: i64,
        computed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO burn_rate_snapshots
                (scope_type, scope_id, window_minutes, window_credits_micros,
                 projected_per_hour_micros, projected_per_day_micros, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (scope_type, scope_id, window_minutes) DO UPDATE SET
                window_credits_micros = EXCLUDED.window_credits_micros,
                projected_per_hour_micros = EXCLUDED.projected_per_hour_micros,
                projected_per_day_micros = EXCLUDED.projected_per_day_micros,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(scope_type)
        .bind(scope_id)
        .bind(window_minutes)
        .bind(window_micros)
        .bind(per_hour_micros)
        .bind(per_day_micros)
        .bind(computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================
    // Compute sessions
    // ============================================

    pub async fn compute_session_for_agent(&self, agent_id: Uuid) -> Result<Option<ComputeSessionRow>> {
        Ok(sqlx::query_as::<_, ComputeSessionRow>(
            "SELECT * FROM compute_sessions WHERE agent_id = $1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn save_compute_session(
        &self,
        session: &perpetua_core::compute::ComputeSession,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO compute_sessions
                (id, agent_id, state, pod_name, workspace_pvc, last_activity_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (agent_id) DO UPDATE SET
                state = EXCLUDED.state,
                pod_name = EXCLUDED.pod_name,
                workspace_pvc = EXCLUDED.workspace_pvc,
                last_activity_at = EXCLUDED.last_activity_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(session.id)
        .bind(session.agent_id)
        .bind(session.state.as_str())
        .bind(&session.pod_name)
        .bind(&session.workspace_pvc)
        .bind(session.last_activity_at)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn idle_running_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<ComputeSessionRow>> {
        Ok(sqlx::query_as::<_, ComputeSessionRow>(
            "SELECT * FROM compute_sessions WHERE state = 'RUNNING' AND last_activity_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    // ============================================
    // Transfer invites
    // ============================================

    pub async fn insert_invite(&self, invite: &perpetua_core::transfer::TransferInvite) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transfer_invites
                (id, agent_id, from_owner_type, from_owner_id, to_email, status, created_at, responded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(invite.id)
        .bind(invite.agent_id)
        .bind(owner_type(invite.from_owner))
        .bind(invite.from_owner.id())
        .bind(&invite.to_email)
        .bind(invite_status(invite.status))
        .bind(invite.created_at)
        .bind(invite.responded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_invite(&self, invite_id: Uuid) -> Result<Option<TransferInviteRow>> {
        Ok(
            sqlx::query_as::<_, TransferInviteRow>("SELECT * FROM transfer_invites WHERE id = $1")
                .bind(invite_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn update_invite(&self, invite: &perpetua_core::transfer::TransferInvite) -> Result<()> {
        sqlx::query(
            "UPDATE transfer_invites SET status = $2, responded_at = $3 WHERE id = $1",
        )
        .bind(invite.id)
        .bind(invite_status(invite.status))
        .bind(invite.responded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pending_invites_for_agent(&self, agent_id: Uuid) -> Result<Vec<TransferInviteRow>> {
        Ok(sqlx::query_as::<_, TransferInviteRow>(
            "SELECT * FROM transfer_invites WHERE agent_id = $1 AND status = 'PENDING'",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ============================================
    // Evals
    // ============================================

    pub async fn get_eval_suite(&self, slug: &str) -> Result<Option<(String, String, serde_json::Value)>> {
        let row: Option<(String, String, serde_json::Value)> =
            sqlx::query_as("SELECT slug, name, scenarios FROM eval_suites WHERE slug = $1")
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn insert_eval_run(&self, run: &perpetua_core::evals::EvalRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO eval_runs (id, suite_slug, run_type, strategy, agent_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(&run.suite_slug)
        .bind(serde_variant(&run.run_type))
        .bind(serde_variant(&run.strategy))
        .bind(run.agent_id)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_eval_task(&self, task: &perpetua_core::evals::EvalTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO eval_tasks (id, run_id, scenario_slug, status, detail, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(task.id)
        .bind(task.run_id)
        .bind(&task.scenario_slug)
        .bind(serde_variant(&task.status))
        .bind(&task.detail)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_eval_tasks(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<(Uuid, Uuid, String, String, String, DateTime<Utc>, DateTime<Utc>)>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, run_id, scenario_slug, status, detail, created_at, updated_at
            FROM eval_tasks WHERE run_id = $1 ORDER BY created_at
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn update_eval_task(&self, task: &perpetua_core::evals::EvalTask) -> Result<()> {
        sqlx::query(
            "UPDATE eval_tasks SET status = $2, detail = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(task.id)
        .bind(serde_variant(&task.status))
        .bind(&task.detail)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl Database {
    // ============================================
    // Administrative helpers
    // ============================================

    /// Idempotently ensure the superuser row exists; true when created
    pub async fn ensure_superuser(&self, email: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO admin_users (id, email, is_superuser)
            VALUES ($1, LOWER($2), TRUE)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_scheduled_agents(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM agents WHERE schedule <> ''")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Enforce the invariant that only ACTIVE agents carry a schedule.
    /// Snapshots the schedule before clearing. Returns rows fixed.
    pub async fn clear_schedules_for_inactive(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET schedule_snapshot = schedule, schedule = ''
            WHERE schedule <> '' AND life_state <> 'ACTIVE'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn invite_status(status: perpetua_core::transfer::InviteStatus) -> &'static str {
    use perpetua_core::transfer::InviteStatus::*;
    match status {
        Pending => "PENDING",
        Accepted => "ACCEPTED",
        Declined => "DECLINED",
        Cancelled => "CANCELLED",
    }
}

/// Render a serde enum variant as its serialized string form
fn serde_variant<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}
