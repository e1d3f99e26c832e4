// Engine configuration.
//
// Built once at startup from the environment and threaded through the engine
// context; nothing here is a process global.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default duplicate-similarity threshold when no plan override exists
pub const DEFAULT_DUPLICATE_SIMILARITY_THRESHOLD: f64 = 0.97;

const DEFAULT_MIN_CRON_SCHEDULE_MINUTES: u32 = 30;
const DEFAULT_SEARCH_RESULT_COUNT: u32 = 5;
const DEFAULT_BATCH_QUERY_LIMIT: u32 = 10;

/// Engine-wide tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on pathological runs; exceeding it requires a new external event
    pub max_steps_per_invocation: u32,
    /// Advisory lock TTL; slightly longer than the maximum single-step budget
    pub lock_ttl: Duration,
    /// Tokens reserved for the model reply when computing the prompt budget
    pub reserved_reply_tokens: u32,
    /// Whole tool results at or above this size become variables
    pub min_variable_bytes: usize,
    /// Prompt archive retention window
    pub prompt_archive_retention_days: i64,
    /// Soft-expiration inactivity window
    pub soft_expiration_inactivity_days: i64,
    /// Grace window after a plan downgrade before soft-expiration applies
    pub downgrade_grace_hours: i64,
    /// Sandbox sessions idle longer than this are stopped
    pub sandbox_idle_ttl: Duration,
    /// Per-operation timeout applied at suspension points
    pub operation_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_invocation: 30,
            lock_ttl: Duration::from_secs(600),
            reserved_reply_tokens: 4096,
            min_variable_bytes: crate::variable::DEFAULT_MIN_VARIABLE_BYTES,
            prompt_archive_retention_days: 30,
            soft_expiration_inactivity_days: 14,
            downgrade_grace_hours: 48,
            sandbox_idle_ttl: Duration::from_secs(3600),
            operation_timeout: Duration::from_secs(120),
        }
    }
}

/// Per-plan tool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPlanSettings {
    /// Minimum cron schedule interval; None = unrestricted
    pub min_cron_schedule_minutes: Option<u32>,
    /// Hourly rate limits keyed by lowercase tool name; absent = unlimited
    pub rate_limits: HashMap<String, u32>,
    pub search_result_count: u32,
    pub batch_query_limit: u32,
    pub duplicate_similarity_threshold: f64,
}

impl Default for ToolPlanSettings {
    fn default() -> Self {
        Self {
            min_cron_schedule_minutes: Some(DEFAULT_MIN_CRON_SCHEDULE_MINUTES),
            rate_limits: HashMap::new(),
            search_result_count: DEFAULT_SEARCH_RESULT_COUNT,
            batch_query_limit: DEFAULT_BATCH_QUERY_LIMIT,
            duplicate_similarity_threshold: DEFAULT_DUPLICATE_SIMILARITY_THRESHOLD,
        }
    }
}

impl ToolPlanSettings {
    /// Hourly limit for a tool, or None when unlimited
    pub fn hourly_limit_for_tool(&self, tool_name: &str) -> Option<u32> {
        let key = tool_name.trim().to_lowercase();
        self.rate_limits.get(&key).copied().filter(|limit| *limit > 0)
    }

    /// Clamp an out-of-range similarity threshold back to the default
    pub fn normalized_similarity_threshold(&self) -> f64 {
        let t = self.duplicate_similarity_threshold;
        if t.is_nan() || !(0.0..=1.0).contains(&t) {
            DEFAULT_DUPLICATE_SIMILARITY_THRESHOLD
        } else {
            t
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_lookup_is_case_insensitive() {
        let mut settings = ToolPlanSettings::default();
        settings.rate_limits.insert("search_engine".to_string(), 10);
        assert_eq!(settings.hourly_limit_for_tool(" Search_Engine "), Some(10));
        assert_eq!(settings.hourly_limit_for_tool("other"), None);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let mut settings = ToolPlanSettings::default();
        settings.rate_limits.insert("scrape".to_string(), 0);
        assert_eq!(settings.hourly_limit_for_tool("scrape"), None);
    }

    #[test]
    fn bad_similarity_threshold_falls_back() {
        let mut settings = ToolPlanSettings::default();
        settings.duplicate_similarity_threshold = 1.5;
        assert_eq!(
            settings.normalized_similarity_threshold(),
            DEFAULT_DUPLICATE_SIMILARITY_THRESHOLD
        );
        settings.duplicate_similarity_threshold = 0.9;
        assert_eq!(settings.normalized_similarity_threshold(), 0.9);
    }
}
