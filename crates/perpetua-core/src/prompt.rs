// Prompt assembly and compaction.
//
// The system prompt is canonical and stable so it content-hashes well; the
// user prompt is a chronological narrative of events since the last step
// boundary plus catalogs (files, variables, allowlist). When the rendered
// prompt exceeds the token budget, compaction applies deterministically:
// digest substitution, then summarizer collapse, then drop-oldest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::credit::Credits;
use crate::error::Result;
use crate::llm::ToolSchema;
use crate::traits::FileInfo;
use crate::variable::{describe_variables, Variable};

/// Files surfaced in the prompt catalog
pub const MAX_CATALOG_FILES: usize = 30;

/// Rough token estimate: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// Content key for archival: sha256 over system + NUL + user
pub fn prompt_content_hash(system: &str, user: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(system.as_bytes());
    hasher.update([0u8]);
    hasher.update(user.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Prompt archive records
// ============================================================================

/// Content-addressed record of a rendered prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArchive {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub step_id: Option<Uuid>,
    /// Content hash; also the blob storage key
    pub storage_key: String,
    pub tokens_before: u32,
    pub tokens_after: u32,
    pub tokens_saved: u32,
    pub rendered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPromptArchive {
    pub agent_id: Uuid,
    pub step_id: Option<Uuid>,
    pub storage_key: String,
    pub tokens_before: u32,
    pub tokens_after: u32,
    pub rendered_at: DateTime<Utc>,
}

// ============================================================================
// Summarizer seam
// ============================================================================

/// Collapses older history into a short summary. The credit cost of the
/// summarizer call is attributed to the step that triggered compaction.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<(String, Credits)>;
}

// ============================================================================
// Assembly inputs
// ============================================================================

/// One entry in the chronological event narrative
#[derive(Debug, Clone)]
pub struct NarrativeEntry {
    pub timestamp: DateTime<Utc>,
    pub seq: i64,
    pub text: String,
    /// Compact substitute (digest/skeleton summary line) used by compaction
    pub compact_text: Option<String>,
}

impl NarrativeEntry {
    pub fn new(timestamp: DateTime<Utc>, seq: i64, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            seq,
            text: text.into(),
            compact_text: None,
        }
    }

    pub fn with_compact(mut self, compact: impl Into<String>) -> Self {
        self.compact_text = Some(compact.into());
        self
    }
}

/// Everything the assembler needs, fetched by the engine up front
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub agent_name: String,
    pub charter: String,
    pub capability_hints: Vec<String>,
    pub plan_guidance: String,
    pub entries: Vec<NarrativeEntry>,
    pub files: Vec<FileInfo>,
    pub variables: Vec<Variable>,
    pub allowlist: Vec<String>,
    pub tool_schemas: Vec<ToolSchema>,
}

/// Rendered prompt plus compaction accounting
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
    pub tokens_before: u32,
    pub tokens_after: u32,
    /// Credits spent on summarizer calls during compaction
    pub summarizer_cost: Credits,
}

impl AssembledPrompt {
    pub fn tokens_saved(&self) -> u32 {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    pub fn was_compacted(&self) -> bool {
        self.tokens_after < self.tokens_before
    }

    pub fn content_hash(&self) -> String {
        prompt_content_hash(&self.system, &self.user)
    }
}

// ============================================================================
// Assembly
// ============================================================================

const SAFETY_SECTION: &str = "\
# Operating rules
- Communicate only with allowlisted contacts.
- Reference stored values as $name inside tool parameters instead of inlining large content.
- Call the sleep tool when there is nothing further to do.";

fn render_system(inputs: &PromptInputs) -> String {
    let mut sections = Vec::new();
    sections.push(format!(
        "You are {}, a persistent autonomous agent.",
        inputs.agent_name
    ));
    if !inputs.charter.is_empty() {
        sections.push(format!("# Charter\n{}", inputs.charter));
    }
    if !inputs.capability_hints.is_empty() {
        sections.push(format!("# Capabilities\n{}", inputs.capability_hints.join("\n")));
    }
    if !inputs.plan_guidance.is_empty() {
        sections.push(format!("# Plan guidance\n{}", inputs.plan_guidance));
    }
    sections.push(SAFETY_SECTION.to_string());
    sections.join("\n\n")
}

fn render_catalogs(inputs: &PromptInputs) -> String {
    let mut sections = Vec::new();

    if !inputs.files.is_empty() {
        let lines: Vec<String> = inputs
            .files
            .iter()
            .take(MAX_CATALOG_FILES)
            .map(|f| {
                format!(
                    "{} ({} bytes, {}, updated {})",
                    f.path,
                    f.size_bytes,
                    f.mime,
                    f.updated_at.format("%Y-%m-%d %H:%M")
                )
            })
            .collect();
        sections.push(format!("# Files\n{}", lines.join("\n")));
    }

    if !inputs.variables.is_empty() {
        sections.push(format!("# Variables\n{}", describe_variables(&inputs.variables)));
    }

    if !inputs.allowlist.is_empty() {
        sections.push(format!("# Allowed contacts\n{}", inputs.allowlist.join("\n")));
    }

    sections.join("\n\n")
}

fn render_entries(entries: &[(DateTime<Utc>, String)]) -> String {
    let lines: Vec<String> = entries
        .iter()
        .map(|(ts, text)| format!("[{}] {}", ts.format("%Y-%m-%d %H:%M:%S"), text))
        .collect();
    format!("# Events\n{}", lines.join("\n"))
}

fn render_user(catalogs: &str, entries: &[(DateTime<Utc>, String)]) -> String {
    if catalogs.is_empty() {
        render_entries(entries)
    } else {
        format!("{}\n\n{}", catalogs, render_entries(entries))
    }
}

/// Assemble the prompt, compacting deterministically until it fits the
/// token budget:
/// 1. swap large entries for their digest lines,
/// 2. collapse the older half of the narrative through the summarizer,
/// 3. drop oldest entries.
pub async fn assemble_prompt(
    inputs: &PromptInputs,
    token_budget: u32,
    summarizer: Option<&dyn Summarizer>,
) -> Result<AssembledPrompt> {
    let system = render_system(inputs);
    let catalogs = render_catalogs(inputs);

    // Chronological ordering by (timestamp, seq)
    let mut ordered: Vec<&NarrativeEntry> = inputs.entries.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));

    let full: Vec<(DateTime<Utc>, String)> = ordered
        .iter()
        .map(|e| (e.timestamp, e.text.clone()))
        .collect();

    let system_tokens = estimate_tokens(&system);
    let full_user = render_user(&catalogs, &full);
    let tokens_before = system_tokens + estimate_tokens(&full_user);
    let mut summarizer_cost = Credits::ZERO;

    if tokens_before <= token_budget {
        return Ok(AssembledPrompt {
            system,
            user: full_user,
            tokens_before,
            tokens_after: tokens_before,
            summarizer_cost,
        });
    }

    // Stage 1: digest substitution
    let mut entries: Vec<(DateTime<Utc>, String)> = ordered
        .iter()
        .map(|e| {
            (
                e.timestamp,
                e.compact_text.clone().unwrap_or_else(|| e.text.clone()),
            )
        })
        .collect();
    let mut user = render_user(&catalogs, &entries);
    let mut tokens_after = system_tokens + estimate_tokens(&user);

    // Stage 2: summarizer collapse of the older half
    if tokens_after > token_budget && entries.len() >= 4 {
        if let Some(summarizer) = summarizer {
            let split = entries.len() / 2;
            let older_text = entries[..split]
                .iter()
                .map(|(_, text)| text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            match summarizer.summarize(&older_text).await {
                Ok((summary, cost)) => {
                    summarizer_cost = summarizer_cost.saturating_add(cost);
                    let anchor = entries[split.saturating_sub(1)].0;
                    let mut collapsed =
                        vec![(anchor, format!("Prior conversation summary: {summary}"))];
                    collapsed.extend(entries.split_off(split));
                    entries = collapsed;
                    user = render_user(&catalogs, &entries);
                    tokens_after = system_tokens + estimate_tokens(&user);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "summarizer failed; falling through to drop-oldest");
                }
            }
        }
    }

    // Stage 3: drop oldest entries, always keeping the newest
    while tokens_after > token_budget && entries.len() > 1 {
        entries.remove(0);
        user = render_user(&catalogs, &entries);
        tokens_after = system_tokens + estimate_tokens(&user);
    }

    Ok(AssembledPrompt {
        system,
        user,
        tokens_before,
        tokens_after,
        summarizer_cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, minute, 0).unwrap()
    }

    fn inputs_with_entries(entries: Vec<NarrativeEntry>) -> PromptInputs {
        PromptInputs {
            agent_name: "scout".to_string(),
            charter: "Track widget prices and report weekly.".to_string(),
            entries,
            ..Default::default()
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        let a = prompt_content_hash("sys", "user");
        let b = prompt_content_hash("sys", "user");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // The NUL separator keeps boundary shifts distinct
        assert_ne!(prompt_content_hash("sysu", "ser"), a);
    }

    #[tokio::test]
    async fn small_prompt_is_not_compacted() {
        let inputs = inputs_with_entries(vec![
            NarrativeEntry::new(ts(0), 1, "inbound email: what time is the meeting"),
        ]);
        let prompt = assemble_prompt(&inputs, 100_000, None).await.unwrap();
        assert!(!prompt.was_compacted());
        assert!(prompt.system.contains("scout"));
        assert!(prompt.system.contains("Charter"));
        assert!(prompt.user.contains("inbound email"));
    }

    #[tokio::test]
    async fn entries_render_in_timestamp_then_seq_order() {
        let inputs = inputs_with_entries(vec![
            NarrativeEntry::new(ts(5), 2, "second"),
            NarrativeEntry::new(ts(5), 1, "first"),
            NarrativeEntry::new(ts(1), 9, "earliest"),
        ]);
        let prompt = assemble_prompt(&inputs, 100_000, None).await.unwrap();
        let earliest = prompt.user.find("earliest").unwrap();
        let first = prompt.user.find("first").unwrap();
        let second = prompt.user.find("second").unwrap();
        assert!(earliest < first && first < second);
    }

    #[tokio::test]
    async fn digest_substitution_happens_first() {
        let big = "x".repeat(4000);
        let inputs = inputs_with_entries(vec![
            NarrativeEntry::new(ts(0), 1, big).with_compact("tool result digest: 4KB of noise"),
            NarrativeEntry::new(ts(1), 2, "inbound: hello"),
        ]);
        let prompt = assemble_prompt(&inputs, 300, None).await.unwrap();
        assert!(prompt.was_compacted());
        assert!(prompt.user.contains("tool result digest"));
        assert!(prompt.user.contains("inbound: hello"));
    }

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _text: &str) -> Result<(String, Credits)> {
            Ok(("they discussed widgets".to_string(), Credits::from_micros(1000)))
        }
    }

    #[tokio::test]
    async fn summarizer_collapses_older_half() {
        let entries: Vec<NarrativeEntry> = (0..8)
            .map(|i| NarrativeEntry::new(ts(i), i as i64, format!("event {i}: {}", "y".repeat(200))))
            .collect();
        let inputs = inputs_with_entries(entries);
        let prompt = assemble_prompt(&inputs, 400, Some(&FixedSummarizer)).await.unwrap();

        assert!(prompt.user.contains("Prior conversation summary: they discussed widgets"));
        assert_eq!(prompt.summarizer_cost, Credits::from_micros(1000));
        // Newest entry survives
        assert!(prompt.user.contains("event 7"));
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest_entry() {
        let entries: Vec<NarrativeEntry> = (0..6)
            .map(|i| NarrativeEntry::new(ts(i), i as i64, format!("event {i}: {}", "z".repeat(400))))
            .collect();
        let inputs = inputs_with_entries(entries);
        // Tiny budget, no summarizer: only drop-oldest applies
        let prompt = assemble_prompt(&inputs, 60, None).await.unwrap();
        assert!(prompt.user.contains("event 5"));
        assert!(!prompt.user.contains("event 0:"));
    }

    #[tokio::test]
    async fn catalogs_render_when_present() {
        let mut inputs = inputs_with_entries(vec![NarrativeEntry::new(ts(0), 1, "hello")]);
        inputs.files = vec![FileInfo {
            path: "reports/widgets.csv".to_string(),
            size_bytes: 2048,
            mime: "text/csv".to_string(),
            updated_at: ts(0),
        }];
        inputs.allowlist = vec!["ops@example.com".to_string()];
        let prompt = assemble_prompt(&inputs, 100_000, None).await.unwrap();
        assert!(prompt.user.contains("# Files"));
        assert!(prompt.user.contains("reports/widgets.csv"));
        assert!(prompt.user.contains("# Allowed contacts"));
    }

    #[tokio::test]
    async fn archive_accounting_matches_prompt() {
        let big = "w".repeat(4000);
        let inputs = inputs_with_entries(vec![
            NarrativeEntry::new(ts(0), 1, big).with_compact("digest line"),
            NarrativeEntry::new(ts(1), 2, "recent message"),
        ]);
        let prompt = assemble_prompt(&inputs, 200, None).await.unwrap();
        assert_eq!(
            prompt.tokens_saved(),
            prompt.tokens_before - prompt.tokens_after
        );
        assert!(prompt.tokens_saved() > 0);
        assert_eq!(prompt.content_hash().len(), 64);
    }
}
