// Outbound duplicate guard.
//
// Before a send tool persists an outbound message, the guard compares it to
// the most recent outbound on the same channel (optionally to the same
// address or conversation). Exact match rejects outright; otherwise an
// embeddings cosine score decides, falling back to the Levenshtein ratio
// when no embeddings endpoint is reachable. Degradation to edit distance is
// deliberate, not an error path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::llm::{DriverRegistry, EmbeddingsDriver};
use crate::message::CommsChannel;
use crate::routing::RoutingProfile;
use crate::traits::{MessageStore, RoutingStore};

/// Why the candidate outbound was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    Exact,
    Similarity,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::Exact => "exact",
            DuplicateReason::Similarity => "similarity",
        }
    }
}

/// Outcome of a duplicate detection check
#[derive(Debug, Clone)]
pub struct DuplicateDetection {
    pub reason: DuplicateReason,
    pub similarity: Option<f64>,
    pub previous_timestamp: DateTime<Utc>,
}

impl DuplicateDetection {
    /// Serializable payload explaining the rejection. `auto_sleep_ok` tells
    /// the loop this is a valid stop condition.
    pub fn to_error_response(&self) -> Value {
        let (detail, instruction) = match self.reason {
            DuplicateReason::Exact => ("matches", "Do not attempt to send this message again."),
            DuplicateReason::Similarity => (
                "is highly similar to",
                "Consider if this message should have been sent at all. \
                 If so, please revise before sending again.",
            ),
        };
        let mut payload = json!({
            "status": "error",
            "message": format!(
                "Message blocked: content {detail} the previous message and may be a duplicate. {instruction}"
            ),
            "duplicate_detected": true,
            "duplicate_reason": self.reason.as_str(),
            "auto_sleep_ok": true,
            "duplicate_timestamp": self.previous_timestamp.to_rfc3339(),
        });
        if let Some(similarity) = self.similarity {
            payload["duplicate_similarity"] = json!(similarity);
        }
        payload
    }
}

// ============================================================================
// Similarity primitives
// ============================================================================

/// Classic Levenshtein ratio: (|a| + |b| - distance) / (|a| + |b|)
pub fn levenshtein_ratio(left: &str, right: &str) -> f64 {
    if left == right {
        return 1.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let left_chars: Vec<char> = left.chars().collect();
    let right_chars: Vec<char> = right.chars().collect();
    let cols = right_chars.len() + 1;

    let mut previous_row: Vec<usize> = (0..cols).collect();
    for (i, lc) in left_chars.iter().enumerate() {
        let mut current_row = vec![i + 1];
        for (j, rc) in right_chars.iter().enumerate() {
            let cost = usize::from(lc != rc);
            let insertions = previous_row[j + 1] + 1;
            let deletions = current_row[j] + 1;
            let substitutions = previous_row[j] + cost;
            current_row.push(insertions.min(deletions).min(substitutions));
        }
        previous_row = current_row;
    }

    let distance = *previous_row.last().unwrap_or(&0);
    let total = left_chars.len() + right_chars.len();
    (total - distance) as f64 / total as f64
}

fn cosine(vec_a: &[f64], vec_b: &[f64]) -> Option<f64> {
    if vec_a.len() != vec_b.len() || vec_a.is_empty() {
        return None;
    }
    let dot: f64 = vec_a.iter().zip(vec_b).map(|(a, b)| a * b).sum();
    let norm_a: f64 = vec_a.iter().map(|a| a * a).sum::<f64>().sqrt();
    let norm_b: f64 = vec_b.iter().map(|b| b * b).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(dot / (norm_a * norm_b))
}

/// Walk the embeddings tier sequence until one endpoint scores the pair.
/// Returns the cosine rescaled to [0, 1], or None when no endpoint is
/// reachable.
async fn embedding_similarity(
    profile: &RoutingProfile,
    drivers: &DriverRegistry,
    left: &str,
    right: &str,
) -> Option<f64> {
    for (model, resolved) in profile.embeddings_sequence() {
        let Some(driver) = drivers.embeddings(resolved.backend) else {
            continue;
        };
        let inputs = vec![left.to_string(), right.to_string()];
        match driver
            .embed(
                &model,
                &resolved.api_key,
                resolved.endpoint.base_url.as_deref(),
                &inputs,
            )
            .await
        {
            Ok(embeddings) if embeddings.len() >= 2 => {
                if let Some(cos) = cosine(&embeddings[0], &embeddings[1]) {
                    let ratio = (cos + 1.0) / 2.0;
                    return Some(ratio.clamp(0.0, 1.0));
                }
            }
            Ok(_) => {
                tracing::warn!(endpoint = %resolved.endpoint.key, "embedding response missing comparison vectors");
            }
            Err(err) => {
                tracing::warn!(
                    endpoint = %resolved.endpoint.key,
                    error = %err,
                    "embeddings endpoint failed"
                );
            }
        }
    }
    None
}

// ============================================================================
// Guard
// ============================================================================

pub struct DuplicateGuard {
    messages: Arc<dyn MessageStore>,
    routing: Arc<dyn RoutingStore>,
    drivers: DriverRegistry,
}

impl DuplicateGuard {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        routing: Arc<dyn RoutingStore>,
        drivers: DriverRegistry,
    ) -> Self {
        Self {
            messages,
            routing,
            drivers,
        }
    }

    /// Check whether the pending outbound is a recent duplicate.
    ///
    /// Two passes: exact body comparison first, then similarity (embeddings
    /// when reachable, Levenshtein otherwise) against `threshold`.
    pub async fn check(
        &self,
        agent_id: Uuid,
        channel: CommsChannel,
        body: &str,
        to_address: Option<&str>,
        conversation_id: Option<Uuid>,
        threshold: f64,
    ) -> crate::error::Result<Option<DuplicateDetection>> {
        let current_body = body.trim();
        if current_body.is_empty() {
            return Ok(None);
        }

        let Some(previous) = self
            .messages
            .last_outbound(agent_id, channel, to_address, conversation_id)
            .await?
        else {
            return Ok(None);
        };

        let previous_body = previous.body.trim();
        if previous_body.is_empty() {
            return Ok(None);
        }

        if previous_body == current_body {
            return Ok(Some(DuplicateDetection {
                reason: DuplicateReason::Exact,
                similarity: None,
                previous_timestamp: previous.timestamp,
            }));
        }

        let similarity = match self.routing.active_profile().await {
            Ok(profile) => {
                embedding_similarity(&profile, &self.drivers, previous_body, current_body).await
            }
            Err(err) => {
                tracing::warn!(error = %err, "routing profile unavailable for embeddings");
                None
            }
        };
        let similarity = similarity.unwrap_or_else(|| levenshtein_ratio(previous_body, current_body));

        if similarity >= threshold {
            return Ok(Some(DuplicateDetection {
                reason: DuplicateReason::Similarity,
                similarity: Some(similarity),
                previous_timestamp: previous.timestamp,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_ratio_one() {
        assert_eq!(levenshtein_ratio("abc", "abc"), 1.0);
    }

    #[test]
    fn empty_vs_nonempty_is_zero() {
        assert_eq!(levenshtein_ratio("", "abc"), 0.0);
        assert_eq!(levenshtein_ratio("abc", ""), 0.0);
    }

    #[test]
    fn single_edit_ratio() {
        // distance 1, lengths 3 + 3: (6 - 1) / 6
        let ratio = levenshtein_ratio("cat", "car");
        assert!((ratio - 5.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn near_identical_long_strings_score_high() {
        let a = "Reminder: standup at 9 tomorrow in the main room";
        let b = "Reminder: standup at 9 tomorrow in the main room!";
        assert!(levenshtein_ratio(a, b) > 0.97);
    }

    #[test]
    fn unrelated_strings_score_low() {
        let ratio = levenshtein_ratio("completely different", "zzzzqqqq");
        assert!(ratio < 0.5);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, -0.25, 1.0];
        assert!((cosine(&v, &v).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_rejects_mismatched_lengths() {
        assert!(cosine(&[1.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]).unwrap(), 0.0);
    }

    #[test]
    fn exact_rejection_payload_shape() {
        let detection = DuplicateDetection {
            reason: DuplicateReason::Exact,
            similarity: None,
            previous_timestamp: Utc::now(),
        };
        let payload = detection.to_error_response();
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["duplicate_detected"], true);
        assert_eq!(payload["duplicate_reason"], "exact");
        assert_eq!(payload["auto_sleep_ok"], true);
        assert!(payload.get("duplicate_similarity").is_none());
    }

    #[test]
    fn similarity_rejection_includes_score() {
        let detection = DuplicateDetection {
            reason: DuplicateReason::Similarity,
            similarity: Some(0.985),
            previous_timestamp: Utc::now(),
        };
        let payload = detection.to_error_response();
        assert_eq!(payload["duplicate_reason"], "similarity");
        assert_eq!(payload["duplicate_similarity"], 0.985);
    }

    mod guard {
        use super::*;
        use crate::memory::InMemoryStore;
        use crate::message::NewMessage;
        use crate::traits::MessageStore;
        use std::sync::Arc;

        async fn guard_with_history(body: &str) -> (DuplicateGuard, Uuid) {
            let store = Arc::new(InMemoryStore::new());
            let agent_id = Uuid::now_v7();
            store
                .create_message(NewMessage::outbound(
                    agent_id,
                    CommsChannel::Email,
                    "agent@example.com",
                    "u@example.com",
                    body,
                    Utc::now(),
                ))
                .await
                .unwrap();
            // No embeddings drivers configured: the guard degrades to the
            // Levenshtein ratio
            let guard = DuplicateGuard::new(store.clone(), store, DriverRegistry::new());
            (guard, agent_id)
        }

        #[tokio::test]
        async fn exact_match_rejects() {
            let (guard, agent_id) = guard_with_history("Reminder: standup at 9").await;
            let detection = guard
                .check(
                    agent_id,
                    CommsChannel::Email,
                    "Reminder: standup at 9",
                    Some("u@example.com"),
                    None,
                    0.97,
                )
                .await
                .unwrap()
                .unwrap();
            assert_eq!(detection.reason, DuplicateReason::Exact);
        }

        #[tokio::test]
        async fn near_identical_rejects_on_similarity() {
            let (guard, agent_id) = guard_with_history("Reminder: standup at 9").await;
            let detection = guard
                .check(
                    agent_id,
                    CommsChannel::Email,
                    "Reminder: standup at 9!",
                    Some("u@example.com"),
                    None,
                    0.97,
                )
                .await
                .unwrap()
                .unwrap();
            assert_eq!(detection.reason, DuplicateReason::Similarity);
            assert!(detection.similarity.unwrap() >= 0.97);
        }

        #[tokio::test]
        async fn different_body_is_accepted() {
            let (guard, agent_id) = guard_with_history("Reminder: standup at 9").await;
            let detection = guard
                .check(
                    agent_id,
                    CommsChannel::Email,
                    "Quarterly report draft attached for review",
                    Some("u@example.com"),
                    None,
                    0.97,
                )
                .await
                .unwrap();
            assert!(detection.is_none());
        }

        #[tokio::test]
        async fn first_message_to_address_is_accepted() {
            let (guard, agent_id) = guard_with_history("Reminder: standup at 9").await;
            let detection = guard
                .check(
                    agent_id,
                    CommsChannel::Email,
                    "Reminder: standup at 9",
                    Some("someone-else@example.com"),
                    None,
                    0.97,
                )
                .await
                .unwrap();
            assert!(detection.is_none());
        }
    }
}
