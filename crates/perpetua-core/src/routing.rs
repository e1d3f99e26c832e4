// LLM tier routing.
//
// Routing config is a graph: Provider -> ModelEndpoint -> TokenRange ->
// Tier -> TierEndpoint. A prompt's token count selects the token range;
// the preferred tier filters and reorders that range's tiers; within a tier
// endpoints are drawn by weighted random without replacement. The resulting
// sequence is the fallback order for one completion attempt.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::agent::PreferredTier;

/// Literal API key used for OpenAI-compatible proxy deployments that are
/// configured with a base URL only.
pub const NOAUTH_API_KEY: &str = "sk-noauth";

/// LLM provider (OpenAI, Anthropic, a self-hosted proxy, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub key: String,
    pub display_name: String,
    pub enabled: bool,
    /// Decrypted API key from the encrypted store, when configured
    pub api_key: Option<String>,
    /// Environment variable consulted when no stored key exists
    pub env_var_name: String,
    /// Driver backend selecting the wire protocol
    pub backend: ProviderBackend,
    pub vertex_project: String,
    pub vertex_location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderBackend {
    OpenAi,
    Anthropic,
    OpenAiCompat,
}

impl Provider {
    /// Resolve the API key: stored key, then env fallback
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        if !self.env_var_name.is_empty() {
            if let Ok(value) = std::env::var(&self.env_var_name) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        None
    }
}

/// Concrete model endpoint with capability flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub key: String,
    pub provider_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub enabled: bool,
    pub context_window: u32,
    pub supports_vision: bool,
    pub supports_tool_choice: bool,
    pub use_parallel_tool_calls: bool,
    pub supports_temperature: bool,
}

/// Weighted membership of an endpoint in a tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierEndpoint {
    pub endpoint_key: String,
    pub weight: f64,
}

/// Ordered tier within a token range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier {
    /// 1-based order within the range
    pub order: u32,
    pub description: String,
    pub credit_multiplier: f64,
    pub is_premium: bool,
    pub is_max: bool,
    pub endpoints: Vec<TierEndpoint>,
}

/// Half-open token interval `[min, max)`; max = None means unbounded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRange {
    pub name: String,
    pub min_tokens: u32,
    pub max_tokens: Option<u32>,
    pub tiers: Vec<Tier>,
}

impl TokenRange {
    pub fn contains(&self, tokens: u32) -> bool {
        tokens >= self.min_tokens && self.max_tokens.map_or(true, |max| tokens < max)
    }
}

/// Flat ordered embeddings tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsTier {
    pub order: u32,
    pub model: String,
    pub endpoints: Vec<TierEndpoint>,
}

/// Active routing profile: the full LLM configuration graph.
/// Exactly one profile is active at a time; admin writes bust the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingProfile {
    pub providers: HashMap<String, Provider>,
    pub endpoints: HashMap<String, ModelEndpoint>,
    pub token_ranges: Vec<TokenRange>,
    pub embeddings_tiers: Vec<EmbeddingsTier>,
}

/// Endpoint resolved for one attempt: everything the client needs to call it
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub endpoint: ModelEndpoint,
    pub provider_key: String,
    pub backend: ProviderBackend,
    pub api_key: String,
    pub tier_order: u32,
    pub credit_multiplier: f64,
    /// (project, location) injected for Vertex-backed providers
    pub vertex: Option<(String, String)>,
}

impl RoutingProfile {
    /// Select the token range containing `prompt_tokens`
    pub fn select_token_range(&self, prompt_tokens: u32) -> Option<&TokenRange> {
        self.token_ranges.iter().find(|r| r.contains(prompt_tokens))
    }

    fn resolve(&self, tier: &Tier, te: &TierEndpoint) -> Option<ResolvedEndpoint> {
        if te.weight <= 0.0 {
            return None;
        }
        let endpoint = self.endpoints.get(&te.endpoint_key)?;
        if !endpoint.enabled {
            return None;
        }
        let provider = self.providers.get(&endpoint.provider_key)?;
        if !provider.enabled {
            return None;
        }

        let api_key = match provider.resolve_api_key() {
            Some(key) => key,
            // Base-URL-only deployments use the literal proxy contract key
            None if endpoint.base_url.is_some() => NOAUTH_API_KEY.to_string(),
            None => return None,
        };

        let vertex = if provider.key.contains("google") {
            let project = if provider.vertex_project.is_empty() {
                std::env::var("GOOGLE_CLOUD_PROJECT").unwrap_or_default()
            } else {
                provider.vertex_project.clone()
            };
            let location = if provider.vertex_location.is_empty() {
                std::env::var("GOOGLE_CLOUD_LOCATION").unwrap_or_default()
            } else {
                provider.vertex_location.clone()
            };
            if project.is_empty() {
                None
            } else {
                Some((project, location))
            }
        } else {
            None
        };

        Some(ResolvedEndpoint {
            endpoint: endpoint.clone(),
            provider_key: provider.key.clone(),
            backend: provider.backend,
            api_key,
            tier_order: tier.order,
            credit_multiplier: tier.credit_multiplier,
            vertex,
        })
    }

    /// Order a range's tiers for a preferred tier:
    /// standard -> non-premium tiers only; premium -> premium tiers first,
    /// then standard; max -> max, then premium, then standard.
    fn filtered_tiers<'a>(range: &'a TokenRange, preferred: PreferredTier) -> Vec<&'a Tier> {
        let mut by_order: Vec<&Tier> = range.tiers.iter().collect();
        by_order.sort_by_key(|t| t.order);

        let standard: Vec<&Tier> = by_order
            .iter()
            .copied()
            .filter(|t| !t.is_premium && !t.is_max)
            .collect();
        let premium: Vec<&Tier> = by_order
            .iter()
            .copied()
            .filter(|t| t.is_premium && !t.is_max)
            .collect();
        let max: Vec<&Tier> = by_order.iter().copied().filter(|t| t.is_max).collect();

        match preferred {
            PreferredTier::Standard => standard,
            PreferredTier::Premium => premium.into_iter().chain(standard).collect(),
            PreferredTier::Max => max
                .into_iter()
                .chain(premium)
                .chain(standard)
                .collect(),
        }
    }

    /// Build the full fallback sequence for one completion: tiers in
    /// preferred order, endpoints within a tier drawn by weighted random
    /// without replacement.
    pub fn completion_sequence<R: Rng>(
        &self,
        prompt_tokens: u32,
        preferred: PreferredTier,
        rng: &mut R,
    ) -> Vec<ResolvedEndpoint> {
        let Some(range) = self.select_token_range(prompt_tokens) else {
            return Vec::new();
        };

        let mut sequence = Vec::new();
        for tier in Self::filtered_tiers(range, preferred) {
            let weighted: Vec<ResolvedWeighted> = tier
                .endpoints
                .iter()
                .filter_map(|te| {
                    self.resolve(tier, te).map(|resolved| ResolvedWeighted {
                        weight: te.weight,
                        resolved,
                    })
                })
                .collect();
            sequence.extend(weighted.drain_weighted(rng));
        }
        sequence
    }

    /// Fallback sequence for embeddings calls: flat tier order, endpoints by
    /// descending weight within a tier.
    pub fn embeddings_sequence(&self) -> Vec<(String, ResolvedEndpoint)> {
        let mut tiers: Vec<&EmbeddingsTier> = self.embeddings_tiers.iter().collect();
        tiers.sort_by_key(|t| t.order);

        let mut sequence = Vec::new();
        for tier in tiers {
            let mut entries: Vec<&TierEndpoint> =
                tier.endpoints.iter().filter(|te| te.weight > 0.0).collect();
            entries.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for te in entries {
                let shim = Tier {
                    order: tier.order,
                    description: String::new(),
                    credit_multiplier: 1.0,
                    is_premium: false,
                    is_max: false,
                    endpoints: Vec::new(),
                };
                if let Some(resolved) = self.resolve(&shim, te) {
                    sequence.push((tier.model.clone(), resolved));
                }
            }
        }
        sequence
    }
}

struct ResolvedWeighted {
    weight: f64,
    resolved: ResolvedEndpoint,
}

trait DrainWeighted {
    fn drain_weighted<R: Rng>(self, rng: &mut R) -> Vec<ResolvedEndpoint>;
}

impl DrainWeighted for Vec<ResolvedWeighted> {
    /// Weighted sampling without replacement; weights need not sum to 1
    fn drain_weighted<R: Rng>(mut self, rng: &mut R) -> Vec<ResolvedEndpoint> {
        let mut out = Vec::with_capacity(self.len());
        while !self.is_empty() {
            let total: f64 = self.iter().map(|c| c.weight).sum();
            let idx = if total <= 0.0 {
                0
            } else {
                let mut roll = rng.gen_range(0.0..total);
                let mut chosen = self.len() - 1;
                for (i, candidate) in self.iter().enumerate() {
                    if roll < candidate.weight {
                        chosen = i;
                        break;
                    }
                    roll -= candidate.weight;
                }
                chosen
            };
            out.push(self.swap_remove(idx).resolved);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn provider(key: &str, api_key: Option<&str>) -> Provider {
        Provider {
            key: key.to_string(),
            display_name: key.to_string(),
            enabled: true,
            api_key: api_key.map(|k| k.to_string()),
            env_var_name: String::new(),
            backend: ProviderBackend::OpenAi,
            vertex_project: String::new(),
            vertex_location: String::new(),
        }
    }

    fn endpoint(key: &str, provider_key: &str) -> ModelEndpoint {
        ModelEndpoint {
            key: key.to_string(),
            provider_key: provider_key.to_string(),
            model: format!("model-{key}"),
            base_url: None,
            enabled: true,
            context_window: 128_000,
            supports_vision: true,
            supports_tool_choice: true,
            use_parallel_tool_calls: true,
            supports_temperature: true,
        }
    }

    fn tier(order: u32, endpoints: &[(&str, f64)]) -> Tier {
        Tier {
            order,
            description: format!("Tier {order}"),
            credit_multiplier: 1.0,
            is_premium: false,
            is_max: false,
            endpoints: endpoints
                .iter()
                .map(|(key, weight)| TierEndpoint {
                    endpoint_key: key.to_string(),
                    weight: *weight,
                })
                .collect(),
        }
    }

    fn profile() -> RoutingProfile {
        let mut profile = RoutingProfile::default();
        profile
            .providers
            .insert("alpha".to_string(), provider("alpha", Some("key-a")));
        profile
            .providers
            .insert("beta".to_string(), provider("beta", Some("key-b")));
        profile
            .endpoints
            .insert("a1".to_string(), endpoint("a1", "alpha"));
        profile
            .endpoints
            .insert("a2".to_string(), endpoint("a2", "alpha"));
        profile
            .endpoints
            .insert("b1".to_string(), endpoint("b1", "beta"));
        profile.token_ranges = vec![
            TokenRange {
                name: "small".to_string(),
                min_tokens: 0,
                max_tokens: Some(7500),
                tiers: vec![tier(1, &[("a1", 0.9), ("a2", 0.1)]), tier(2, &[("b1", 1.0)])],
            },
            TokenRange {
                name: "large".to_string(),
                min_tokens: 7500,
                max_tokens: None,
                tiers: vec![tier(1, &[("b1", 1.0)])],
            },
        ];
        profile
    }

    #[test]
    fn token_range_selection_is_half_open() {
        let profile = profile();
        assert_eq!(profile.select_token_range(0).unwrap().name, "small");
        assert_eq!(profile.select_token_range(7499).unwrap().name, "small");
        assert_eq!(profile.select_token_range(7500).unwrap().name, "large");
        assert_eq!(profile.select_token_range(1_000_000).unwrap().name, "large");
    }

    #[test]
    fn sequence_exhausts_tier_before_falling_through() {
        let profile = profile();
        let mut rng = StdRng::seed_from_u64(7);
        let seq = profile.completion_sequence(1000, PreferredTier::Standard, &mut rng);

        assert_eq!(seq.len(), 3);
        // Tier 1 endpoints (in some weighted order) come before tier 2
        assert_eq!(seq[0].tier_order, 1);
        assert_eq!(seq[1].tier_order, 1);
        assert_eq!(seq[2].tier_order, 2);
        assert_eq!(seq[2].endpoint.key, "b1");
    }

    #[test]
    fn disabled_provider_is_skipped() {
        let mut profile = profile();
        profile.providers.get_mut("alpha").unwrap().enabled = false;
        let mut rng = StdRng::seed_from_u64(1);
        let seq = profile.completion_sequence(1000, PreferredTier::Standard, &mut rng);
        assert_eq!(seq.len(), 1);
        assert_eq!(seq[0].endpoint.key, "b1");
    }

    #[test]
    fn missing_key_skips_endpoint_unless_base_url() {
        let mut profile = profile();
        profile.providers.get_mut("alpha").unwrap().api_key = None;
        let mut rng = StdRng::seed_from_u64(1);
        let seq = profile.completion_sequence(1000, PreferredTier::Standard, &mut rng);
        assert_eq!(seq.len(), 1, "alpha endpoints have no key and no base_url");

        // With a base URL the endpoint routes using the noauth contract key
        profile.endpoints.get_mut("a1").unwrap().base_url =
            Some("http://proxy.internal/v1".to_string());
        let seq = profile.completion_sequence(1000, PreferredTier::Standard, &mut rng);
        assert_eq!(seq.len(), 2);
        let a1 = seq.iter().find(|r| r.endpoint.key == "a1").unwrap();
        assert_eq!(a1.api_key, NOAUTH_API_KEY);
    }

    #[test]
    fn zero_weight_endpoints_never_route() {
        let mut profile = profile();
        profile.token_ranges[0].tiers[0].endpoints[1].weight = 0.0;
        let mut rng = StdRng::seed_from_u64(1);
        let seq = profile.completion_sequence(1000, PreferredTier::Standard, &mut rng);
        assert!(seq.iter().all(|r| r.endpoint.key != "a2"));
    }

    #[test]
    fn premium_tiers_come_first_for_premium_agents() {
        let mut profile = profile();
        let mut premium_tier = tier(3, &[("a2", 1.0)]);
        premium_tier.is_premium = true;
        premium_tier.credit_multiplier = 3.0;
        profile.token_ranges[0].tiers.push(premium_tier);

        let mut rng = StdRng::seed_from_u64(1);
        let seq = profile.completion_sequence(1000, PreferredTier::Premium, &mut rng);
        assert_eq!(seq[0].endpoint.key, "a2");
        assert_eq!(seq[0].credit_multiplier, 3.0);

        // Standard agents never route to the premium tier
        let seq = profile.completion_sequence(1000, PreferredTier::Standard, &mut rng);
        assert!(seq.iter().all(|r| r.tier_order != 3));
    }

    #[test]
    fn max_ordering_is_max_premium_standard() {
        let mut profile = profile();
        let mut premium_tier = tier(3, &[("a2", 1.0)]);
        premium_tier.is_premium = true;
        let mut max_tier = tier(4, &[("b1", 1.0)]);
        max_tier.is_max = true;
        profile.token_ranges[0].tiers.push(premium_tier);
        profile.token_ranges[0].tiers.push(max_tier);

        let mut rng = StdRng::seed_from_u64(1);
        let seq = profile.completion_sequence(1000, PreferredTier::Max, &mut rng);
        assert_eq!(seq[0].tier_order, 4);
        assert_eq!(seq[1].tier_order, 3);
    }

    #[test]
    fn weighted_choice_respects_weights() {
        let profile = profile();
        let mut first_counts: HashMap<String, usize> = HashMap::new();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let seq = profile.completion_sequence(1000, PreferredTier::Standard, &mut rng);
            *first_counts.entry(seq[0].endpoint.key.clone()).or_insert(0) += 1;
        }
        let a1 = first_counts.get("a1").copied().unwrap_or(0);
        let a2 = first_counts.get("a2").copied().unwrap_or(0);
        assert!(a1 > 800, "a1 chosen first {a1} times");
        assert!(a2 > 20, "a2 chosen first {a2} times");
    }

    #[test]
    fn embeddings_sequence_orders_by_tier_then_weight() {
        let mut profile = profile();
        profile.embeddings_tiers = vec![
            EmbeddingsTier {
                order: 2,
                model: "embed-fallback".to_string(),
                endpoints: vec![TierEndpoint {
                    endpoint_key: "b1".to_string(),
                    weight: 1.0,
                }],
            },
            EmbeddingsTier {
                order: 1,
                model: "embed-main".to_string(),
                endpoints: vec![
                    TierEndpoint {
                        endpoint_key: "a2".to_string(),
                        weight: 0.2,
                    },
                    TierEndpoint {
                        endpoint_key: "a1".to_string(),
                        weight: 0.8,
                    },
                ],
            },
        ];

        let seq = profile.embeddings_sequence();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq[0].0, "embed-main");
        assert_eq!(seq[0].1.endpoint.key, "a1");
        assert_eq!(seq[1].1.endpoint.key, "a2");
        assert_eq!(seq[2].0, "embed-fallback");
    }

    #[test]
    fn no_matching_range_yields_empty_sequence() {
        let mut profile = profile();
        profile.token_ranges.clear();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(profile
            .completion_sequence(1000, PreferredTier::Standard, &mut rng)
            .is_empty());
    }
}
