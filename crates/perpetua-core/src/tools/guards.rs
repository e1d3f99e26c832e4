// Parameter guards: plug-in validation that runs before a tool handler.
//
// Guards run in registration order; the first rejection wins. A guard that
// panics internally must not take the dispatcher down, so validation is
// plain synchronous code over the params value.

use serde_json::Value;

use crate::config::ToolPlanSettings;

/// Rejection returned by a guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRejection {
    pub message: String,
}

/// Guard validating tool parameters before execution
pub trait ParamGuard: Send + Sync {
    /// Whether this guard applies to the tool
    fn matches(&self, tool_name: &str) -> bool;

    /// Return a rejection to block the call, or None to allow it
    fn validate(&self, params: &Value, settings: &ToolPlanSettings) -> Option<GuardRejection>;
}

/// Registry of guards, evaluated in registration order
#[derive(Default)]
pub struct GuardRegistry {
    guards: Vec<Box<dyn ParamGuard>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in guards
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(PdfUrlGuard);
        registry.register(BatchQueryLimitGuard);
        registry
    }

    pub fn register(&mut self, guard: impl ParamGuard + 'static) {
        self.guards.push(Box::new(guard));
    }

    pub fn validate(
        &self,
        tool_name: &str,
        params: &Value,
        settings: &ToolPlanSettings,
    ) -> Option<GuardRejection> {
        for guard in &self.guards {
            if guard.matches(tool_name) {
                if let Some(rejection) = guard.validate(params, settings) {
                    return Some(rejection);
                }
            }
        }
        None
    }
}

// ============================================================================
// Built-in guards
// ============================================================================

const URL_STRING_KEYS: [&str; 4] = ["url", "link", "page", "target_url"];
const URL_LIST_KEYS: [&str; 5] = ["urls", "links", "pages", "targets", "target_urls"];

fn candidate_urls(params: &Value) -> Vec<&str> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    let mut urls = Vec::new();
    for (key, value) in map {
        if URL_STRING_KEYS.contains(&key.as_str()) {
            if let Some(url) = value.as_str() {
                urls.push(url);
            }
        } else if URL_LIST_KEYS.contains(&key.as_str()) {
            if let Some(list) = value.as_array() {
                urls.extend(list.iter().filter_map(|v| v.as_str()));
            }
        }
    }
    urls
}

fn is_pdf_url(url: &str) -> bool {
    let path = url
        .split('?')
        .next()
        .unwrap_or(url)
        .split('#')
        .next()
        .unwrap_or(url);
    path.to_lowercase().ends_with(".pdf")
}

/// Reject scrape calls for PDF URLs; the snapshot pipeline cannot render them
pub struct PdfUrlGuard;

impl ParamGuard for PdfUrlGuard {
    fn matches(&self, tool_name: &str) -> bool {
        matches!(tool_name, "scrape_as_markdown" | "scrape_as_html")
    }

    fn validate(&self, params: &Value, _settings: &ToolPlanSettings) -> Option<GuardRejection> {
        if candidate_urls(params).iter().any(|u| is_pdf_url(u)) {
            Some(GuardRejection {
                message: "PDF scraping is not supported for page snapshots. \
                          Use spawn_web_task to read PDFs instead."
                    .to_string(),
            })
        } else {
            None
        }
    }
}

/// Enforce the per-plan query limit for batch search
pub struct BatchQueryLimitGuard;

impl ParamGuard for BatchQueryLimitGuard {
    fn matches(&self, tool_name: &str) -> bool {
        tool_name == "search_engine_batch"
    }

    fn validate(&self, params: &Value, settings: &ToolPlanSettings) -> Option<GuardRejection> {
        let queries = params.get("queries")?.as_array()?;
        let limit = settings.batch_query_limit;
        if limit == 0 {
            return None;
        }
        if queries.len() > limit as usize {
            Some(GuardRejection {
                message: format!(
                    "Maximum number of queries ({limit}) exceeded for search_engine_batch; \
                     received {}.",
                    queries.len()
                ),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> ToolPlanSettings {
        ToolPlanSettings::default()
    }

    #[test]
    fn pdf_guard_blocks_pdf_urls() {
        let registry = GuardRegistry::with_builtins();
        let rejection = registry.validate(
            "scrape_as_markdown",
            &json!({"url": "https://example.com/report.PDF"}),
            &settings(),
        );
        assert!(rejection.is_some());
        assert!(rejection.unwrap().message.contains("PDF"));
    }

    #[test]
    fn pdf_guard_checks_url_lists() {
        let registry = GuardRegistry::with_builtins();
        let rejection = registry.validate(
            "scrape_as_html",
            &json!({"urls": ["https://a.example.com/ok.html", "https://b.example.com/doc.pdf"]}),
            &settings(),
        );
        assert!(rejection.is_some());
    }

    #[test]
    fn pdf_guard_ignores_query_strings() {
        let registry = GuardRegistry::with_builtins();
        // .pdf only in the query string is fine
        assert!(registry
            .validate(
                "scrape_as_markdown",
                &json!({"url": "https://example.com/page?file=x.pdf"}),
                &settings(),
            )
            .is_none());
        // .pdf in the path is not
        assert!(registry
            .validate(
                "scrape_as_markdown",
                &json!({"url": "https://example.com/x.pdf?download=1"}),
                &settings(),
            )
            .is_some());
    }

    #[test]
    fn pdf_guard_only_matches_scrape_tools() {
        let registry = GuardRegistry::with_builtins();
        assert!(registry
            .validate(
                "search_engine",
                &json!({"url": "https://example.com/doc.pdf"}),
                &settings(),
            )
            .is_none());
    }

    #[test]
    fn batch_guard_enforces_plan_limit() {
        let registry = GuardRegistry::with_builtins();
        let mut settings = settings();
        settings.batch_query_limit = 3;

        let over = json!({"queries": ["a", "b", "c", "d"]});
        let rejection = registry.validate("search_engine_batch", &over, &settings);
        assert!(rejection.is_some());
        assert!(rejection.unwrap().message.contains("received 4"));

        let under = json!({"queries": ["a", "b"]});
        assert!(registry.validate("search_engine_batch", &under, &settings).is_none());
    }

    #[test]
    fn batch_guard_zero_limit_is_unlimited() {
        let registry = GuardRegistry::with_builtins();
        let mut settings = settings();
        settings.batch_query_limit = 0;
        let many: Vec<String> = (0..100).map(|i| format!("q{i}")).collect();
        assert!(registry
            .validate("search_engine_batch", &json!({"queries": many}), &settings)
            .is_none());
    }

    #[test]
    fn batch_guard_ignores_non_list_queries() {
        let registry = GuardRegistry::with_builtins();
        assert!(registry
            .validate("search_engine_batch", &json!({"queries": "single"}), &settings())
            .is_none());
    }
}
