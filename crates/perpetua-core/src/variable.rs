// Per-agent named variables.
//
// Variables let tools park large results out of the prompt and reference them
// later as `$name` inside tool params. Names are deterministic per tool call
// so repeated runs are idempotent. The store enforces the per-agent cap with
// LRU-by-created eviction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of variables retained per agent
pub const MAX_VARIABLES_PER_AGENT: usize = 50;

/// Whole-result variableization kicks in at this size
pub const DEFAULT_MIN_VARIABLE_BYTES: usize = 1024;

/// Maximum variable name length
pub const MAX_NAME_LEN: usize = 128;

/// Per-agent named immutable value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub value: String,
    pub is_json: bool,
    pub size_bytes: usize,
    pub tool_call_id: Option<Uuid>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVariable {
    pub name: String,
    pub value: String,
    pub is_json: bool,
    pub size_bytes: usize,
    pub tool_call_id: Option<Uuid>,
    pub summary: String,
}

impl NewVariable {
    pub fn from_value(
        name: impl Into<String>,
        value: &serde_json::Value,
        tool_call_id: Option<Uuid>,
        summary: impl Into<String>,
    ) -> Self {
        let (text, is_json, size_bytes) = serialize_value(value);
        Self {
            name: name.into(),
            value: text,
            is_json,
            size_bytes,
            tool_call_id,
            summary: summary.into(),
        }
    }
}

/// Serialize a JSON value for storage: strings are stored verbatim, everything
/// else is JSON-encoded with the is_json flag set.
pub fn serialize_value(value: &serde_json::Value) -> (String, bool, usize) {
    match value {
        serde_json::Value::String(s) => (s.clone(), false, s.len()),
        other => {
            let text = other.to_string();
            let size = text.len();
            (text, true, size)
        }
    }
}

/// Materialize the concrete value for a variable, parsing JSON when flagged.
/// Falls back to the raw text if the stored JSON no longer parses.
pub fn materialize_value(variable: &Variable) -> serde_json::Value {
    if !variable.is_json {
        return serde_json::Value::String(variable.value.clone());
    }
    serde_json::from_str(&variable.value).unwrap_or_else(|_| {
        tracing::debug!(name = %variable.name, "failed to decode JSON variable; returning raw text");
        serde_json::Value::String(variable.value.clone())
    })
}

/// Parse a `$name` reference. The whole string must be the reference;
/// no dotted paths or interpolation.
pub fn parse_reference(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    let name = trimmed.strip_prefix('$')?;
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return None;
    }
    if name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        Some(name)
    } else {
        None
    }
}

fn sanitize_part(part: &str) -> String {
    let mut cleaned = String::with_capacity(part.len());
    let mut last_was_sep = true;
    for ch in part.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            cleaned.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            cleaned.push('_');
            last_was_sep = true;
        }
    }
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        "var".to_string()
    } else {
        cleaned
    }
}

/// Create a deterministic variable name for a tool call.
///
/// Shape: `{sanitize(prefix or tool_name)}_{step_hex}_{sanitize(field or "result")}`,
/// lowercased and truncated to 128 characters.
pub fn generate_variable_name(
    tool_name: &str,
    step_id: Uuid,
    field: Option<&str>,
    prefix: Option<&str>,
) -> String {
    let base = prefix.filter(|p| !p.is_empty()).unwrap_or(tool_name);
    let base = if base.is_empty() { "var" } else { base };
    let field_suffix = field.filter(|f| !f.is_empty()).unwrap_or("result");
    let name = format!(
        "{}_{}_{}",
        sanitize_part(base).to_lowercase(),
        step_id.simple(),
        sanitize_part(field_suffix).to_lowercase()
    );
    name.chars().take(MAX_NAME_LEN).collect()
}

/// Render a short catalog string for prompt context: one line per variable
/// with approximate size and summary.
pub fn describe_variables(variables: &[Variable]) -> String {
    let mut lines = Vec::with_capacity(variables.len());
    for var in variables {
        let size_kb = var.size_bytes as f64 / 1024.0;
        let summary = if var.summary.is_empty() {
            if var.is_json {
                "JSON"
            } else {
                "Text"
            }
        } else {
            var.summary.as_str()
        };
        lines.push(format!("${} - {} (~{:.1} KB)", var.name, summary, size_kb));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_string_stays_verbatim() {
        let (text, is_json, size) = serialize_value(&json!("hello"));
        assert_eq!(text, "hello");
        assert!(!is_json);
        assert_eq!(size, 5);
    }

    #[test]
    fn serialize_object_is_json() {
        let (text, is_json, _) = serialize_value(&json!({"a": 1}));
        assert!(is_json);
        assert_eq!(serde_json::from_str::<serde_json::Value>(&text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn materialize_round_trips_json_values() {
        for value in [
            json!({"key": "val", "n": 2}),
            json!([1, 2, 3]),
            json!(42),
            json!(true),
            json!(null),
        ] {
            let new_var = NewVariable::from_value("v", &value, None, "");
            let var = Variable {
                id: Uuid::now_v7(),
                agent_id: Uuid::now_v7(),
                name: new_var.name,
                value: new_var.value,
                is_json: new_var.is_json,
                size_bytes: new_var.size_bytes,
                tool_call_id: None,
                summary: String::new(),
                created_at: Utc::now(),
            };
            assert_eq!(materialize_value(&var), value);
        }
    }

    #[test]
    fn parse_reference_accepts_full_refs_only() {
        assert_eq!(parse_reference("$result_a1"), Some("result_a1"));
        assert_eq!(parse_reference("  $with-dash  "), Some("with-dash"));
        assert_eq!(parse_reference("prefix $name"), None);
        assert_eq!(parse_reference("$bad.path"), None);
        assert_eq!(parse_reference("$"), None);
        assert_eq!(parse_reference("plain"), None);
    }

    #[test]
    fn generated_names_are_lowercase_and_deterministic() {
        let step_id = Uuid::now_v7();
        let a = generate_variable_name("Search Engine!", step_id, Some("Top URL"), None);
        let b = generate_variable_name("Search Engine!", step_id, Some("Top URL"), None);
        assert_eq!(a, b);
        assert!(a.len() <= MAX_NAME_LEN);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        assert!(a.starts_with("search_engine_"));
        assert!(a.ends_with("_top_url"));
    }

    #[test]
    fn generated_name_defaults_to_result_field() {
        let step_id = Uuid::now_v7();
        let name = generate_variable_name("scrape", step_id, None, None);
        assert!(name.ends_with("_result"));
    }

    #[test]
    fn generated_name_prefers_prefix() {
        let step_id = Uuid::now_v7();
        let name = generate_variable_name("scrape", step_id, None, Some("page"));
        assert!(name.starts_with("page_"));
    }

    #[test]
    fn empty_tool_name_falls_back() {
        let name = generate_variable_name("", Uuid::now_v7(), None, None);
        assert!(name.starts_with("var_"));
    }

    #[test]
    fn catalog_lists_one_line_per_variable() {
        let var = Variable {
            id: Uuid::now_v7(),
            agent_id: Uuid::now_v7(),
            name: "serp_items".to_string(),
            value: "{}".to_string(),
            is_json: true,
            size_bytes: 2048,
            tool_call_id: None,
            summary: "search_engine result".to_string(),
            created_at: Utc::now(),
        };
        let catalog = describe_variables(&[var]);
        assert!(catalog.contains("$serp_items"));
        assert!(catalog.contains("~2.0 KB"));
    }
}
