// JSON digest: fixed-width structural summary of an arbitrary JSON value.
//
// The digest answers one question for the model: can this payload be parsed
// directly, or does it need normalization or manual inspection first?

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::human_bytes;

const CONSISTENCY_EXCELLENT: f64 = 0.95;
const CONSISTENCY_GOOD: f64 = 0.80;
const CONSISTENCY_FAIR: f64 = 0.60;
const CONSISTENCY_POOR: f64 = 0.40;

const SPARSITY_DENSE: f64 = 0.05;
const SPARSITY_NORMAL: f64 = 0.15;
const SPARSITY_SPARSE: f64 = 0.30;

const DEPTH_MODERATE: usize = 5;
const DEPTH_DEEP: usize = 10;

const MAX_KEYS_TRACK: usize = 1000;
const MAX_ARRAY_SAMPLE: usize = 100;
const MAX_PATH_DEPTH: usize = 50;
const MAX_SAMPLE_VALUE_LEN: usize = 80;

fn re_semantic() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9]*([A-Z][a-z0-9]*)*$|^[a-z][a-z0-9]*(_[a-z0-9]+)*$")
            .expect("valid regex")
    })
}

fn re_numeric_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^.*[_-]?\d+$").expect("valid regex"))
}

fn re_opaque() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-fA-F0-9]{8,}$|^[A-Za-z0-9+/=]{16,}$|^[a-zA-Z0-9]{12,}$")
            .expect("valid regex")
    })
}

fn re_camel() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+([A-Z][a-z0-9]*)*$").expect("valid regex"))
}

fn re_pascal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][a-z0-9]*([A-Z][a-z0-9]*)*$").expect("valid regex"))
}

/// Structural summary of a JSON value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonDigest {
    pub bytes_raw: usize,
    pub bytes_data: usize,
    pub density: f64,
    pub depth_max: usize,
    pub depth_avg: f64,
    pub breadth_max: usize,
    pub root_type: String,
    pub type_distribution: String,
    pub total_values: usize,
    pub total_keys: usize,
    pub total_arrays: usize,
    pub total_objects: usize,
    pub key_style: String,
    pub key_convention: String,
    pub top_keys: String,
    pub array_consistency: f64,
    pub array_consistency_verdict: String,
    pub dominant_array_type: String,
    pub sparsity: f64,
    pub sparsity_verdict: String,
    pub hotspot_path: String,
    pub hotspot_pct: f64,
    pub schema_hint: String,
    pub verdict: String,
    pub action: String,
    pub flags: String,
    pub sample_path: String,
    pub sample_value: String,
}

impl JsonDigest {
    /// One-line form for logs and step descriptions
    pub fn summary_line(&self) -> String {
        let mut parts = vec![
            format!("root={}", self.root_type),
            format!("verdict={}", self.verdict),
            format!("action={}", self.action),
            format!("consistency={:.2}", self.array_consistency),
            format!("sparsity={:.2}", self.sparsity),
            format!("keys={}", self.key_style),
        ];
        if !self.flags.is_empty() {
            parts.push(format!("flags={}", self.flags));
        }
        parts.join(" ")
    }

    /// Render for prompt inclusion
    pub fn to_prompt(&self) -> String {
        let flags_line = if self.flags.is_empty() {
            String::new()
        } else {
            format!("flags: {}", self.flags)
        };
        format!(
            "<json_digest>\n\
             size: {} raw, {} data ({:.0}% density)\n\
             shape: {} | depth: {} (avg {:.1}) | breadth: {}\n\
             counts: {} values, {} unique keys, {} arrays, {} objects\n\
             types: {}\n\
             keys: {} ({}) | top: {}\n\
             arrays: {} consistency ({:.0}%) | contains: {}\n\
             sparsity: {} ({:.0}% null/empty)\n\
             hotspot: {} ({:.0}% of data)\n\
             schema: {}\n\
             VERDICT: {} -> {}\n\
             {}\n\
             sample: {} = {}\n\
             </json_digest>",
            human_bytes(self.bytes_raw),
            human_bytes(self.bytes_data),
            self.density * 100.0,
            self.root_type,
            self.depth_max,
            self.depth_avg,
            self.breadth_max,
            self.total_values,
            self.total_keys,
            self.total_arrays,
            self.total_objects,
            self.type_distribution,
            self.key_style,
            self.key_convention,
            self.top_keys,
            self.array_consistency_verdict,
            self.array_consistency * 100.0,
            self.dominant_array_type,
            self.sparsity_verdict,
            self.sparsity * 100.0,
            self.hotspot_path,
            self.hotspot_pct * 100.0,
            self.schema_hint,
            self.verdict,
            self.action,
            flags_line,
            self.sample_path,
            self.sample_value,
        )
    }
}

// ============================================================================
// Traversal
// ============================================================================

struct ArrayInfo {
    path: String,
    length: usize,
    element_sigs: Vec<String>,
    element_types: HashMap<String, usize>,
}

#[derive(Default)]
struct TraversalStats {
    max_depth: usize,
    depth_sum: usize,
    leaf_count: usize,
    max_breadth: usize,
    type_counts: HashMap<&'static str, usize>,
    key_counts: Vec<(String, usize)>,
    key_index: HashMap<String, usize>,
    key_styles: HashMap<&'static str, usize>,
    naming_conventions: HashMap<&'static str, usize>,
    arrays: Vec<ArrayInfo>,
    array_count: usize,
    object_count: usize,
    null_count: usize,
    empty_string_count: usize,
    empty_array_count: usize,
    empty_object_count: usize,
    data_chars: usize,
    best_sample_path: String,
    best_sample_value: String,
    best_sample_score: i64,
    flags: BTreeSet<&'static str>,
}

impl TraversalStats {
    fn new() -> Self {
        Self {
            best_sample_score: -1,
            ..Default::default()
        }
    }

    fn bump_type(&mut self, name: &'static str) {
        *self.type_counts.entry(name).or_insert(0) += 1;
    }

    fn type_count(&self, name: &str) -> usize {
        self.type_counts.get(name).copied().unwrap_or(0)
    }

    fn count_key(&mut self, key: &str) {
        if let Some(&idx) = self.key_index.get(key) {
            self.key_counts[idx].1 += 1;
        } else if self.key_counts.len() < MAX_KEYS_TRACK {
            self.key_index.insert(key.to_string(), self.key_counts.len());
            self.key_counts.push((key.to_string(), 1));
        }
    }

    fn maybe_update_sample(&mut self, path: &str, value: &str, depth: usize) {
        let mut score = depth as i64;
        if !value.is_empty() && value != "null" && value != "true" && value != "false" {
            score += 2;
        }
        if value.len() > 10 {
            score += 1;
        }
        if score > self.best_sample_score {
            self.best_sample_score = score;
            self.best_sample_path = path.to_string();
            self.best_sample_value = value.chars().take(MAX_SAMPLE_VALUE_LEN).collect();
        }
    }
}

fn sample_indices(length: usize, max_sample: usize) -> BTreeSet<usize> {
    if length <= max_sample {
        return (0..length).collect();
    }
    let step = length as f64 / max_sample as f64;
    (0..max_sample).map(|i| (i as f64 * step) as usize).collect()
}

fn analyze_key(key: &str, stats: &mut TraversalStats) {
    let style = if re_opaque().is_match(key) {
        "opaque"
    } else if key.len() == 1 && key.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        "single_char"
    } else if re_numeric_suffix().is_match(key) {
        "numeric_suffix"
    } else if re_semantic().is_match(key) {
        "semantic"
    } else {
        "other"
    };
    *stats.key_styles.entry(style).or_insert(0) += 1;

    let convention = if key.contains('_') && key == key.to_lowercase() {
        "snake_case"
    } else if re_camel().is_match(key) {
        "camelCase"
    } else if re_pascal().is_match(key) {
        "PascalCase"
    } else if key == key.to_uppercase() && key.len() > 1 {
        "UPPER_CASE"
    } else {
        "other"
    };
    *stats.naming_conventions.entry(convention).or_insert(0) += 1;
}

fn traverse(node: &Value, stats: &mut TraversalStats, path: &str, depth: usize) -> String {
    if depth > MAX_PATH_DEPTH {
        stats.flags.insert("extremely_deep");
        return "truncated".to_string();
    }
    stats.max_depth = stats.max_depth.max(depth);

    match node {
        Value::Null => {
            stats.bump_type("null");
            stats.null_count += 1;
            stats.depth_sum += depth;
            stats.leaf_count += 1;
            stats.maybe_update_sample(path, "null", depth);
            "null".to_string()
        }
        Value::Bool(b) => {
            stats.bump_type("boolean");
            stats.depth_sum += depth;
            stats.leaf_count += 1;
            stats.maybe_update_sample(path, if *b { "true" } else { "false" }, depth);
            "bool".to_string()
        }
        Value::Number(n) => {
            stats.bump_type("number");
            stats.depth_sum += depth;
            stats.leaf_count += 1;
            let rendered = n.to_string();
            stats.data_chars += rendered.len();
            stats.maybe_update_sample(path, &rendered, depth);
            "number".to_string()
        }
        Value::String(s) => {
            stats.bump_type("string");
            stats.depth_sum += depth;
            stats.leaf_count += 1;
            stats.data_chars += s.len();
            if s.is_empty() {
                stats.empty_string_count += 1;
            }
            stats.maybe_update_sample(path, s, depth);
            "string".to_string()
        }
        Value::Object(map) => {
            stats.bump_type("object");
            stats.object_count += 1;
            stats.max_breadth = stats.max_breadth.max(map.len());

            if map.is_empty() {
                stats.empty_object_count += 1;
                return "{}".to_string();
            }

            for key in map.keys() {
                stats.count_key(key);
                analyze_key(key, stats);
            }

            let mut child_sigs: Vec<String> = Vec::with_capacity(map.len());
            for (key, value) in map {
                let child_path = format!("{path}.{key}");
                let sig = traverse(value, stats, &child_path, depth + 1);
                child_sigs.push(format!("{key}:{sig}"));
            }
            child_sigs.sort();
            child_sigs.truncate(10);
            format!("{{{}}}", child_sigs.join(","))
        }
        Value::Array(items) => {
            stats.bump_type("array");
            stats.array_count += 1;
            stats.max_breadth = stats.max_breadth.max(items.len());

            if items.is_empty() {
                stats.empty_array_count += 1;
                return "[]".to_string();
            }

            let sampled = sample_indices(items.len(), MAX_ARRAY_SAMPLE);
            let mut info = ArrayInfo {
                path: path.to_string(),
                length: items.len(),
                element_sigs: Vec::new(),
                element_types: HashMap::new(),
            };

            for (i, item) in items.iter().enumerate() {
                let child_path = format!("{path}[{i}]");
                let sig = traverse(item, stats, &child_path, depth + 1);
                if sampled.contains(&i) {
                    let base_type = sig
                        .split('{')
                        .next()
                        .unwrap_or("")
                        .split('[')
                        .next()
                        .unwrap_or("")
                        .to_string();
                    *info.element_types.entry(base_type).or_insert(0) += 1;
                    info.element_sigs.push(sig);
                }
            }

            let signature = if info.element_sigs.is_empty() {
                "[]".to_string()
            } else {
                let dominant = most_common(&info.element_types).unwrap_or_default();
                format!("[{dominant}*{}]", items.len())
            };
            stats.arrays.push(info);
            signature
        }
    }
}

fn most_common(counts: &HashMap<String, usize>) -> Option<String> {
    counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(k, _)| k.clone())
}

// ============================================================================
// Digest construction
// ============================================================================

fn classify_root(data: &Value) -> &'static str {
    match data {
        Value::Object(_) => "object",
        Value::Array(items) => {
            if items.is_empty() {
                return "empty_array";
            }
            let head = &items[..items.len().min(10)];
            if head.iter().all(|v| v.is_object()) {
                "array_of_objects"
            } else if head.iter().all(|v| v.is_array()) {
                "array_of_arrays"
            } else if head.iter().all(|v| !v.is_object() && !v.is_array()) {
                "array_of_scalars"
            } else {
                "array_mixed"
            }
        }
        _ => "scalar",
    }
}

fn compact_type_distribution(stats: &TraversalStats) -> String {
    let total = stats.type_counts.values().sum::<usize>().max(1) as f64;
    let mut parts = Vec::new();
    for (label, name) in [
        ("str", "string"),
        ("num", "number"),
        ("bool", "boolean"),
        ("null", "null"),
        ("obj", "object"),
        ("arr", "array"),
    ] {
        let frac = stats.type_count(name) as f64 / total;
        if frac > 0.01 {
            parts.push(format!("{label}:{:.0}%", frac * 100.0));
        }
    }
    parts.join(" ")
}

fn determine_key_style(stats: &TraversalStats) -> &'static str {
    let total: usize = stats.key_styles.values().sum();
    if total == 0 {
        return "none";
    }
    let semantic = stats.key_styles.get("semantic").copied().unwrap_or(0);
    let opaque = stats.key_styles.get("opaque").copied().unwrap_or(0);
    if semantic as f64 / total as f64 > 0.7 {
        "semantic"
    } else if opaque as f64 / total as f64 > 0.3 {
        "opaque"
    } else {
        "mixed"
    }
}

fn determine_naming_convention(stats: &TraversalStats) -> String {
    if stats.naming_conventions.is_empty() {
        return "unknown".to_string();
    }
    let total: usize = stats.naming_conventions.values().sum();
    let (name, count) = stats
        .naming_conventions
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(k, v)| (*k, *v))
        .unwrap_or(("unknown", 0));
    if count as f64 / total as f64 > 0.6 {
        name.to_string()
    } else {
        "mixed".to_string()
    }
}

fn top_keys(stats: &TraversalStats) -> String {
    if stats.key_counts.is_empty() {
        return "none".to_string();
    }
    let mut sorted: Vec<&(String, usize)> = stats.key_counts.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted
        .iter()
        .take(5)
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn analyze_array_consistency(stats: &TraversalStats) -> (f64, &'static str, String) {
    let non_empty: Vec<&ArrayInfo> = stats
        .arrays
        .iter()
        .filter(|a| !a.element_sigs.is_empty())
        .collect();
    if non_empty.is_empty() {
        return (1.0, "n/a", "none".to_string());
    }

    let mut consistencies = Vec::new();
    let mut all_types: HashMap<String, usize> = HashMap::new();
    for arr in &non_empty {
        for (t, c) in &arr.element_types {
            *all_types.entry(t.clone()).or_insert(0) += c;
        }
        let mut sig_counts: HashMap<&str, usize> = HashMap::new();
        for sig in &arr.element_sigs {
            *sig_counts.entry(sig).or_insert(0) += 1;
        }
        if let Some(max_count) = sig_counts.values().max() {
            consistencies.push(*max_count as f64 / arr.element_sigs.len() as f64);
        }
    }

    let avg = if consistencies.is_empty() {
        1.0
    } else {
        consistencies.iter().sum::<f64>() / consistencies.len() as f64
    };

    let verdict = if avg >= CONSISTENCY_EXCELLENT {
        "excellent"
    } else if avg >= CONSISTENCY_GOOD {
        "good"
    } else if avg >= CONSISTENCY_FAIR {
        "fair"
    } else if avg >= CONSISTENCY_POOR {
        "poor"
    } else {
        "chaotic"
    };

    let dominant = most_common(&all_types).unwrap_or_else(|| "none".to_string());
    (avg, verdict, dominant)
}

fn classify_sparsity(sparsity: f64) -> &'static str {
    if sparsity <= SPARSITY_DENSE {
        "dense"
    } else if sparsity <= SPARSITY_NORMAL {
        "normal"
    } else if sparsity <= SPARSITY_SPARSE {
        "sparse"
    } else {
        "very_sparse"
    }
}

fn find_hotspot(stats: &TraversalStats, total_values: usize) -> (String, f64) {
    match stats.arrays.iter().max_by_key(|a| a.length) {
        Some(largest) => (
            largest.path.clone(),
            largest.length as f64 / total_values.max(1) as f64,
        ),
        None => ("$".to_string(), 1.0),
    }
}

fn infer_schema_hint(data: &Value, root_type: &str) -> String {
    match root_type {
        "array_of_objects" => {
            if let Value::Array(items) = data {
                if let Some(Value::Object(first)) = items.first() {
                    let keys: Vec<&str> = first.keys().take(5).map(|k| k.as_str()).collect();
                    return format!("{{{}, ...}}[]", keys.join(", "));
                }
            }
            root_type.to_string()
        }
        "object" => {
            if let Value::Object(map) = data {
                let keys: Vec<&str> = map.keys().take(5).map(|k| k.as_str()).collect();
                return format!("{{{}, ...}}", keys.join(", "));
            }
            root_type.to_string()
        }
        "array_of_scalars" => "scalar[]".to_string(),
        "array_of_arrays" => "[][]".to_string(),
        other => other.to_string(),
    }
}

fn determine_verdict(
    array_consistency: f64,
    sparsity: f64,
    key_style: &str,
    stats: &TraversalStats,
) -> (&'static str, &'static str) {
    if array_consistency < CONSISTENCY_POOR {
        return ("chaotic", "inspect_manually");
    }
    if array_consistency < CONSISTENCY_FAIR {
        return ("messy", "normalize_first");
    }

    let mut score = 0.0;
    score += array_consistency * 0.4;
    score += (1.0 - sparsity.min(1.0)) * 0.2;

    score += match key_style {
        "semantic" => 0.2,
        "mixed" => 0.1,
        "opaque" => 0.05,
        _ => 0.0,
    };

    if stats.max_depth <= DEPTH_MODERATE {
        score += 0.1;
    } else if stats.max_depth <= DEPTH_DEEP {
        score += 0.05;
    }

    if stats.flags.is_empty() {
        score += 0.1;
    }

    if score >= 0.75 {
        ("structured", "parse_directly")
    } else if score >= 0.55 {
        ("usable", "parse_with_care")
    } else if score >= 0.35 {
        ("messy", "normalize_first")
    } else {
        ("chaotic", "inspect_manually")
    }
}

fn compile_flags(stats: &TraversalStats, max_depth: usize, array_consistency: f64) -> String {
    let mut flags: Vec<&str> = stats.flags.iter().copied().collect();
    if max_depth > DEPTH_DEEP {
        flags.push("deep_nesting");
    }
    if array_consistency < CONSISTENCY_POOR {
        flags.push("inconsistent_arrays");
    }
    if stats.empty_array_count + stats.empty_object_count > 10 {
        flags.push("many_empties");
    }
    if stats.object_count > 0 && stats.key_counts.len() / stats.object_count > 20 {
        flags.push("high_key_variety");
    }
    flags.join(",")
}

fn truncate_sample(value: &str) -> String {
    if value.chars().count() <= MAX_SAMPLE_VALUE_LEN {
        if value.starts_with('"') {
            value.to_string()
        } else {
            format!("\"{}\"", value)
        }
    } else {
        let head: String = value.chars().take(MAX_SAMPLE_VALUE_LEN - 3).collect();
        format!("\"{}...\"", head)
    }
}

fn empty_digest(bytes_raw: usize) -> JsonDigest {
    JsonDigest {
        bytes_raw,
        bytes_data: 0,
        density: 0.0,
        depth_max: 0,
        depth_avg: 0.0,
        breadth_max: 0,
        root_type: "empty".to_string(),
        type_distribution: String::new(),
        total_values: 0,
        total_keys: 0,
        total_arrays: 0,
        total_objects: 0,
        key_style: "none".to_string(),
        key_convention: "none".to_string(),
        top_keys: "none".to_string(),
        array_consistency: 1.0,
        array_consistency_verdict: "n/a".to_string(),
        dominant_array_type: "none".to_string(),
        sparsity: 0.0,
        sparsity_verdict: "n/a".to_string(),
        hotspot_path: "$".to_string(),
        hotspot_pct: 0.0,
        schema_hint: "empty".to_string(),
        verdict: "minimal".to_string(),
        action: "skip".to_string(),
        flags: "empty".to_string(),
        sample_path: "$".to_string(),
        sample_value: "null".to_string(),
    }
}

fn error_digest(error: &str, bytes_raw: usize) -> JsonDigest {
    let mut truncated = error.to_string();
    truncated.truncate(50);
    JsonDigest {
        bytes_raw,
        bytes_data: 0,
        density: 0.0,
        depth_max: 0,
        depth_avg: 0.0,
        breadth_max: 0,
        root_type: "invalid".to_string(),
        type_distribution: String::new(),
        total_values: 0,
        total_keys: 0,
        total_arrays: 0,
        total_objects: 0,
        key_style: "none".to_string(),
        key_convention: "none".to_string(),
        top_keys: "none".to_string(),
        array_consistency: 0.0,
        array_consistency_verdict: "n/a".to_string(),
        dominant_array_type: "none".to_string(),
        sparsity: 0.0,
        sparsity_verdict: "n/a".to_string(),
        hotspot_path: "$".to_string(),
        hotspot_pct: 0.0,
        schema_hint: "invalid".to_string(),
        verdict: "chaotic".to_string(),
        action: "skip".to_string(),
        flags: "parse_error".to_string(),
        sample_path: "$".to_string(),
        sample_value: format!("error: {truncated}"),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Digest a parsed JSON value. `raw_json` supplies the original byte length
/// when the caller already has the serialized form.
pub fn digest_json(data: &Value, raw_json: Option<&str>) -> JsonDigest {
    let bytes_raw = match raw_json {
        Some(raw) => raw.len(),
        None => data.to_string().len(),
    };

    let is_empty = match data {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    };
    if is_empty {
        return empty_digest(bytes_raw);
    }

    let mut stats = TraversalStats::new();
    traverse(data, &mut stats, "$", 0);

    let root_type = classify_root(data);
    let type_distribution = compact_type_distribution(&stats);
    let key_style = determine_key_style(&stats);
    let key_convention = determine_naming_convention(&stats);
    let top = top_keys(&stats);
    let (array_consistency, array_verdict, dominant_array_type) = analyze_array_consistency(&stats);

    let total_values = stats.leaf_count;
    let empty_count = stats.null_count + stats.empty_string_count;
    let sparsity = empty_count as f64 / total_values.max(1) as f64;
    let sparsity_verdict = classify_sparsity(sparsity);

    let bytes_data = stats.data_chars;
    let density = bytes_data as f64 / bytes_raw.max(1) as f64;
    let depth_avg = stats.depth_sum as f64 / stats.leaf_count.max(1) as f64;
    let (hotspot_path, hotspot_pct) = find_hotspot(&stats, total_values);
    let schema_hint = infer_schema_hint(data, root_type);
    let (verdict, action) = determine_verdict(array_consistency, sparsity, key_style, &stats);
    let flags = compile_flags(&stats, stats.max_depth, array_consistency);

    JsonDigest {
        bytes_raw,
        bytes_data,
        density: round3(density),
        depth_max: stats.max_depth,
        depth_avg: round2(depth_avg),
        breadth_max: stats.max_breadth,
        root_type: root_type.to_string(),
        type_distribution,
        total_values,
        total_keys: stats.key_counts.len(),
        total_arrays: stats.array_count,
        total_objects: stats.object_count,
        key_style: key_style.to_string(),
        key_convention,
        top_keys: top,
        array_consistency: round3(array_consistency),
        array_consistency_verdict: array_verdict.to_string(),
        dominant_array_type,
        sparsity: round3(sparsity),
        sparsity_verdict: sparsity_verdict.to_string(),
        hotspot_path,
        hotspot_pct: round3(hotspot_pct),
        schema_hint,
        verdict: verdict.to_string(),
        action: action.to_string(),
        flags,
        sample_path: if stats.best_sample_path.is_empty() {
            "$".to_string()
        } else {
            stats.best_sample_path
        },
        sample_value: truncate_sample(&stats.best_sample_value),
    }
}

/// Digest a JSON string, producing an error digest when it does not parse
pub fn digest_json_string(json_string: &str) -> JsonDigest {
    match serde_json::from_str::<Value>(json_string) {
        Ok(data) => digest_json(&data, Some(json_string)),
        Err(err) => error_digest(&err.to_string(), json_string.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_inputs_produce_minimal_digest() {
        for value in [json!(null), json!({}), json!([])] {
            let digest = digest_json(&value, None);
            assert_eq!(digest.verdict, "minimal");
            assert_eq!(digest.action, "skip");
        }
    }

    #[test]
    fn invalid_json_produces_parse_error_digest() {
        let digest = digest_json_string("{not json");
        assert_eq!(digest.root_type, "invalid");
        assert_eq!(digest.flags, "parse_error");
        assert_eq!(digest.action, "skip");
    }

    #[test]
    fn uniform_array_of_objects_is_structured() {
        let rows: Vec<Value> = (0..40)
            .map(|i| json!({"id": i, "name": format!("item {i}"), "price": i * 10}))
            .collect();
        let digest = digest_json(&json!(rows), None);

        assert_eq!(digest.root_type, "array_of_objects");
        assert_eq!(digest.verdict, "structured");
        assert_eq!(digest.action, "parse_directly");
        assert!(digest.array_consistency >= CONSISTENCY_EXCELLENT);
        assert_eq!(digest.key_style, "semantic");
        assert_eq!(digest.key_convention, "camelCase"); // bare lowercase words match the camel pattern
        assert_eq!(digest.schema_hint, "{id, name, price, ...}[]");
    }

    #[test]
    fn mixed_arrays_score_poorly() {
        let chaos = json!([
            1, "two", {"a": 1}, [3], null, true,
            {"b": {"c": "deep"}}, "x", 9.5, [1, 2],
        ]);
        let digest = digest_json(&chaos, None);
        assert!(digest.array_consistency < CONSISTENCY_GOOD);
        assert!(matches!(digest.verdict.as_str(), "messy" | "chaotic"));
    }

    #[test]
    fn sparsity_counts_nulls_and_empty_strings() {
        let sparse = json!({
            "a": null, "b": null, "c": "", "d": null,
            "e": "value", "f": null,
        });
        let digest = digest_json(&sparse, None);
        assert_eq!(digest.sparsity_verdict, "very_sparse");
        assert!(digest.sparsity > 0.5);
    }

    #[test]
    fn hotspot_is_largest_array() {
        let data = json!({
            "meta": {"page": 1},
            "results": (0..50).map(|i| json!({"i": i})).collect::<Vec<_>>(),
            "tags": ["a", "b"],
        });
        let digest = digest_json(&data, None);
        assert_eq!(digest.hotspot_path, "$.results");
        assert!(digest.hotspot_pct > 0.4);
    }

    #[test]
    fn digest_is_deterministic() {
        let data = json!({
            "users": (0..25).map(|i| json!({"id": i, "email": format!("u{i}@example.com")})).collect::<Vec<_>>(),
            "total": 25,
        });
        let a = digest_json(&data, None);
        let b = digest_json(&data, None);
        assert_eq!(a, b);
        assert_eq!(a.to_prompt(), b.to_prompt());
    }

    #[test]
    fn snake_case_convention_detected() {
        let data = json!({
            "user_id": 1, "first_name": "a", "last_name": "b",
            "created_at": "2025-01-01", "is_active": true,
        });
        let digest = digest_json(&data, None);
        assert_eq!(digest.key_convention, "snake_case");
    }

    #[test]
    fn camel_case_convention_detected() {
        let data = json!({
            "userId": 1, "firstName": "a", "lastName": "b", "createdAt": "x",
        });
        let digest = digest_json(&data, None);
        assert_eq!(digest.key_convention, "camelCase");
    }

    #[test]
    fn opaque_keys_detected() {
        let data = json!({
            "a1b2c3d4e5f60718": 1,
            "deadbeefcafe1234": 2,
            "0123456789abcdef": 3,
        });
        let digest = digest_json(&data, None);
        assert_eq!(digest.key_style, "opaque");
    }

    #[test]
    fn deep_nesting_flagged() {
        let mut value = json!("leaf");
        for _ in 0..12 {
            value = json!({"nested": value});
        }
        let digest = digest_json(&value, None);
        assert!(digest.flags.contains("deep_nesting"));
    }

    #[test]
    fn prompt_rendering_contains_verdict() {
        let digest = digest_json(&json!({"key": "value"}), None);
        let prompt = digest.to_prompt();
        assert!(prompt.starts_with("<json_digest>"));
        assert!(prompt.contains("VERDICT:"));
        assert!(prompt.ends_with("</json_digest>"));
    }

    #[test]
    fn summary_line_is_compact() {
        let digest = digest_json(&json!({"key": "value"}), None);
        let line = digest.summary_line();
        assert!(line.contains("verdict="));
        assert!(line.contains("action="));
        assert!(!line.contains('\n'));
    }
}
