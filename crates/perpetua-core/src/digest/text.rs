// Text digest: statistical fingerprint of an opaque text blob.
//
// Entropy and index-of-coincidence place the blob on a compressed/prose/
// markup/encoded spectrum; character-class ratios and diagnostic patterns
// score it as prose/code/html/markdown/data/noise. The verdict tells the
// model whether to process, clean, extract, or skip.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const ENTROPY_PROSE_LO: f64 = 3.8;
const ENTROPY_PROSE_HI: f64 = 4.5;
const ENTROPY_INFORMAL_LO: f64 = 4.2;
const ENTROPY_INFORMAL_HI: f64 = 4.8;
const ENTROPY_CODE_LO: f64 = 4.4;
const ENTROPY_PURE_CODE_HI: f64 = 5.3;
const ENTROPY_MINIFIED_HI: f64 = 5.8;
const ENTROPY_BASE64_LO: f64 = 5.95;

const IC_ENGLISH_LO: f64 = 0.064;
const IC_ENGLISH_HI: f64 = 0.072;
const IC_INFORMAL_LO: f64 = 0.058;
const IC_INFORMAL_HI: f64 = 0.066;
const IC_CODE_VARS_LO: f64 = 0.048;
const IC_CODE_VARS_HI: f64 = 0.058;
const IC_CODE_TERSE_LO: f64 = 0.042;
const IC_CODE_TERSE_HI: f64 = 0.050;
const IC_MULTILINGUAL_LO: f64 = 0.042;
const IC_MULTILINGUAL_HI: f64 = 0.052;
const IC_RANDOM_HI: f64 = 0.042;

const MINIFIED_LINE_LEN: usize = 500;
const BOILERPLATE_UNIQUE_THRESHOLD: f64 = 0.70;
const SEVERE_BOILERPLATE_THRESHOLD: f64 = 0.40;

const TYPE_NAMES: [&str; 6] = ["prose", "code", "html", "markdown", "data", "noise"];

const HTML_CHARS: &str = "<>/\"'=";
const CODE_CHARS: &str = "{}();[]=>:";
const MD_CHARS: &str = "#*_`[]()>!";
const DATA_CHARS: &str = "{}[]\":,";

fn garbage_patterns() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?i)utm_source=",
            r"(?i)(?:__|ga|_gaq|gtag|fbq)\s*[(\[]",
            r"(?i)data:image/[^;]+;base64,",
            r"(?i)\.(?:woff2?|ttf|eot)\b",
            r"(?i)@keyframes\s+\w+",
            r"(?i)(?:cookie|gdpr|consent|privacy).{0,30}(?:accept|agree|policy)",
            r"(?i)(?:subscribe|newsletter|signup).{0,20}(?:email|inbox)",
            r"(?i)\\u[0-9a-fA-F]{4}",
            r"(?i)(?:prev|next|older|newer)\s*(?:post|page|article)",
            r"(?i)(?:share|tweet|pin)\s*(?:on|this|it)",
            r"(?i)all\s*rights?\s*reserved",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    })
}

fn quality_patterns() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?i)\b(?:because|therefore|however|although|furthermore|consequently)\b",
            r"(?i)\b(?:study|research|data|evidence|analysis|found|shows)\b",
            r"(?i)\b(?:first|second|third|finally|additionally|moreover)\b",
            r"(?i)\b\d{4}\b",
            r"(?:Dr\.|Prof\.|Ph\.?D|University|Institute)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    })
}

fn re_cached(pattern: &'static str, slot: &'static OnceLock<Regex>) -> &'static Regex {
    slot.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

macro_rules! cached_re {
    ($pattern:expr) => {{
        static SLOT: OnceLock<Regex> = OnceLock::new();
        re_cached($pattern, &SLOT)
    }};
}

/// Statistical fingerprint of a text blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDigest {
    pub chars: usize,
    pub lines: usize,
    pub entropy: f64,
    pub entropy_verdict: String,
    pub ic: f64,
    pub ic_verdict: String,
    pub alpha_pct: f64,
    pub digit_pct: f64,
    pub space_pct: f64,
    pub special_pct: f64,
    pub avg_line_len: usize,
    pub max_line_len: usize,
    pub unique_line_pct: f64,
    pub primary_type: String,
    pub confidence: f64,
    pub type_scores: String,
    pub info_density: f64,
    pub prose_quality: f64,
    pub garbage_pct: f64,
    pub boilerplate_pct: f64,
    pub verdict: String,
    pub action: String,
    pub flags: String,
    pub best_sample: String,
}

impl TextDigest {
    /// One-line form for logs and step descriptions
    pub fn summary_line(&self) -> String {
        let mut parts = vec![
            format!("type={}", self.primary_type),
            format!("conf={:.2}", self.confidence),
            format!("verdict={}", self.verdict),
            format!("action={}", self.action),
            format!("info={:.2}", self.info_density),
            format!("garbage={:.2}", self.garbage_pct),
            format!("boiler={:.2}", self.boilerplate_pct),
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
            "<digest>\n\
             {} chars | {} lines | avg_line: {} | max_line: {}\n\
             entropy: {:.2} -> {} | ic: {:.4} -> {}\n\
             chars: a:{:.0}% d:{:.0}% s:{:.0}% sp:{:.0}%\n\
             unique_lines: {:.0}% | boilerplate: {:.0}% | garbage: {:.0}%\n\
             type: {} ({:.0}%) | {}\n\
             quality: info_density={:.2} prose={:.2}\n\
             VERDICT: {} -> {}\n\
             {}\n\
             sample: \"{}\"\n\
             </digest>",
            self.chars,
            self.lines,
            self.avg_line_len,
            self.max_line_len,
            self.entropy,
            self.entropy_verdict,
            self.ic,
            self.ic_verdict,
            self.alpha_pct * 100.0,
            self.digit_pct * 100.0,
            self.space_pct * 100.0,
            self.special_pct * 100.0,
            self.unique_line_pct * 100.0,
            self.boilerplate_pct * 100.0,
            self.garbage_pct * 100.0,
            self.primary_type,
            self.confidence * 100.0,
            self.type_scores,
            self.info_density,
            self.prose_quality,
            self.verdict,
            self.action,
            flags_line,
            self.best_sample,
        )
    }
}

// ============================================================================
// Measurement helpers
// ============================================================================

/// Char-boundary-safe prefix of up to `n` characters
fn prefix_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn shannon_entropy(freq: &HashMap<char, usize>, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n_f = n as f64;
    let mut h = 0.0;
    for &count in freq.values() {
        let p = count as f64 / n_f;
        if p > 0.0 {
            h -= p * p.log2();
        }
    }
    h
}

fn index_of_coincidence(freq: &HashMap<char, usize>) -> f64 {
    let n: usize = freq.values().sum();
    if n < 2 {
        return 0.0;
    }
    let num: usize = freq.values().map(|&c| c * (c - 1)).sum();
    num as f64 / (n * (n - 1)) as f64
}

fn classify_entropy(h: f64) -> &'static str {
    if h < 3.8 {
        "compressed"
    } else if h <= 4.5 {
        "prose"
    } else if h <= 5.0 {
        "mixed"
    } else if h <= 5.4 {
        "markup"
    } else if h <= 5.8 {
        "minified"
    } else if h <= 6.1 {
        "encoded"
    } else {
        "noise"
    }
}

fn classify_ic(ic: f64) -> &'static str {
    if ic >= 0.062 {
        "english"
    } else if ic >= 0.048 {
        "code"
    } else if ic >= 0.040 {
        "mixed"
    } else {
        "random"
    }
}

// ============================================================================
// Type scoring
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn score_types(
    sample: &str,
    entropy: f64,
    ic: f64,
    alpha_r: f64,
    special_r: f64,
    html_r: f64,
    _code_r: f64,
    _md_r: f64,
    data_r: f64,
    _avg_line: usize,
    _max_line: usize,
    _unique_pct: f64,
) -> HashMap<&'static str, f64> {
    let mut scores: HashMap<&'static str, f64> =
        TYPE_NAMES.iter().map(|&name| (name, 0.0)).collect();

    // Prose signals
    if (ENTROPY_PROSE_LO..=ENTROPY_PROSE_HI).contains(&entropy) {
        *scores.entry("prose").or_insert(0.0) += 0.35;
    } else if (ENTROPY_INFORMAL_LO..=ENTROPY_INFORMAL_HI).contains(&entropy) {
        *scores.entry("prose").or_insert(0.0) += 0.20;
    }
    if (IC_ENGLISH_LO..=IC_ENGLISH_HI).contains(&ic) {
        *scores.entry("prose").or_insert(0.0) += 0.30;
    } else if (IC_INFORMAL_LO..=IC_INFORMAL_HI).contains(&ic) {
        *scores.entry("prose").or_insert(0.0) += 0.15;
    }
    if alpha_r >= 0.75 {
        *scores.entry("prose").or_insert(0.0) += 0.20;
    }
    if special_r <= 0.05 {
        *scores.entry("prose").or_insert(0.0) += 0.15;
    }

    // Code signals
    if (ENTROPY_CODE_LO..=ENTROPY_PURE_CODE_HI).contains(&entropy) {
        *scores.entry("code").or_insert(0.0) += 0.25;
    }
    if (IC_CODE_VARS_LO..=IC_CODE_VARS_HI).contains(&ic) {
        *scores.entry("code").or_insert(0.0) += 0.20;
    } else if (IC_CODE_TERSE_LO..=IC_CODE_TERSE_HI).contains(&ic) {
        *scores.entry("code").or_insert(0.0) += 0.15;
    }
    if (0.08..=0.18).contains(&special_r) {
        *scores.entry("code").or_insert(0.0) += 0.20;
    }

    let code_patterns = [
        cached_re!(r"(?m)\b(def|function|class|const|let|var|import|return)\b"),
        cached_re!(r"(?m)=>"),
        cached_re!(r"(?m)\{\s*$"),
        cached_re!(r"(?m);\s*$"),
    ];
    for pattern in code_patterns {
        if pattern.is_match(sample) {
            *scores.entry("code").or_insert(0.0) += 0.08;
        }
    }

    let indent_lines = sample
        .split('\n')
        .take(200)
        .filter(|line| line.starts_with(' ') || line.starts_with('\t'))
        .count();
    if indent_lines > 10 {
        *scores.entry("code").or_insert(0.0) += 0.15;
    }

    // HTML signals
    if html_r > 0.08 {
        *scores.entry("html").or_insert(0.0) += 0.30;
    } else if html_r > 0.04 {
        *scores.entry("html").or_insert(0.0) += 0.15;
    }

    let tag_count = cached_re!(r"<[a-zA-Z][^>]*>")
        .find_iter(prefix_chars(sample, 10000))
        .count();
    if tag_count > 20 {
        *scores.entry("html").or_insert(0.0) += 0.35;
    } else if tag_count > 5 {
        *scores.entry("html").or_insert(0.0) += 0.20;
    }

    let head = prefix_chars(sample, 500);
    if head.contains("<!DOCTYPE") || head.to_lowercase().contains("<html") {
        *scores.entry("html").or_insert(0.0) += 0.30;
    }

    // Markdown signals
    let md_sample = prefix_chars(sample, 10000);
    let md_patterns: [(&Regex, f64); 9] = [
        (cached_re!(r"(?m)^#{1,6}\s+\S"), 0.20),
        (cached_re!(r"(?m)^\s*[-*+]\s+\S"), 0.12),
        (cached_re!(r"(?m)\[.+\]\(.+\)"), 0.15),
        (cached_re!(r"(?m)^```"), 0.18),
        (cached_re!(r"(?m)^\s*>\s+\S"), 0.10),
        (cached_re!(r"(?m)\*\*[^*]+\*\*"), 0.12),
        (cached_re!(r"(?m)__[^_]+__"), 0.08),
        (cached_re!(r"(?m)\*[^*]+\*"), 0.06),
        (cached_re!(r"(?m)^\|.+\|$"), 0.10),
    ];
    for (pattern, weight) in md_patterns {
        if pattern.is_match(md_sample) {
            *scores.entry("markdown").or_insert(0.0) += weight;
        }
    }
    if sample.contains("```") {
        *scores.entry("markdown").or_insert(0.0) += 0.20;
        let code = scores.entry("code").or_insert(0.0);
        *code = (*code - 0.15).max(0.0);
    }

    // Data signals
    if data_r > 0.15 {
        *scores.entry("data").or_insert(0.0) += 0.25;
    }
    if cached_re!(r"^\s*[\[{]").is_match(prefix_chars(sample, 100))
        && cached_re!(r#""\w+"\s*:"#).is_match(prefix_chars(sample, 1000))
    {
        *scores.entry("data").or_insert(0.0) += 0.40;
    }

    let csv_lines: Vec<&str> = sample
        .split('\n')
        .take(20)
        .filter(|line| line.contains(','))
        .collect();
    if csv_lines.len() > 5 {
        let comma_counts: std::collections::BTreeSet<usize> = csv_lines
            .iter()
            .map(|line| line.matches(',').count())
            .collect();
        if comma_counts.len() <= 2 {
            *scores.entry("data").or_insert(0.0) += 0.35;
        }
    }

    // Noise signals
    if entropy > ENTROPY_MINIFIED_HI {
        *scores.entry("noise").or_insert(0.0) += 0.30;
    }
    if entropy > ENTROPY_BASE64_LO {
        *scores.entry("noise").or_insert(0.0) += 0.30;
    }
    if ic < IC_RANDOM_HI {
        *scores.entry("noise").or_insert(0.0) += 0.25;
    }
    if cached_re!(r"[A-Za-z0-9+/]{60,}={0,2}").is_match(sample) {
        *scores.entry("noise").or_insert(0.0) += 0.25;
    }

    // Normalize to a distribution
    let total: f64 = scores.values().sum();
    if total > 0.0 {
        for value in scores.values_mut() {
            *value /= total;
        }
    }
    scores
}

fn detect_garbage(sample: &str) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let mut garbage_chars = 0.0;
    for pattern in garbage_patterns() {
        for m in pattern.find_iter(sample) {
            garbage_chars += m.as_str().len() as f64;
        }
    }
    for m in cached_re!(r"data:[^;]+;base64,[A-Za-z0-9+/=]+").find_iter(sample) {
        garbage_chars += m.as_str().len() as f64;
    }
    for m in cached_re!(r"(?is)<script[^>]*>.*?</script>").find_iter(sample) {
        garbage_chars += m.as_str().len() as f64 * 0.7;
    }
    for m in cached_re!(r"(?is)<style[^>]*>.*?</style>").find_iter(sample) {
        garbage_chars += m.as_str().len() as f64 * 0.5;
    }
    (garbage_chars / sample.len() as f64).min(1.0)
}

fn prose_quality(entropy: f64, ic: f64, alpha_r: f64, special_r: f64, avg_line: usize) -> f64 {
    let mut score: f64 = 0.0;

    if (ENTROPY_PROSE_LO..=ENTROPY_PROSE_HI).contains(&entropy) {
        score += 0.30;
    } else if (ENTROPY_INFORMAL_LO..=ENTROPY_INFORMAL_HI).contains(&entropy) {
        score += 0.20;
    } else if entropy > 5.0 {
        score -= 0.10;
    }

    let ic_dist = (ic - 0.067).abs();
    if ic_dist < 0.005 {
        score += 0.30;
    } else if ic_dist < 0.010 {
        score += 0.20;
    } else if ic_dist < 0.020 {
        score += 0.10;
    }

    if alpha_r >= 0.80 {
        score += 0.20;
    } else if alpha_r >= 0.70 {
        score += 0.10;
    }

    if special_r <= 0.03 {
        score += 0.15;
    } else if special_r <= 0.06 {
        score += 0.08;
    }

    if (40..=100).contains(&avg_line) {
        score += 0.10;
    }

    score.clamp(0.0, 1.0)
}

fn info_density(
    prose_q: f64,
    garbage: f64,
    boilerplate: f64,
    scores: &HashMap<&'static str, f64>,
) -> f64 {
    let get = |name: &str| scores.get(name).copied().unwrap_or(0.0);
    let mut density = prose_q * 0.4;

    let useful = get("prose") + get("code") * 0.8 + get("markdown") * 0.9 + get("data") * 0.6;
    density += useful * 0.3;

    density -= garbage * 0.4;
    density -= boilerplate * 0.3;

    if get("prose") > 0.5 || get("markdown") > 0.5 {
        density += 0.15;
    }

    density.clamp(0.0, 1.0)
}

fn verdict_for(
    info_density: f64,
    garbage: f64,
    boilerplate: f64,
    primary: &str,
) -> (&'static str, &'static str) {
    if primary == "noise" || garbage > 0.5 {
        return ("garbage", "skip");
    }
    if info_density >= 0.70 && garbage < 0.1 && boilerplate < 0.1 {
        return ("pristine", "process");
    }
    if info_density >= 0.50 && garbage < 0.2 {
        return ("clean", "process");
    }
    if info_density >= 0.30
        || (matches!(primary, "prose" | "markdown" | "code") && garbage < 0.3)
    {
        return ("usable", "clean_first");
    }
    if info_density >= 0.15 || matches!(primary, "prose" | "markdown") {
        return ("dirty", "extract_only");
    }
    ("garbage", "skip")
}

fn detect_flags(sample: &str, entropy: f64, ic: f64, max_line: usize, unique_pct: f64) -> String {
    let mut flags = Vec::new();

    if cached_re!(r"[A-Za-z0-9+/]{40,}={0,2}").is_match(sample) {
        flags.push("base64");
    }
    if max_line > MINIFIED_LINE_LEN {
        flags.push("minified");
    }
    if unique_pct < SEVERE_BOILERPLATE_THRESHOLD {
        flags.push("severe_boilerplate");
    } else if unique_pct < BOILERPLATE_UNIQUE_THRESHOLD {
        flags.push("boilerplate");
    }
    if sample.contains('\u{fffd}') || cached_re!(r"\\x[0-9a-f]{2}").is_match(sample) {
        flags.push("encoding_issues");
    }
    if (IC_MULTILINGUAL_LO..=IC_MULTILINGUAL_HI).contains(&ic) && entropy < 5.0 {
        flags.push("multilingual");
    }
    if sample.contains("```") || cached_re!(r"<pre[^>]*>|<code[^>]*>").is_match(sample) {
        flags.push("has_code_blocks");
    }
    if sample.matches("<script").count() > 3 {
        flags.push("script_heavy");
    }
    if sample.matches('|').count() > 20 || sample.contains("<table") {
        flags.push("has_tables");
    }

    flags.join(",")
}

fn sample_score(text: &str) -> f64 {
    if text.len() < 30 {
        return -1.0;
    }
    let total = text.chars().count() as f64;
    let alpha_r = text.chars().filter(|c| c.is_alphabetic()).count() as f64 / total;
    let special_r = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count() as f64
        / total;

    let mut score = alpha_r - special_r * 2.0;
    for pattern in quality_patterns() {
        if pattern.is_match(text) {
            score += 0.1;
        }
    }
    score + (text.len() as f64 / 500.0).min(0.2)
}

fn extract_best_sample(text: &str) -> String {
    let mut best = String::new();
    let mut best_score = -1.0;
    let mut paragraph: Vec<&str> = Vec::new();

    let mut consider = |paragraph: &mut Vec<&str>, best: &mut String, best_score: &mut f64| {
        if paragraph.is_empty() {
            return;
        }
        let candidate = paragraph.join(" ");
        let score = sample_score(&candidate);
        if score > *best_score {
            *best_score = score;
            *best = candidate;
        }
        paragraph.clear();
    };

    for line in text.split('\n').take(300) {
        let stripped = line.trim();
        if stripped.is_empty() {
            consider(&mut paragraph, &mut best, &mut best_score);
            continue;
        }
        if stripped.starts_with('<')
            || stripped.starts_with('{')
            || stripped.starts_with('[')
            || stripped.starts_with("//")
            || stripped.starts_with("#!")
            || stripped.starts_with("/*")
        {
            continue;
        }
        if stripped.chars().count() < 20 {
            continue;
        }
        paragraph.push(stripped);
    }
    consider(&mut paragraph, &mut best, &mut best_score);

    if best.chars().count() > 150 {
        let head: String = best.chars().take(147).collect();
        let trimmed = match head.rfind(' ') {
            Some(idx) => &head[..idx],
            None => head.as_str(),
        };
        best = format!("{trimmed}...");
    }
    best
}

fn empty_digest() -> TextDigest {
    TextDigest {
        chars: 0,
        lines: 0,
        entropy: 0.0,
        entropy_verdict: "empty".to_string(),
        ic: 0.0,
        ic_verdict: "empty".to_string(),
        alpha_pct: 0.0,
        digit_pct: 0.0,
        space_pct: 0.0,
        special_pct: 0.0,
        avg_line_len: 0,
        max_line_len: 0,
        unique_line_pct: 0.0,
        primary_type: "empty".to_string(),
        confidence: 0.0,
        type_scores: String::new(),
        info_density: 0.0,
        prose_quality: 0.0,
        garbage_pct: 0.0,
        boilerplate_pct: 0.0,
        verdict: "garbage".to_string(),
        action: "skip".to_string(),
        flags: "empty".to_string(),
        best_sample: String::new(),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round4(v: f64) -> f64 {
    (v * 10000.0).round() / 10000.0
}

/// Compute the digest of a text blob
pub fn digest_text(text: &str) -> TextDigest {
    if text.is_empty() {
        return empty_digest();
    }

    let n = text.chars().count();
    let mut freq: HashMap<char, usize> = HashMap::new();
    let mut alpha = 0usize;
    let mut digit = 0usize;
    let mut space = 0usize;
    let mut html_c = 0usize;
    let mut code_c = 0usize;
    let mut md_c = 0usize;
    let mut data_c = 0usize;

    for ch in text.chars() {
        *freq.entry(ch).or_insert(0) += 1;
        if ch.is_alphabetic() {
            alpha += 1;
        } else if ch.is_ascii_digit() {
            digit += 1;
        } else if ch.is_whitespace() {
            space += 1;
        }
        if HTML_CHARS.contains(ch) {
            html_c += 1;
        }
        if CODE_CHARS.contains(ch) {
            code_c += 1;
        }
        if MD_CHARS.contains(ch) {
            md_c += 1;
        }
        if DATA_CHARS.contains(ch) {
            data_c += 1;
        }
    }
    let special = n - alpha - digit - space;
    let n_f = n as f64;

    let entropy = shannon_entropy(&freq, n);
    let entropy_verdict = classify_entropy(entropy);

    let mut alpha_freq: HashMap<char, usize> = HashMap::new();
    for ch in text.chars().filter(|c| c.is_alphabetic()) {
        for lower in ch.to_lowercase() {
            *alpha_freq.entry(lower).or_insert(0) += 1;
        }
    }
    let ic = index_of_coincidence(&alpha_freq);
    let ic_verdict = classify_ic(ic);

    let lines: Vec<&str> = text.split('\n').collect();
    let line_count = lines.len();
    let avg_line = lines.iter().map(|l| l.chars().count()).sum::<usize>() / line_count.max(1);
    let max_line = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);

    let normalized: Vec<String> = lines
        .iter()
        .take(10000)
        .map(|l| l.trim())
        .filter(|l| l.chars().count() > 5)
        .map(|l| l.to_lowercase())
        .collect();
    let unique_pct = if normalized.is_empty() {
        1.0
    } else {
        let unique: std::collections::HashSet<&String> = normalized.iter().collect();
        unique.len() as f64 / normalized.len() as f64
    };

    let sample = prefix_chars(text, 50000);
    let scores = score_types(
        sample,
        entropy,
        ic,
        alpha as f64 / n_f,
        special as f64 / n_f,
        html_c as f64 / n_f,
        code_c as f64 / n_f,
        md_c as f64 / n_f,
        data_c as f64 / n_f,
        avg_line,
        max_line,
        unique_pct,
    );

    // Deterministic primary selection: TYPE_NAMES order wins ties
    let (primary, confidence) = TYPE_NAMES
        .iter()
        .map(|&name| (name, scores.get(name).copied().unwrap_or(0.0)))
        .fold(("prose", f64::MIN), |acc, (name, score)| {
            if score > acc.1 {
                (name, score)
            } else {
                acc
            }
        });

    let mut sorted_scores: Vec<(&str, f64)> = TYPE_NAMES
        .iter()
        .map(|&name| (name, scores.get(name).copied().unwrap_or(0.0)))
        .collect();
    sorted_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let type_scores = sorted_scores
        .iter()
        .take(3)
        .filter(|(_, s)| *s > 0.05)
        .map(|(t, s)| format!("{t}:{}", (s * 100.0) as i64))
        .collect::<Vec<_>>()
        .join("|");

    let garbage_sample = prefix_chars(text, 30000);
    let garbage_pct = detect_garbage(garbage_sample);
    let boilerplate_pct = if unique_pct < BOILERPLATE_UNIQUE_THRESHOLD {
        (1.0 - unique_pct).max(0.0)
    } else {
        0.0
    };
    let prose_q = prose_quality(entropy, ic, alpha as f64 / n_f, special as f64 / n_f, avg_line);
    let density = info_density(prose_q, garbage_pct, boilerplate_pct, &scores);

    let (verdict, action) = verdict_for(density, garbage_pct, boilerplate_pct, primary);
    let flags = detect_flags(garbage_sample, entropy, ic, max_line, unique_pct);
    let best_sample = extract_best_sample(text);

    TextDigest {
        chars: n,
        lines: line_count,
        entropy: round3(entropy),
        entropy_verdict: entropy_verdict.to_string(),
        ic: round4(ic),
        ic_verdict: ic_verdict.to_string(),
        alpha_pct: round3(alpha as f64 / n_f),
        digit_pct: round3(digit as f64 / n_f),
        space_pct: round3(space as f64 / n_f),
        special_pct: round3(special as f64 / n_f),
        avg_line_len: avg_line,
        max_line_len: max_line,
        unique_line_pct: round3(unique_pct),
        primary_type: primary.to_string(),
        confidence: round3(confidence),
        type_scores,
        info_density: round3(density),
        prose_quality: round3(prose_q),
        garbage_pct: round3(garbage_pct),
        boilerplate_pct: round3(boilerplate_pct),
        verdict: verdict.to_string(),
        action: action.to_string(),
        flags,
        best_sample,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROSE: &str = "The committee reviewed the annual research findings in detail. \
        Because the evidence showed a consistent pattern across regions, the analysis \
        was accepted without major revisions. However, several members argued that the \
        data collection methods deserved further scrutiny before the final report. \
        Therefore, a follow-up study was commissioned for the next fiscal year, and \
        additional funding was allocated to the university research institute.";

    #[test]
    fn empty_text_is_garbage_skip() {
        let digest = digest_text("");
        assert_eq!(digest.verdict, "garbage");
        assert_eq!(digest.action, "skip");
        assert_eq!(digest.flags, "empty");
    }

    #[test]
    fn english_prose_scores_as_prose() {
        let digest = digest_text(PROSE);
        assert_eq!(digest.primary_type, "prose");
        assert!(matches!(digest.action.as_str(), "process" | "clean_first"));
        assert!(digest.prose_quality > 0.4);
    }

    #[test]
    fn json_data_scores_as_data() {
        let rows: Vec<String> = (0..50)
            .map(|i| format!("{{\"id\": {i}, \"name\": \"item-{i}\", \"price\": {}}}", i * 3))
            .collect();
        let text = format!("[{}]", rows.join(", "));
        let digest = digest_text(&text);
        assert_eq!(digest.primary_type, "data");
    }

    #[test]
    fn html_markup_detected() {
        let mut html = String::from("<!DOCTYPE html><html><head><title>Page</title></head><body>");
        for i in 0..40 {
            html.push_str(&format!("<div class=\"row\"><span>cell {i}</span></div>"));
        }
        html.push_str("</body></html>");
        let digest = digest_text(&html);
        assert_eq!(digest.primary_type, "html");
    }

    #[test]
    fn markdown_detected() {
        let md = "# Title\n\nSome introduction paragraph that goes on for a while here.\n\n\
                  ## Section One\n\n- first point about the topic\n- second point with detail\n\n\
                  > quoted remark from the source material\n\n\
                  **Bold claim** with a [link](https://example.com/page) reference.\n\n\
                  ```\nlet x = compute();\n```\n\n\
                  ## Section Two\n\nClosing remarks and a final summary sentence.";
        let digest = digest_text(md);
        assert_eq!(digest.primary_type, "markdown");
    }

    #[test]
    fn base64_blob_flagged_and_skipped() {
        let blob = "TWFueSBoYW5kcyBtYWtlIGxpZ2h0IHdvcmsuIFRoaXMgaXMgYSBsb25nIGJhc2U2NCBibG9i"
            .repeat(40);
        let digest = digest_text(&blob);
        assert!(digest.flags.contains("base64"));
        assert_eq!(digest.verdict, "garbage");
        assert_eq!(digest.action, "skip");
    }

    #[test]
    fn repeated_lines_flag_boilerplate() {
        let text = "Accept cookies to continue browsing\n".repeat(80);
        let digest = digest_text(&text);
        assert!(digest.flags.contains("boilerplate"));
        assert!(digest.boilerplate_pct > 0.5);
    }

    #[test]
    fn minified_flag_on_long_lines() {
        let minified = format!("var a={};", "x".repeat(900));
        let digest = digest_text(&minified);
        assert!(digest.flags.contains("minified"));
        assert!(digest.max_line_len > MINIFIED_LINE_LEN);
    }

    #[test]
    fn best_sample_prefers_prose_paragraphs() {
        let text = format!("<div>nav nav nav</div>\n\n{PROSE}\n\n<footer>x</footer>");
        let digest = digest_text(&text);
        assert!(digest.best_sample.contains("committee"));
        assert!(digest.best_sample.chars().count() <= 150);
    }

    #[test]
    fn digest_is_deterministic() {
        let a = digest_text(PROSE);
        let b = digest_text(PROSE);
        assert_eq!(a, b);
    }

    #[test]
    fn prompt_rendering_has_verdict() {
        let digest = digest_text(PROSE);
        let prompt = digest.to_prompt();
        assert!(prompt.starts_with("<digest>"));
        assert!(prompt.contains("VERDICT:"));
        assert!(prompt.ends_with("</digest>"));
    }

    #[test]
    fn entropy_buckets() {
        assert_eq!(classify_entropy(3.0), "compressed");
        assert_eq!(classify_entropy(4.2), "prose");
        assert_eq!(classify_entropy(4.8), "mixed");
        assert_eq!(classify_entropy(5.2), "markup");
        assert_eq!(classify_entropy(5.6), "minified");
        assert_eq!(classify_entropy(6.0), "encoded");
        assert_eq!(classify_entropy(6.5), "noise");
    }

    #[test]
    fn ic_buckets() {
        assert_eq!(classify_ic(0.066), "english");
        assert_eq!(classify_ic(0.050), "code");
        assert_eq!(classify_ic(0.041), "mixed");
        assert_eq!(classify_ic(0.020), "random");
    }
}
