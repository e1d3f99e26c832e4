// Content skeletons: one compact structure for all external content.
//
// Everything a scrape or search returns is normalized to
// {kind, title, items[], excerpt} with short item keys, so the model learns a
// single query pattern instead of one shape per tool.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Maximum SERP items retained
pub const MAX_SERP_ITEMS: usize = 12;
/// Maximum article sections retained
pub const MAX_ARTICLE_ITEMS: usize = 10;

const ARTICLE_EXCERPT_CHARS: usize = 800;
const NO_STRUCTURE_EXCERPT_CHARS: usize = 1500;
const RAW_EXCERPT_CHARS: usize = 2000;

const SEARCH_INTERNAL_DOMAINS: [&str; 3] = ["google.com", "gstatic.com", "googleapis.com"];
const USELESS_TITLES: [&str; 6] = [
    "read more",
    "click here",
    "learn more",
    "see more",
    "view",
    "link",
];

fn re_serp_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]{2,})\]\((https?://[^)]+)\)").expect("valid regex"))
}

fn re_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(#{1,3})\s+(.+)$").expect("valid regex"))
}

/// Kind of extracted content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkeletonKind {
    Serp,
    Article,
    Raw,
}

impl SkeletonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkeletonKind::Serp => "serp",
            SkeletonKind::Article => "article",
            SkeletonKind::Raw => "raw",
        }
    }
}

/// Universal structure for any external content.
///
/// Field keys are deliberately short to minimize bytes: SERP items are
/// `{t, u, p}` (title, url, position); article items are `{h, c, l}`
/// (heading, content preview, level).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSkeleton {
    pub kind: SkeletonKind,
    pub title: String,
    pub items: Vec<serde_json::Value>,
    pub excerpt: String,
}

impl ContentSkeleton {
    /// Compact JSON representation with empty fields removed
    pub fn to_json(&self) -> String {
        let mut map = serde_json::Map::new();
        map.insert("kind".to_string(), json!(self.kind.as_str()));
        if !self.title.is_empty() {
            map.insert("title".to_string(), json!(self.title));
        }
        if !self.items.is_empty() {
            map.insert("items".to_string(), json!(self.items));
        }
        if !self.excerpt.is_empty() {
            map.insert("excerpt".to_string(), json!(self.excerpt));
        }
        serde_json::Value::Object(map).to_string()
    }

    pub fn byte_size(&self) -> usize {
        self.to_json().len()
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Extract readable title from URL when link text is useless
fn title_from_url(url: &str) -> String {
    let clean = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let clean = clean.strip_prefix("www.").unwrap_or(clean);
    let mut parts = clean.splitn(2, '/');
    let domain = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    let segment = path.split('/').next().unwrap_or("");
    let segment = segment.split(['#', '?']).next().unwrap_or("");
    let cleaned: String = segment
        .chars()
        .map(|c| if c == '-' || c == '_' { ' ' } else { c })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.len() > 2 {
        format!("{domain}: {}", truncate_chars(cleaned, 50))
    } else {
        domain.to_string()
    }
}

/// Normalize a URL for dedup: strip fragment and query
fn base_url(url: &str) -> &str {
    url.split('#').next().unwrap_or(url).split('?').next().unwrap_or(url)
}

// ============================================================================
// SERP extraction
// ============================================================================

/// Extract search results into a compact skeleton.
///
/// Items have t=title, u=url, p=position. Uses a URL-derived title when the
/// link text is useless ("read more", "click here", < 4 chars).
pub fn extract_serp_skeleton(markdown: &str, query: &str) -> ContentSkeleton {
    let mut items = Vec::new();
    let mut seen_urls: HashSet<String> = HashSet::new();

    for cap in re_serp_link().captures_iter(markdown) {
        let raw_title = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        let url = cap.get(2).map(|m| m.as_str()).unwrap_or("");

        if SEARCH_INTERNAL_DOMAINS.iter().any(|d| url.contains(d)) {
            continue;
        }
        let base = base_url(url).to_string();
        if seen_urls.contains(&base) {
            continue;
        }

        let title = raw_title.trim();
        let title = if USELESS_TITLES.contains(&title.to_lowercase().as_str()) || title.len() < 4 {
            title_from_url(url)
        } else {
            title.to_string()
        };

        seen_urls.insert(base);
        items.push(json!({
            "t": truncate_chars(&title, 100),
            "u": truncate_chars(url, 300),
            "p": items.len() + 1,
        }));

        if items.len() >= MAX_SERP_ITEMS {
            break;
        }
    }

    ContentSkeleton {
        kind: SkeletonKind::Serp,
        title: if query.is_empty() {
            "search".to_string()
        } else {
            truncate_chars(query, 100)
        },
        items,
        // SERP needs no excerpt: the items ARE the content
        excerpt: String::new(),
    }
}

// ============================================================================
// Article extraction
// ============================================================================

/// Extract article structure into a compact skeleton.
///
/// Items have h=heading, c=content preview, l=level.
pub fn extract_article_skeleton(markdown: &str, title: &str) -> ContentSkeleton {
    let headings: Vec<(usize, usize, String)> = re_heading()
        .captures_iter(markdown)
        .map(|cap| {
            let pos = cap.get(0).map(|m| m.start()).unwrap_or(0);
            let level = cap.get(1).map(|m| m.as_str().len()).unwrap_or(1);
            let text = cap.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
            (pos, level, text)
        })
        .collect();

    if headings.is_empty() {
        return ContentSkeleton {
            kind: SkeletonKind::Raw,
            title: truncate_chars(title, 100),
            items: Vec::new(),
            excerpt: clean_excerpt(markdown, NO_STRUCTURE_EXCERPT_CHARS),
        };
    }

    let mut items = Vec::new();
    for (i, (pos, level, heading)) in headings.iter().take(MAX_ARTICLE_ITEMS).enumerate() {
        let end_pos = headings
            .get(i + 1)
            .map(|(p, _, _)| *p)
            .unwrap_or(markdown.len());
        let content = &markdown[*pos..end_pos];

        // Skip the heading line itself, preview the body
        let body: Vec<&str> = content.split('\n').skip(1).collect();
        let preview: String = truncate_chars(&body.join(" "), 200).trim().to_string();

        if !preview.is_empty() {
            items.push(json!({
                "h": truncate_chars(heading, 80),
                "c": preview,
                "l": level,
            }));
        }
    }

    let fallback_title = headings.first().map(|(_, _, h)| h.clone()).unwrap_or_default();
    ContentSkeleton {
        kind: SkeletonKind::Article,
        title: if title.is_empty() {
            truncate_chars(&fallback_title, 100)
        } else {
            truncate_chars(title, 100)
        },
        items,
        excerpt: clean_excerpt(markdown, ARTICLE_EXCERPT_CHARS),
    }
}

// ============================================================================
// Generic / fallback extraction
// ============================================================================

fn re_many_newlines() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

fn re_many_spaces() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r" {2,}").expect("valid regex"))
}

/// Clean and truncate text for an excerpt, preferring sentence boundaries
fn clean_excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = re_many_newlines().replace_all(text, "\n\n");
    let collapsed = re_many_spaces().replace_all(&collapsed, " ");

    if collapsed.chars().count() <= max_chars {
        return collapsed.into_owned();
    }

    let truncated: String = collapsed.chars().take(max_chars).collect();
    if let Some(last_period) = truncated.rfind(". ") {
        if last_period as f64 > max_chars as f64 * 0.7 {
            return truncated[..last_period + 1].to_string();
        }
    }
    format!("{truncated}...")
}

/// Universal extraction: detect the content type and build the matching
/// skeleton. `content_type` is an optional caller hint ("serp", ...).
pub fn extract_skeleton(content: &str, content_type: &str, title: &str) -> ContentSkeleton {
    let head: String = content.chars().take(2000).collect::<String>().to_lowercase();

    if content_type == "serp" || head.contains("google search") || head.contains("search results") {
        return extract_serp_skeleton(content, title);
    }

    if content.contains("# ") {
        return extract_article_skeleton(content, title);
    }

    ContentSkeleton {
        kind: SkeletonKind::Raw,
        title: truncate_chars(title, 100),
        items: Vec::new(),
        excerpt: clean_excerpt(content, RAW_EXCERPT_CHARS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serp_markdown(n: usize) -> String {
        let mut md = String::from("Google Search results for widgets\n\n");
        for i in 0..n {
            md.push_str(&format!(
                "[Result number {i} about widgets](https://site{i}.example.com/widgets/page-{i})\n"
            ));
        }
        md
    }

    #[test]
    fn serp_extraction_caps_items() {
        let skeleton = extract_serp_skeleton(&serp_markdown(30), "widgets");
        assert_eq!(skeleton.kind, SkeletonKind::Serp);
        assert_eq!(skeleton.items.len(), MAX_SERP_ITEMS);
        assert_eq!(skeleton.title, "widgets");
        assert!(skeleton.excerpt.is_empty());
    }

    #[test]
    fn serp_extraction_dedups_by_base_url() {
        let md = "[First](https://example.com/page?a=1)\n\
                  [Second](https://example.com/page#section)\n\
                  [Third](https://example.com/page)\n\
                  [Other](https://other.example.com/different)\n";
        let skeleton = extract_serp_skeleton(md, "");
        assert_eq!(skeleton.items.len(), 2);

        let mut bases = HashSet::new();
        for item in &skeleton.items {
            let url = item["u"].as_str().unwrap();
            assert!(bases.insert(base_url(url).to_string()));
        }
    }

    #[test]
    fn serp_extraction_is_idempotent() {
        let md = serp_markdown(15);
        let a = extract_serp_skeleton(&md, "widgets");
        let b = extract_serp_skeleton(&md, "widgets");
        let urls_a: Vec<&str> = a.items.iter().map(|i| i["u"].as_str().unwrap()).collect();
        let urls_b: Vec<&str> = b.items.iter().map(|i| i["u"].as_str().unwrap()).collect();
        assert_eq!(urls_a, urls_b);
    }

    #[test]
    fn serp_extraction_skips_search_internal_domains() {
        let md = "[Cached](https://webcache.google.com/x)\n\
                  [Image](https://static.gstatic.com/y)\n\
                  [Real result here](https://real.example.com/page)\n";
        let skeleton = extract_serp_skeleton(md, "");
        assert_eq!(skeleton.items.len(), 1);
        assert_eq!(skeleton.items[0]["u"], "https://real.example.com/page");
    }

    #[test]
    fn useless_link_text_gets_url_derived_title() {
        let md = "[Read more](https://news.example.com/big-product-launch)\n";
        let skeleton = extract_serp_skeleton(md, "");
        let title = skeleton.items[0]["t"].as_str().unwrap();
        assert!(title.contains("news.example.com"));
        assert!(title.contains("big product launch"));
    }

    #[test]
    fn positions_are_one_based_and_sequential() {
        let skeleton = extract_serp_skeleton(&serp_markdown(5), "");
        for (i, item) in skeleton.items.iter().enumerate() {
            assert_eq!(item["p"].as_u64().unwrap() as usize, i + 1);
        }
    }

    #[test]
    fn article_extraction_builds_sections() {
        let md = "# Main Title\n\nIntro paragraph with context.\n\n\
                  ## First Section\n\nBody of the first section with details.\n\n\
                  ## Second Section\n\nBody of the second section.";
        let skeleton = extract_article_skeleton(md, "");
        assert_eq!(skeleton.kind, SkeletonKind::Article);
        assert_eq!(skeleton.title, "Main Title");
        assert_eq!(skeleton.items.len(), 3);
        assert_eq!(skeleton.items[1]["h"], "First Section");
        assert_eq!(skeleton.items[1]["l"], 2);
        assert!(skeleton.items[1]["c"]
            .as_str()
            .unwrap()
            .contains("first section"));
    }

    #[test]
    fn article_without_headings_falls_back_to_raw() {
        let md = "Just a plain paragraph without any structure at all.";
        let skeleton = extract_article_skeleton(md, "Plain");
        assert_eq!(skeleton.kind, SkeletonKind::Raw);
        assert!(skeleton.items.is_empty());
        assert!(skeleton.excerpt.contains("plain paragraph"));
    }

    #[test]
    fn excerpt_breaks_at_sentence_when_possible() {
        let sentence = "This is a complete sentence that fills space. ";
        let text = sentence.repeat(100);
        let excerpt = clean_excerpt(&text, 800);
        assert!(excerpt.chars().count() <= 800);
        assert!(excerpt.ends_with('.'));
    }

    #[test]
    fn skeleton_json_drops_empty_fields() {
        let skeleton = ContentSkeleton {
            kind: SkeletonKind::Raw,
            title: String::new(),
            items: Vec::new(),
            excerpt: "text".to_string(),
        };
        let rendered = skeleton.to_json();
        assert!(!rendered.contains("title"));
        assert!(!rendered.contains("items"));
        assert!(rendered.contains("excerpt"));
    }

    #[test]
    fn large_serp_compacts_under_two_kb() {
        let mut md = serp_markdown(MAX_SERP_ITEMS);
        // ~19KB of navigation noise the skeleton should ignore
        md.push_str(&"nav nav nav [view](https://maps.google.com/place) footer \n".repeat(320));
        assert!(md.len() > 19_000);
        let skeleton = extract_serp_skeleton(&md, "widgets");
        assert_eq!(skeleton.items.len(), MAX_SERP_ITEMS);
        assert!(skeleton.byte_size() <= 2048, "size {}", skeleton.byte_size());
        for item in &skeleton.items {
            let url = item["u"].as_str().unwrap();
            assert!(!url.contains("google.com"));
            assert!(!url.contains("gstatic.com"));
        }
    }

    #[test]
    fn detect_serp_from_content() {
        let md = "Google Search results:\n[A real result](https://a.example.com/x)\n";
        let skeleton = extract_skeleton(md, "", "");
        assert_eq!(skeleton.kind, SkeletonKind::Serp);
    }

    #[test]
    fn detect_article_from_headings() {
        let md = "# Heading\n\nBody text under the heading.";
        let skeleton = extract_skeleton(md, "", "");
        assert_eq!(skeleton.kind, SkeletonKind::Article);
    }

    #[test]
    fn fallback_to_raw_excerpt() {
        let text = "plain text ".repeat(400);
        let skeleton = extract_skeleton(&text, "", "note");
        assert_eq!(skeleton.kind, SkeletonKind::Raw);
        assert!(skeleton.excerpt.chars().count() <= RAW_EXCERPT_CHARS + 3);
    }
}
