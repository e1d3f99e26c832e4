// Context hints: tiny decision accelerators derived from tool results.
//
// Hints are purely optimistic. If nothing useful can be extracted, the
// extractor returns None; no hint beats a bad hint.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const MAX_HINT_ITEMS: usize = 5;

/// Domains that are noise in search results
const NOISE_DOMAINS: [&str; 8] = [
    "google.com",
    "gstatic.com",
    "googleapis.com",
    "googleusercontent.com",
    "youtube.com",
    "facebook.com",
    "twitter.com",
    "x.com",
];

fn re_md_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]{2,80})\]\((https?://[^)]+)\)").expect("valid regex"))
}

fn re_ref_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]{2,80})\]:\s*(https?://\S+)").expect("valid regex"))
}

fn re_bare_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s\)\]"'<>]{10,200}"#).expect("valid regex"))
}

fn re_price() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$[\d,]+(?:\.\d{2})?|\d+(?:,\d{3})*(?:\.\d{2})?\s*(?:USD|EUR|GBP)")
            .expect("valid regex")
    })
}

fn re_h1() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#\s+(.+)$").expect("valid regex"))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn domain_from_url(url: &str) -> String {
    let clean = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let clean = clean.strip_prefix("www.").unwrap_or(clean);
    clean
        .split('/')
        .next()
        .unwrap_or("")
        .split('?')
        .next()
        .unwrap_or("")
        .to_lowercase()
}

/// Derive a readable title from the URL path when no title is available
fn title_from_url(url: &str) -> String {
    let after_domain = url
        .splitn(4, '/')
        .nth(3)
        .unwrap_or("");
    if after_domain.is_empty() {
        return domain_from_url(url);
    }
    let path = after_domain.split(['?', '#']).next().unwrap_or("");
    let segments: Vec<&str> = path.split('/').filter(|s| s.len() > 2).collect();
    let Some(last) = segments.last() else {
        return domain_from_url(url);
    };
    let cleaned: String = last
        .chars()
        .map(|c| if c == '-' || c == '_' { ' ' } else { c })
        .collect();
    // Drop a trailing file extension
    let cleaned = match cleaned.rfind('.') {
        Some(idx) if cleaned.len() - idx <= 5 && idx > 0 => cleaned[..idx].to_string(),
        _ => cleaned,
    };
    truncate_chars(cleaned.trim(), 50)
}

fn is_useful_url(url: &str) -> bool {
    if url.len() < 20 {
        return false;
    }
    let domain = domain_from_url(url);
    !NOISE_DOMAINS.iter().any(|noise| domain.contains(noise))
}

struct HintItem {
    title: String,
    url: String,
    domain: String,
}

/// Aggressive extraction of result items from messy markdown.
/// Keeps the first occurrence per domain.
fn extract_serp_items(text: &str, max_items: usize) -> Vec<HintItem> {
    let mut items: Vec<HintItem> = Vec::new();
    let mut seen_domains: HashSet<String> = HashSet::new();

    for pattern in [re_md_link(), re_ref_link()] {
        for cap in pattern.captures_iter(text) {
            let title = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            let url = cap.get(2).map(|m| m.as_str()).unwrap_or("");

            if !is_useful_url(url) {
                continue;
            }
            let domain = domain_from_url(url);
            if !seen_domains.insert(domain.clone()) {
                continue;
            }

            let title = title.trim();
            let title = if title.len() < 3
                || matches!(
                    title.to_lowercase().as_str(),
                    "read more" | "click here" | "learn more" | "link"
                ) {
                title_from_url(url)
            } else {
                title.to_string()
            };

            items.push(HintItem {
                title: truncate_chars(&title, 60),
                url: truncate_chars(url, 200),
                domain,
            });
            if items.len() >= max_items {
                return items;
            }
        }
    }

    // Fallback: bare URLs with derived titles
    if items.len() < max_items {
        for m in re_bare_url().find_iter(text) {
            let url = m.as_str().trim_end_matches(['.', ',', ';', ':']);
            if !is_useful_url(url) {
                continue;
            }
            let domain = domain_from_url(url);
            if !seen_domains.insert(domain.clone()) {
                continue;
            }
            items.push(HintItem {
                title: title_from_url(url),
                url: truncate_chars(url, 200),
                domain,
            });
            if items.len() >= max_items {
                break;
            }
        }
    }

    items
}

/// Extract a context hint from a SERP result payload.
///
/// Format, optimized for quick scanning:
/// ```text
/// [search] domain.com: Title | domain2.com: Title2
/// -> url1
/// -> url2
/// ```
pub fn hint_from_serp(payload: &Value) -> Option<String> {
    // Case 1: skeleton items already extracted by the adapter
    let items: Vec<HintItem> = match payload.get("items").and_then(|v| v.as_array()) {
        Some(arr) if !arr.is_empty() => arr
            .iter()
            .take(MAX_HINT_ITEMS)
            .filter_map(|item| {
                let url = item.get("u").and_then(|v| v.as_str()).unwrap_or("");
                let title = item.get("t").and_then(|v| v.as_str()).unwrap_or("");
                let domain = item
                    .get("d")
                    .and_then(|v| v.as_str())
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| domain_from_url(url));
                if url.is_empty() && domain.is_empty() {
                    None
                } else {
                    Some(HintItem {
                        title: truncate_chars(title, 40),
                        url: url.to_string(),
                        domain,
                    })
                }
            })
            .collect(),
        _ => {
            // Case 2: raw markdown under "result"
            let markdown = payload.get("result").and_then(|v| v.as_str())?;
            extract_serp_items(markdown, MAX_HINT_ITEMS)
        }
    };

    if items.is_empty() {
        return None;
    }

    let mut summaries = Vec::new();
    let mut urls = Vec::new();
    for item in &items {
        if !item.domain.is_empty() && !item.title.is_empty() {
            summaries.push(format!("{}: {}", item.domain, truncate_chars(&item.title, 40)));
        } else if !item.domain.is_empty() {
            summaries.push(item.domain.clone());
        }
        if !item.url.is_empty() {
            urls.push(item.url.clone());
        }
    }

    if summaries.is_empty() {
        return None;
    }

    let mut lines = vec![format!(
        "\u{1F50D} {}",
        summaries.iter().take(3).cloned().collect::<Vec<_>>().join(" | ")
    )];
    for url in urls.iter().take(MAX_HINT_ITEMS) {
        lines.push(format!("\u{2192} {url}"));
    }
    Some(lines.join("\n"))
}

/// Extract a context hint from a scraped-page payload: title, any prices
/// found, and key headings.
pub fn hint_from_scraped_page(payload: &Value) -> Option<String> {
    let title = payload.get("title").and_then(|v| v.as_str()).unwrap_or("");
    let items = payload
        .get("items")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let excerpt = payload.get("excerpt").and_then(|v| v.as_str()).unwrap_or("");

    if title.is_empty() && items.is_empty() && excerpt.is_empty() {
        // No skeleton: fall back to raw markdown
        let markdown = payload.get("result").and_then(|v| v.as_str())?;

        let title = re_h1()
            .captures(markdown)
            .and_then(|cap| cap.get(1))
            .map(|m| truncate_chars(m.as_str(), 80))
            .unwrap_or_default();

        let head = markdown.chars().take(5000).collect::<String>();
        let prices = unique_prices(&head);
        if !prices.is_empty() {
            let price_str = prices.join(", ");
            if !title.is_empty() {
                return Some(format!("\u{1F4C4} {title}\n\u{1F4B0} {price_str}"));
            }
            return Some(format!("\u{1F4B0} Prices found: {price_str}"));
        }
        if !title.is_empty() {
            return Some(format!("\u{1F4C4} {title}"));
        }
        return None;
    }

    let mut parts = Vec::new();
    if !title.is_empty() {
        parts.push(format!("\u{1F4C4} {}", truncate_chars(title, 80)));
    }
    if !excerpt.is_empty() {
        let prices = unique_prices(excerpt);
        if !prices.is_empty() {
            parts.push(format!("\u{1F4B0} {}", prices.join(", ")));
        }
    }
    let headings: Vec<String> = items
        .iter()
        .take(3)
        .filter_map(|item| item.get("h").and_then(|v| v.as_str()))
        .map(|h| truncate_chars(h, 40))
        .collect();
    if !headings.is_empty() {
        parts.push(format!("\u{00A7} {}", headings.join(" | ")));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn unique_prices(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut prices = Vec::new();
    for m in re_price().find_iter(text) {
        let price = m.as_str().to_string();
        if seen.insert(price.clone()) {
            prices.push(price);
            if prices.len() >= 3 {
                break;
            }
        }
    }
    prices
}

/// Main entry point: extract a context hint based on the tool that produced
/// the payload. Optimistic; returns None over a low-signal hint.
pub fn extract_context_hint(tool_name: &str, payload: &Value) -> Option<String> {
    if !payload.is_object() {
        return None;
    }
    match tool_name {
        "search_engine" | "mcp_brightdata_search_engine" => hint_from_serp(payload),
        "scrape_as_markdown" | "mcp_brightdata_scrape_as_markdown" => {
            hint_from_scraped_page(payload)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serp_hint_from_skeleton_items() {
        let payload = json!({
            "items": [
                {"t": "Widget Review", "u": "https://reviews.example.com/widget", "d": "reviews.example.com"},
                {"t": "Widget Shop", "u": "https://shop.example.com/widget"},
            ],
        });
        let hint = hint_from_serp(&payload).unwrap();
        assert!(hint.contains("reviews.example.com: Widget Review"));
        assert!(hint.contains("\u{2192} https://shop.example.com/widget"));
        let lines: Vec<&str> = hint.lines().collect();
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn serp_hint_from_raw_markdown() {
        let payload = json!({
            "result": "[Great Widgets Here](https://widgets.example.com/catalog/all-widgets)\n\
                       [Other Vendor Page](https://vendor.example.org/products/widget-pro)\n",
        });
        let hint = hint_from_serp(&payload).unwrap();
        assert!(hint.starts_with('\u{1F50D}'));
        assert!(hint.contains("widgets.example.com"));
        assert!(hint.contains("vendor.example.org"));
    }

    #[test]
    fn serp_hint_skips_noise_domains() {
        let payload = json!({
            "result": "[Video](https://www.youtube.com/watch?v=abc123def)\n\
                       [Social](https://facebook.com/page/something)\n",
        });
        assert!(hint_from_serp(&payload).is_none());
    }

    #[test]
    fn serp_hint_dedups_domains() {
        let payload = json!({
            "result": "[One](https://store.example.com/page-one-long)\n\
                       [Two](https://store.example.com/page-two-long)\n",
        });
        let hint = hint_from_serp(&payload).unwrap();
        assert_eq!(hint.matches("store.example.com").count(), 2); // summary + one URL
        assert_eq!(hint.lines().count(), 2);
    }

    #[test]
    fn serp_hint_none_for_empty_payload() {
        assert!(hint_from_serp(&json!({})).is_none());
        assert!(hint_from_serp(&json!({"result": ""})).is_none());
    }

    #[test]
    fn bare_urls_get_derived_titles() {
        let payload = json!({
            "result": "see https://docs.example.com/guides/getting-started.html for info",
        });
        let hint = hint_from_serp(&payload).unwrap();
        assert!(hint.contains("getting started"));
    }

    #[test]
    fn page_hint_includes_title_and_prices() {
        let payload = json!({
            "result": "# Deluxe Widget 3000\n\nOnly $49.99 today, down from $79.99!",
        });
        let hint = hint_from_scraped_page(&payload).unwrap();
        assert!(hint.contains("Deluxe Widget 3000"));
        assert!(hint.contains("$49.99"));
        assert!(hint.contains("$79.99"));
    }

    #[test]
    fn page_hint_from_skeleton_headings() {
        let payload = json!({
            "title": "Annual Report",
            "items": [
                {"h": "Revenue", "c": "..."},
                {"h": "Costs", "c": "..."},
            ],
            "excerpt": "Total of $1,200,000 USD booked.",
        });
        let hint = hint_from_scraped_page(&payload).unwrap();
        assert!(hint.contains("Annual Report"));
        assert!(hint.contains("Revenue | Costs"));
    }

    #[test]
    fn page_hint_none_when_no_signal() {
        assert!(hint_from_scraped_page(&json!({"result": "plain text without structure"})).is_none());
    }

    #[test]
    fn hint_router_matches_tool_names() {
        let serp_payload = json!({
            "items": [{"t": "A result title", "u": "https://a.example.com/path/page"}],
        });
        assert!(extract_context_hint("search_engine", &serp_payload).is_some());
        assert!(extract_context_hint("mcp_brightdata_search_engine", &serp_payload).is_some());
        assert!(extract_context_hint("unrelated_tool", &serp_payload).is_none());
        assert!(extract_context_hint("search_engine", &json!("not a dict")).is_none());
    }
}
