use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

const MIN_HEADLINE_LEN: usize = 10;

fn cdata_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<title>\s*<!\[CDATA\[(.*?)\]\]>\s*</title>").expect("cdata title regex")
    })
}

fn plain_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<title>(.*?)</title>").expect("title regex"))
}

fn decode_entities(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Titles in the channel header, before the first `<item>`, describe the feed
/// itself. A feed without items is all header.
fn item_section(xml: &str) -> &str {
    xml.find("<item").map_or("", |start| &xml[start..])
}

fn is_feed_metadata(title: &str) -> bool {
    let lower = title.to_ascii_lowercase();
    lower.starts_with("yahoo! finance")
        || lower.starts_with("yahoo finance")
        || lower.contains("rss feed")
}

/// Extracts up to `max` headline titles from the items of an RSS document.
pub fn parse_rss_headlines(xml: &str, max: usize) -> Vec<String> {
    let items = item_section(xml);
    let mut raw: Vec<&str> = cdata_title_re()
        .captures_iter(items)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if raw.is_empty() {
        raw = plain_title_re()
            .captures_iter(items)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();
    }

    let mut seen = HashSet::new();
    let mut headlines = Vec::new();
    for title in raw {
        let title = decode_entities(title.trim());
        let title = title.trim();
        if title.chars().count() < MIN_HEADLINE_LEN || is_feed_metadata(title) {
            continue;
        }
        if !seen.insert(title.to_lowercase()) {
            continue;
        }
        headlines.push(title.to_string());
        if headlines.len() >= max {
            break;
        }
    }
    headlines
}
