// src/feed.rs
//! Tolerant Atom parsing. The upstream feeds are not schema-guaranteed,
//! so entries are mined with regex extraction instead of strict DOM
//! validation: one malformed entry must not abort the rest.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomEntry {
    pub id: String,
    pub title: String,
    pub updated: Option<DateTime<Utc>>,
    pub published: Option<DateTime<Utc>>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub feed_updated_at: Option<DateTime<Utc>>,
    pub entries: Vec<AtomEntry>,
}

static RE_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<entry(?:\s[^>]*)?>(.*?)</entry>").unwrap());
static RE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<id[^>]*>(.*?)</id>").unwrap());
static RE_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static RE_UPDATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<updated[^>]*>(.*?)</updated>").unwrap());
static RE_PUBLISHED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<published[^>]*>(.*?)</published>").unwrap());
static RE_LINK_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<link\b[^>]*>").unwrap());
static RE_ATTR_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']*)["']"#).unwrap());
static RE_ATTR_REL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\brel\s*=\s*["']([^"']*)["']"#).unwrap());
static RE_ATTR_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\btype\s*=\s*["']([^"']*)["']"#).unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Parse an Atom document. Pure function; entries missing `id` or `title`
/// are dropped silently.
pub fn parse_atom(xml: &str) -> ParsedFeed {
    let mut entries = Vec::new();

    let first_entry_at = RE_ENTRY.find(xml).map(|m| m.start()).unwrap_or(xml.len());
    let feed_updated_at = RE_UPDATED
        .captures(&xml[..first_entry_at])
        .and_then(|c| parse_rfc3339(&c[1]));

    for cap in RE_ENTRY.captures_iter(xml) {
        let body = &cap[1];
        let id = RE_ID.captures(body).map(|c| clean_text(&c[1]));
        let title = RE_TITLE.captures(body).map(|c| clean_text(&c[1]));
        let (Some(id), Some(title)) = (id, title) else {
            continue;
        };
        if id.is_empty() || title.is_empty() {
            continue;
        }

        entries.push(AtomEntry {
            id,
            title,
            updated: RE_UPDATED.captures(body).and_then(|c| parse_rfc3339(&c[1])),
            published: RE_PUBLISHED
                .captures(body)
                .and_then(|c| parse_rfc3339(&c[1])),
            link: extract_link(body),
        });
    }

    ParsedFeed {
        feed_updated_at,
        entries,
    }
}

/// Prefer `rel="alternate"` or `type="application/xml"`; fall back to the
/// first link tag carrying an href.
fn extract_link(entry_body: &str) -> Option<String> {
    let mut first: Option<String> = None;
    for tag in RE_LINK_TAG.find_iter(entry_body) {
        let tag = tag.as_str();
        let Some(href) = RE_ATTR_HREF.captures(tag).map(|c| c[1].trim().to_string()) else {
            continue;
        };
        if href.is_empty() {
            continue;
        }
        let rel = RE_ATTR_REL.captures(tag).map(|c| c[1].to_ascii_lowercase());
        let typ = RE_ATTR_TYPE.captures(tag).map(|c| c[1].to_ascii_lowercase());
        if rel.as_deref() == Some("alternate") || typ.as_deref() == Some("application/xml") {
            return Some(href);
        }
        if first.is_none() {
            first = Some(href);
        }
    }
    first
}

fn clean_text(raw: &str) -> String {
    let decoded = html_escape::decode_html_entities(raw);
    RE_WS.replace_all(decoded.trim(), " ").to_string()
}

fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    let dt = OffsetDateTime::parse(ts.trim(), &Rfc3339).ok()?;
    DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>高頻度（定時）</title>
  <updated>2024-06-01T10:30:00+09:00</updated>
  <entry>
    <title>気象警報・注意報（東京都）</title>
    <id>urn:uuid:0001</id>
    <updated>2024-06-01T10:20:00+09:00</updated>
    <published>2024-06-01T10:19:00+09:00</published>
    <link rel="related" href="https://example.test/html/0001.html"/>
    <link rel="alternate" type="application/xml" href="https://example.test/xml/0001.xml"/>
  </entry>
  <entry>
    <title>震源・震度情報</title>
    <id>urn:uuid:0002</id>
    <link href="https://example.test/xml/0002.xml"/>
  </entry>
  <entry>
    <!-- no id: must be dropped, but must not abort the parse -->
    <title>broken entry</title>
  </entry>
</feed>"#;

    #[test]
    fn parses_entries_and_feed_updated() {
        let parsed = parse_atom(FEED);
        assert_eq!(parsed.entries.len(), 2);
        assert!(parsed.feed_updated_at.is_some());

        let first = &parsed.entries[0];
        assert_eq!(first.id, "urn:uuid:0001");
        assert_eq!(first.title, "気象警報・注意報（東京都）");
        assert!(first.updated.is_some());
        assert!(first.published.is_some());
    }

    #[test]
    fn link_prefers_alternate_over_first() {
        let parsed = parse_atom(FEED);
        assert_eq!(
            parsed.entries[0].link.as_deref(),
            Some("https://example.test/xml/0001.xml")
        );
        // Single untyped link: fallback to first href.
        assert_eq!(
            parsed.entries[1].link.as_deref(),
            Some("https://example.test/xml/0002.xml")
        );
    }

    #[test]
    fn tolerates_malformed_surroundings() {
        let xml = "garbage <entry><id>a</id><title>t &amp; u</title></entry> <entry><title>no id</title></entry> trailing <unclosed";
        let parsed = parse_atom(xml);
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].title, "t & u");
        assert_eq!(parsed.feed_updated_at, None);
    }

    #[test]
    fn empty_input_yields_empty_feed() {
        let parsed = parse_atom("");
        assert!(parsed.entries.is_empty());
        assert!(parsed.feed_updated_at.is_none());
    }
}
