// src/quakes.rs
//! Quake normalizer: merges detail-enriched pull-feed entries with polled
//! webjson list rows into deduplicated canonical events. Preliminary
//! ("震度速報") reports are excluded from both sources.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::feed::AtomEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuakeSource {
    /// Pull-feed entry enriched from its detail document. Higher fidelity,
    /// wins merge collisions.
    PullDetail,
    Webjson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntensityArea {
    pub intensity: String,
    pub areas: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuakeItem {
    pub id: String,
    pub time: Option<DateTime<Utc>>,
    pub title: String,
    pub link: Option<String>,
    pub max_intensity: Option<String>,
    pub magnitude: Option<f64>,
    pub epicenter: Option<String>,
    pub depth_km: Option<i64>,
    #[serde(default)]
    pub intensity_areas: Vec<IntensityArea>,
    pub source: QuakeSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuakesSnapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub items: Vec<QuakeItem>,
}

/// JMA-style intensity labels on an ordinal scale ("5-" < "5+" < "6-").
/// Unknown labels rank 0 and never qualify for anything.
pub fn intensity_rank(label: &str) -> u8 {
    match label.trim() {
        "1" => 1,
        "2" => 2,
        "3" => 3,
        "4" => 4,
        "5-" | "5弱" => 5,
        "5+" | "5強" => 6,
        "6-" | "6弱" => 7,
        "6+" | "6強" => 8,
        "7" => 9,
        _ => 0,
    }
}

pub fn is_quake_entry(title: &str) -> bool {
    title.contains("震度") || title.contains("震源") || title.contains("地震")
}

/// Rapid intensity reports are triage-only and excluded entirely.
pub fn is_preliminary(title: &str) -> bool {
    title.contains("震度速報")
}

// --- detail document extraction (targeted, not DOM-validated) ---

static RE_MAGNITUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:jmx_eb:)?Magnitude[^>]*>([0-9.]+)<").unwrap());
static RE_HYPO_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<Hypocenter>.*?<Name>(.*?)</Name>").unwrap());
static RE_COORDINATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:jmx_eb:)?Coordinate[^>]*>([^<]*)<").unwrap());
static RE_DEPTH_METERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-(\d+)/?\s*$").unwrap());
static RE_ORIGIN_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<OriginTime>(.*?)</OriginTime>").unwrap());
static RE_MAX_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<MaxInt>(.*?)</MaxInt>").unwrap());
// Name directly (or through an area code tag) followed by MaxInt keeps
// the match inside one <Area> element without lookarounds.
static RE_AREA_INT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<Area>\s*<Name>([^<]*)</Name>\s*(?:<Code>[^<]*</Code>\s*)?<MaxInt>([^<]*)</MaxInt>")
        .unwrap()
});

/// Enrich a confirmed pull-feed entry from its detail document. Returns
/// `None` for preliminary reports.
pub fn parse_detail(entry: &AtomEntry, detail_xml: &str) -> Option<QuakeItem> {
    if is_preliminary(&entry.title) {
        return None;
    }

    let time = RE_ORIGIN_TIME
        .captures(detail_xml)
        .and_then(|c| DateTime::parse_from_rfc3339(c[1].trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or(entry.updated)
        .or(entry.published);

    let magnitude = RE_MAGNITUDE
        .captures(detail_xml)
        .and_then(|c| c[1].parse::<f64>().ok());
    let epicenter = RE_HYPO_NAME
        .captures(detail_xml)
        .map(|c| c[1].trim().to_string());
    let depth_km = RE_COORDINATE
        .captures(detail_xml)
        .and_then(|c| parse_depth_km(&c[1]));
    let max_intensity = RE_MAX_INT
        .captures(detail_xml)
        .map(|c| c[1].trim().to_string());

    // Per-area table, grouped by intensity, strongest first.
    let mut by_intensity: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for cap in RE_AREA_INT.captures_iter(detail_xml) {
        by_intensity
            .entry(cap[2].trim().to_string())
            .or_default()
            .push(cap[1].trim().to_string());
    }
    let mut intensity_areas: Vec<IntensityArea> = by_intensity
        .into_iter()
        .map(|(intensity, areas)| IntensityArea { intensity, areas })
        .collect();
    intensity_areas.sort_by(|a, b| intensity_rank(&b.intensity).cmp(&intensity_rank(&a.intensity)));

    Some(finish_item(
        time,
        entry.title.clone(),
        entry.link.clone(),
        max_intensity,
        magnitude,
        epicenter,
        depth_km,
        intensity_areas,
        QuakeSource::PullDetail,
    ))
}

fn parse_depth_km(coordinate: &str) -> Option<i64> {
    let meters: i64 = RE_DEPTH_METERS
        .captures(coordinate.trim())?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    Some(meters / 1000)
}

// --- webjson list ---

#[derive(Debug, Deserialize)]
struct WebQuakeRow {
    #[serde(default)]
    eid: Option<String>,
    #[serde(default)]
    at: Option<String>,
    #[serde(default)]
    anm: Option<String>,
    #[serde(default)]
    mag: Option<String>,
    #[serde(default)]
    cod: Option<String>,
    #[serde(default)]
    maxi: Option<String>,
    #[serde(default)]
    ttl: Option<String>,
}

/// Parse the polled quake list. Rows carry most fields directly.
pub fn parse_webjson(raw: &str) -> Result<Vec<QuakeItem>> {
    let rows: Vec<WebQuakeRow> = serde_json::from_str(raw).context("quake list json")?;

    let mut out = Vec::new();
    for row in rows {
        let title = row.ttl.unwrap_or_default();
        if title.is_empty() || is_preliminary(&title) {
            continue;
        }
        let time = row
            .at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let magnitude = row.mag.as_deref().and_then(|m| m.trim().parse::<f64>().ok());
        let depth_km = row.cod.as_deref().and_then(parse_depth_km);

        let mut item = finish_item(
            time,
            title,
            None,
            row.maxi,
            magnitude,
            row.anm,
            depth_km,
            Vec::new(),
            QuakeSource::Webjson,
        );
        if let Some(eid) = row.eid {
            // Stable upstream event id when present.
            item.id = eid;
        }
        out.push(item);
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn finish_item(
    time: Option<DateTime<Utc>>,
    title: String,
    link: Option<String>,
    max_intensity: Option<String>,
    magnitude: Option<f64>,
    epicenter: Option<String>,
    depth_km: Option<i64>,
    intensity_areas: Vec<IntensityArea>,
    source: QuakeSource,
) -> QuakeItem {
    let mut hasher = Sha256::new();
    hasher.update(merge_key(time, epicenter.as_deref(), max_intensity.as_deref()).as_bytes());
    let id = format!("{:x}", hasher.finalize());

    QuakeItem {
        id,
        time,
        title,
        link,
        max_intensity,
        magnitude,
        epicenter,
        depth_km,
        intensity_areas,
        source,
    }
}

/// Dedup key: minute-truncated origin time + epicenter + max intensity.
/// Sources disagree on seconds for the same event.
fn merge_key(
    time: Option<DateTime<Utc>>,
    epicenter: Option<&str>,
    max_intensity: Option<&str>,
) -> String {
    let minute = time
        .and_then(|t| t.with_second(0).and_then(|t| t.with_nanosecond(0)))
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    format!(
        "{minute}|{}|{}",
        epicenter.unwrap_or(""),
        max_intensity.unwrap_or("")
    )
}

/// Merge both sources. Pull-detail items are inserted first and win
/// collisions. If both sources come up empty the previous snapshot is
/// returned unchanged, so a transient upstream outage never blanks the
/// reader-facing list.
pub fn merge(
    feed_items: Vec<QuakeItem>,
    web_items: Vec<QuakeItem>,
    updated_at: Option<DateTime<Utc>>,
    previous: Option<QuakesSnapshot>,
) -> QuakesSnapshot {
    if feed_items.is_empty() && web_items.is_empty() {
        return previous.unwrap_or_default();
    }

    let mut seen: BTreeMap<String, QuakeItem> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for item in feed_items.into_iter().chain(web_items) {
        let key = merge_key(item.time, item.epicenter.as_deref(), item.max_intensity.as_deref());
        if !seen.contains_key(&key) {
            order.push(key.clone());
            seen.insert(key, item);
        }
    }

    let mut items: Vec<QuakeItem> = order.into_iter().filter_map(|k| seen.remove(&k)).collect();
    items.sort_by(|a, b| b.time.cmp(&a.time));

    let updated_at = match (updated_at, previous.as_ref().and_then(|p| p.updated_at)) {
        (Some(n), Some(p)) => Some(n.max(p)),
        (n, p) => n.or(p),
    };

    QuakesSnapshot { updated_at, items }
}
