// src/warnings.rs
//! Warning normalizer: per-office webjson documents (or, as a last
//! resort, pull-feed entry titles) → canonical warning items with area
//! resolution and confidence.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::area::{AreaTable, CapitalGroup, Resolution, CAPITAL_OFFICE};
use crate::bucket;
use crate::classify::{ClassifyConfig, Severity};
use crate::feed::AtomEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSource {
    Pull,
    Webjson,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningItem {
    /// Content hash over (area, code/kind, status, severity).
    pub id: String,
    pub kind: String,
    pub status: Option<String>,
    pub severity: Severity,
    pub code: Option<String>,
    pub source: WarningSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaSnapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub area: String,
    pub area_name: String,
    pub items: Vec<WarningItem>,
}

/// Normalized per-office document as persisted: one row per area code the
/// upstream document actually carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfficeWarnings {
    pub updated_at: Option<DateTime<Utc>>,
    pub office: String,
    pub office_name: String,
    pub rows: BTreeMap<String, AreaRow>,
    /// True when this document was synthesized from feed entry titles
    /// instead of a webjson document. Readers report LOW confidence.
    #[serde(default)]
    pub derived_from_titles: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaRow {
    pub code: String,
    pub name: String,
    pub items: Vec<WarningItem>,
}

// --- upstream webjson shape (lenient: everything optional) ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamDoc {
    #[serde(default)]
    report_datetime: Option<String>,
    #[serde(default)]
    area_types: Vec<UpstreamAreaType>,
}

#[derive(Debug, Deserialize)]
struct UpstreamAreaType {
    #[serde(default)]
    areas: Vec<UpstreamArea>,
}

#[derive(Debug, Deserialize)]
struct UpstreamArea {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    warnings: Vec<UpstreamWarning>,
}

#[derive(Debug, Deserialize)]
struct UpstreamWarning {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    levels: Vec<UpstreamLevel>,
}

#[derive(Debug, Deserialize)]
struct UpstreamLevel {
    #[serde(default)]
    values: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct WarningNormalizer {
    areas: Arc<AreaTable>,
    rules: Arc<ClassifyConfig>,
}

impl WarningNormalizer {
    pub fn new(areas: Arc<AreaTable>, rules: Arc<ClassifyConfig>) -> Self {
        Self { areas, rules }
    }

    /// Normalize one per-office webjson document. Cancelled / "nothing in
    /// effect" entries are excluded here, before any dedup, so they never
    /// count toward bucket totals.
    pub fn normalize_office(&self, office: &str, raw_json: &str) -> Result<OfficeWarnings> {
        let doc: UpstreamDoc =
            serde_json::from_str(raw_json).with_context(|| format!("warning doc {office}"))?;

        let updated_at = doc
            .report_datetime
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let mut rows: BTreeMap<String, AreaRow> = BTreeMap::new();
        for at in &doc.area_types {
            for area in &at.areas {
                let Some(code) = area.code.as_deref() else {
                    continue;
                };
                let name = area
                    .name
                    .clone()
                    .or_else(|| self.area_label(code))
                    .unwrap_or_else(|| code.to_string());

                let mut items = Vec::new();
                for w in &area.warnings {
                    if let Some(status) = w.status.as_deref() {
                        if ClassifyConfig::is_cleared(status) {
                            continue;
                        }
                    }
                    let levels = flatten_levels(&w.levels);
                    let severity = self.rules.severity_for(
                        w.code.as_deref(),
                        w.status.as_deref(),
                        &levels,
                        "",
                    );
                    let kind = self.rules.kind_for(w.code.as_deref(), "", severity);
                    items.push(make_item(
                        code,
                        kind,
                        w.status.clone(),
                        severity,
                        w.code.clone(),
                        WarningSource::Webjson,
                    ));
                }

                // Later rows for the same code merge in (upstream repeats
                // codes across areaType granularities).
                rows.entry(code.to_string())
                    .and_modify(|row| row.items.extend(items.clone()))
                    .or_insert(AreaRow {
                        code: code.to_string(),
                        name,
                        items,
                    });
            }
        }

        for row in rows.values_mut() {
            row.items = bucket::dedup_items(std::mem::take(&mut row.items));
        }

        Ok(OfficeWarnings {
            updated_at,
            office: office.to_string(),
            office_name: self
                .areas
                .office_name(office)
                .unwrap_or(office)
                .to_string(),
            rows,
            derived_from_titles: false,
        })
    }

    /// Fallback normalization from pull-feed entry titles when no webjson
    /// document exists for the office. Confidence is LOW by construction.
    pub fn normalize_from_titles(&self, office: &str, entries: &[AtomEntry]) -> OfficeWarnings {
        let office_label = self.areas.office_name(office).unwrap_or(office);
        let mut items = Vec::new();
        let mut updated_at: Option<DateTime<Utc>> = None;

        for entry in entries {
            if !entry.title.contains(office_label) {
                continue;
            }
            let severity = self.rules.severity_for(None, None, &[], &entry.title);
            let kind = self.rules.kind_for(None, &entry.title, severity);
            items.push(make_item(
                office,
                kind,
                None,
                severity,
                None,
                WarningSource::Pull,
            ));
            updated_at = max_time(updated_at, entry.updated.or(entry.published));
        }

        let mut rows = BTreeMap::new();
        rows.insert(
            office.to_string(),
            AreaRow {
                code: office.to_string(),
                name: office_label.to_string(),
                items: bucket::dedup_items(items),
            },
        );

        OfficeWarnings {
            updated_at,
            office: office.to_string(),
            office_name: office_label.to_string(),
            rows,
            derived_from_titles: true,
        }
    }

    /// Resolve a requested code against the rows this document actually
    /// has, walking class20 → class10 → office.
    pub fn area_snapshot(
        &self,
        doc: &OfficeWarnings,
        requested: &str,
    ) -> Option<(AreaSnapshot, Resolution)> {
        let available: HashSet<String> = doc.rows.keys().cloned().collect();
        let res = self.areas.resolve_in(requested, &available)?;
        let row = doc.rows.get(&res.code_used)?;
        Some((
            AreaSnapshot {
                updated_at: doc.updated_at,
                area: row.code.clone(),
                area_name: row.name.clone(),
                items: row.items.clone(),
            },
            res,
        ))
    }

    /// Office-level view: one merged snapshot per office, except the
    /// capital office, which splits into mainland and two island chains
    /// because they receive independent warnings. Keys are the office
    /// code (mainland / whole office) and the island-chain anchor codes.
    pub fn group_snapshots(&self, doc: &OfficeWarnings) -> BTreeMap<String, AreaSnapshot> {
        let mut out = BTreeMap::new();

        if doc.office != CAPITAL_OFFICE {
            let mut items = Vec::new();
            for row in doc.rows.values() {
                items.extend(row.items.iter().cloned());
            }
            out.insert(
                doc.office.clone(),
                AreaSnapshot {
                    updated_at: doc.updated_at,
                    area: doc.office.clone(),
                    area_name: doc.office_name.clone(),
                    items: bucket::dedup_items(items),
                },
            );
            return out;
        }

        let mut grouped: BTreeMap<CapitalGroup, Vec<WarningItem>> = BTreeMap::new();
        for row in doc.rows.values() {
            let group = self.group_of_row(row);
            grouped
                .entry(group)
                .or_default()
                .extend(row.items.iter().cloned());
        }

        for (group, items) in grouped {
            let (key, name) = match group {
                CapitalGroup::Mainland => (doc.office.clone(), group.label().to_string()),
                CapitalGroup::IzuIslands => ("130030".to_string(), group.label().to_string()),
                CapitalGroup::Ogasawara => ("130050".to_string(), group.label().to_string()),
            };
            out.insert(
                key.clone(),
                AreaSnapshot {
                    updated_at: doc.updated_at,
                    area: key,
                    area_name: name,
                    items: bucket::dedup_items(items),
                },
            );
        }
        out
    }

    /// Group for a requested capital-region code (office code → mainland).
    pub fn group_of_code(&self, code: &str, label: &str) -> CapitalGroup {
        if code == CAPITAL_OFFICE {
            return CapitalGroup::Mainland;
        }
        if self.areas.class10_name(code).is_some() {
            return self.areas.capital_class10_group(code);
        }
        self.areas.capital_group(code, label)
    }

    fn group_of_row(&self, row: &AreaRow) -> CapitalGroup {
        self.group_of_code(&row.code, &row.name)
    }

    fn area_label(&self, code: &str) -> Option<String> {
        self.areas
            .office_name(code)
            .or_else(|| self.areas.class10_name(code))
            .or_else(|| self.areas.class20_name(code))
            .map(str::to_string)
    }
}

fn make_item(
    area: &str,
    kind: String,
    status: Option<String>,
    severity: Severity,
    code: Option<String>,
    source: WarningSource,
) -> WarningItem {
    let mut hasher = Sha256::new();
    hasher.update(area.as_bytes());
    hasher.update(b"|");
    hasher.update(code.as_deref().unwrap_or(&kind).as_bytes());
    hasher.update(b"|");
    hasher.update(status.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{severity:?}").as_bytes());
    let id = format!("{:x}", hasher.finalize());

    WarningItem {
        id,
        kind,
        status,
        severity,
        code,
        source,
    }
}

fn flatten_levels(levels: &[UpstreamLevel]) -> Vec<i64> {
    let mut out = Vec::new();
    for lv in levels {
        for v in &lv.values {
            // Upstream serializes levels both as numbers and as strings.
            match v {
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        out.push(i);
                    }
                }
                serde_json::Value::String(s) => {
                    if let Ok(i) = s.trim().parse::<i64>() {
                        out.push(i);
                    }
                }
                _ => {}
            }
        }
    }
    out
}

fn max_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}
