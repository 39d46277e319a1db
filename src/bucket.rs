// src/bucket.rs
//! Bucketing/dedup engine: groups normalized warning items by kind,
//! collapses phase variants of the same hazard, and classifies the
//! result into three tiers. Two tier schemes exist upstream; one is
//! selected per pipeline instance and never mixed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::classify::Severity;
use crate::warnings::WarningItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketScheme {
    /// special / warning / advisory
    SeverityTier,
    /// urgent / advisory / reference
    UrgencyTier,
}

impl BucketScheme {
    pub fn tier_label(self, severity: Severity) -> &'static str {
        match (self, severity) {
            (BucketScheme::SeverityTier, Severity::Special) => "special",
            (BucketScheme::SeverityTier, Severity::Warning) => "warning",
            (BucketScheme::SeverityTier, Severity::Advisory) => "advisory",
            (BucketScheme::UrgencyTier, Severity::Special) => "urgent",
            (BucketScheme::UrgencyTier, Severity::Warning) => "advisory",
            (BucketScheme::UrgencyTier, Severity::Advisory) => "reference",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindGroup {
    pub kind: String,
    pub severity: Severity,
    /// Best phase variant for display ("continuing" beats "announced").
    pub representative: WarningItem,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    pub tier: &'static str,
    pub severity: Severity,
    pub groups: Vec<KindGroup>,
}

/// Stable dedup key: explicit upstream code when present, otherwise
/// (status, kind). Phases of the same coded hazard share the code, so
/// "announced" and "continuing" collapse to one item.
fn dedup_key(item: &WarningItem) -> String {
    match &item.code {
        Some(code) => format!("code:{code}"),
        None => format!(
            "kindstatus:{}:{}",
            item.status.as_deref().unwrap_or(""),
            item.kind
        ),
    }
}

/// Rank for picking the surviving variant: any status beats none, and
/// "継続" beats "発表".
fn phase_rank(item: &WarningItem) -> u8 {
    match item.status.as_deref() {
        None => 0,
        Some("継続") => 2,
        Some(_) => 1,
    }
}

/// Collapse duplicates, keeping the more informative variant per key.
/// First-seen order is preserved.
pub fn dedup_items(items: Vec<WarningItem>) -> Vec<WarningItem> {
    let mut order: Vec<String> = Vec::new();
    let mut best: BTreeMap<String, WarningItem> = BTreeMap::new();

    for item in items {
        let key = dedup_key(&item);
        match best.get(&key) {
            None => {
                order.push(key.clone());
                best.insert(key, item);
            }
            Some(existing) if phase_rank(&item) > phase_rank(existing) => {
                best.insert(key, item);
            }
            Some(_) => {}
        }
    }

    order.into_iter().filter_map(|k| best.remove(&k)).collect()
}

#[derive(Clone)]
pub struct BucketEngine {
    scheme: BucketScheme,
}

impl BucketEngine {
    pub fn new(scheme: BucketScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> BucketScheme {
        self.scheme
    }

    /// Dedup, group by kind, then tier by severity (most severe first).
    pub fn bucket(&self, items: Vec<WarningItem>) -> Vec<Bucket> {
        let deduped = dedup_items(items);

        let mut groups: BTreeMap<String, Vec<WarningItem>> = BTreeMap::new();
        for item in deduped {
            groups.entry(item.kind.clone()).or_default().push(item);
        }

        let mut tiers: BTreeMap<Severity, Vec<KindGroup>> = BTreeMap::new();
        for (kind, variants) in groups {
            let severity = variants
                .iter()
                .map(|i| i.severity)
                .max()
                .unwrap_or(Severity::Advisory);
            let representative = variants
                .iter()
                .max_by_key(|i| phase_rank(i))
                .cloned()
                .unwrap_or_else(|| variants[0].clone());
            tiers.entry(severity).or_default().push(KindGroup {
                kind,
                severity,
                count: variants.len(),
                representative,
            });
        }

        tiers
            .into_iter()
            .rev()
            .map(|(severity, groups)| Bucket {
                tier: self.scheme.tier_label(severity),
                severity,
                groups,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warnings::WarningSource;

    fn item(kind: &str, status: Option<&str>, sev: Severity, code: Option<&str>) -> WarningItem {
        WarningItem {
            id: format!("{kind}-{status:?}-{code:?}"),
            kind: kind.to_string(),
            status: status.map(str::to_string),
            severity: sev,
            code: code.map(str::to_string),
            source: WarningSource::Webjson,
        }
    }

    #[test]
    fn identical_item_twice_dedups_to_one() {
        let a = item("大雨警報", Some("発表"), Severity::Warning, Some("03"));
        let out = dedup_items(vec![a.clone(), a]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn phases_of_same_code_collapse_preferring_continuing() {
        let announced = item("大雨警報", Some("発表"), Severity::Warning, Some("03"));
        let continuing = item("大雨警報", Some("継続"), Severity::Warning, Some("03"));
        let out = dedup_items(vec![announced, continuing]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status.as_deref(), Some("継続"));
    }

    #[test]
    fn non_null_status_wins_over_null() {
        let bare = item("洪水警報", None, Severity::Warning, Some("04"));
        let phased = item("洪水警報", Some("発表"), Severity::Warning, Some("04"));
        let out = dedup_items(vec![bare, phased]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status.as_deref(), Some("発表"));
    }

    #[test]
    fn uncoded_items_key_on_status_and_kind() {
        let a = item("大雨警報", Some("発表"), Severity::Warning, None);
        let b = item("大雨警報", Some("発表"), Severity::Warning, None);
        let c = item("洪水警報", Some("発表"), Severity::Warning, None);
        let out = dedup_items(vec![a, b, c]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn buckets_order_most_severe_first() {
        let engine = BucketEngine::new(BucketScheme::SeverityTier);
        let buckets = engine.bucket(vec![
            item("雷注意報", Some("発表"), Severity::Advisory, Some("14")),
            item("大雨特別警報", Some("発表"), Severity::Special, Some("33")),
            item("暴風警報", Some("継続"), Severity::Warning, Some("05")),
        ]);
        let tiers: Vec<&str> = buckets.iter().map(|b| b.tier).collect();
        assert_eq!(tiers, vec!["special", "warning", "advisory"]);
    }

    #[test]
    fn urgency_scheme_relabels_only() {
        let engine = BucketEngine::new(BucketScheme::UrgencyTier);
        let buckets = engine.bucket(vec![
            item("大雨特別警報", Some("発表"), Severity::Special, Some("33")),
            item("雷注意報", Some("発表"), Severity::Advisory, Some("14")),
        ]);
        let tiers: Vec<&str> = buckets.iter().map(|b| b.tier).collect();
        assert_eq!(tiers, vec!["urgent", "reference"]);
        assert_eq!(buckets[0].groups[0].kind, "大雨特別警報");
    }
}
