// src/classify.rs
//! Ordered rule tables for hazard kind and severity inference:
//! code → kind, code → severity, keyword → kind, level thresholds.
//! Consolidated here (instead of scattered helpers) so the fallback
//! ladder is deterministic and testable without network access.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Advisory,
    Warning,
    Special,
}

impl Severity {
    /// Label suffix used when a kind has to be synthesized from a bare
    /// hazard keyword.
    pub fn suffix(self) -> &'static str {
        match self {
            Severity::Special => "特別警報",
            Severity::Warning => "警報",
            Severity::Advisory => "注意報",
        }
    }
}

/// Catch-all kind when nothing classifies; an item is never dropped just
/// because its kind is unknown.
pub const GENERIC_KIND: &str = "気象警報・注意報";

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyConfig {
    /// upstream warning code → full kind label
    #[serde(default)]
    code_kinds: HashMap<String, String>,
    /// upstream warning code → default severity
    #[serde(default)]
    code_severity: HashMap<String, Severity>,
    /// hazard keyword → bare hazard label, checked in order
    #[serde(default)]
    keyword_kinds: Vec<(String, String)>,
    /// max level at or above which an item is a special warning
    #[serde(default = "default_special_level")]
    special_level: i64,
    /// max level at or above which an item is a warning
    #[serde(default = "default_warning_level")]
    warning_level: i64,
}

fn default_special_level() -> i64 {
    5
}

fn default_warning_level() -> i64 {
    3
}

impl ClassifyConfig {
    /// Load from a JSON file, falling back to the built-in seed.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|_| Self::default_seed()),
            Err(_) => Self::default_seed(),
        }
    }

    /// Severity ladder: explicit marker in status/hint text, then numeric
    /// levels, then the per-code default table, then advisory.
    pub fn severity_for(
        &self,
        code: Option<&str>,
        status: Option<&str>,
        levels: &[i64],
        hint: &str,
    ) -> Severity {
        for text in [status.unwrap_or(""), hint] {
            if let Some(sev) = severity_marker(text) {
                return sev;
            }
        }

        if let Some(max) = levels.iter().max() {
            if *max >= self.special_level {
                return Severity::Special;
            }
            if *max >= self.warning_level {
                return Severity::Warning;
            }
            return Severity::Advisory;
        }

        if let Some(sev) = code.and_then(|c| self.code_severity.get(c)) {
            return *sev;
        }

        Severity::Advisory
    }

    /// Kind ladder: code table, then keyword match synthesizing a label
    /// from the hazard plus the severity suffix, then the generic label.
    pub fn kind_for(&self, code: Option<&str>, hint: &str, severity: Severity) -> String {
        if let Some(kind) = code.and_then(|c| self.code_kinds.get(c)) {
            return kind.clone();
        }
        for (keyword, hazard) in &self.keyword_kinds {
            if hint.contains(keyword.as_str()) {
                return format!("{hazard}{}", severity.suffix());
            }
        }
        GENERIC_KIND.to_string()
    }

    /// Cancelled or "nothing in effect" statuses are excluded before
    /// dedup, so they never count toward bucket totals.
    pub fn is_cleared(status: &str) -> bool {
        status.contains("解除") || status.contains("警報・注意報はなし")
    }

    pub fn default_seed() -> Self {
        let mut code_kinds = HashMap::new();
        let mut code_severity = HashMap::new();
        let mut add = |code: &str, kind: &str, sev: Severity| {
            code_kinds.insert(code.to_string(), kind.to_string());
            code_severity.insert(code.to_string(), sev);
        };

        // Special warnings
        add("32", "暴風雪特別警報", Severity::Special);
        add("33", "大雨特別警報", Severity::Special);
        add("35", "暴風特別警報", Severity::Special);
        add("36", "大雪特別警報", Severity::Special);
        add("37", "波浪特別警報", Severity::Special);
        add("38", "高潮特別警報", Severity::Special);
        // Warnings
        add("02", "暴風雪警報", Severity::Warning);
        add("03", "大雨警報", Severity::Warning);
        add("04", "洪水警報", Severity::Warning);
        add("05", "暴風警報", Severity::Warning);
        add("06", "大雪警報", Severity::Warning);
        add("07", "波浪警報", Severity::Warning);
        add("08", "高潮警報", Severity::Warning);
        // Advisories
        add("10", "大雨注意報", Severity::Advisory);
        add("12", "大雪注意報", Severity::Advisory);
        add("13", "風雪注意報", Severity::Advisory);
        add("14", "雷注意報", Severity::Advisory);
        add("15", "強風注意報", Severity::Advisory);
        add("16", "波浪注意報", Severity::Advisory);
        add("18", "洪水注意報", Severity::Advisory);
        add("19", "高潮注意報", Severity::Advisory);
        add("20", "濃霧注意報", Severity::Advisory);
        add("21", "乾燥注意報", Severity::Advisory);
        add("22", "なだれ注意報", Severity::Advisory);
        add("23", "低温注意報", Severity::Advisory);
        add("24", "霜注意報", Severity::Advisory);
        add("25", "着氷注意報", Severity::Advisory);
        add("26", "着雪注意報", Severity::Advisory);

        let keyword_kinds = [
            ("大雨", "大雨"),
            ("洪水", "洪水"),
            ("暴風雪", "暴風雪"),
            ("暴風", "暴風"),
            ("大雪", "大雪"),
            ("風雪", "風雪"),
            ("波浪", "波浪"),
            ("高潮", "高潮"),
            ("雷", "雷"),
            ("強風", "強風"),
            ("濃霧", "濃霧"),
            ("乾燥", "乾燥"),
            ("なだれ", "なだれ"),
            ("低温", "低温"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            code_kinds,
            code_severity,
            keyword_kinds,
            special_level: default_special_level(),
            warning_level: default_warning_level(),
        }
    }
}

/// Explicit severity markers in free text. Checked longest-first because
/// "特別警報" contains "警報".
fn severity_marker(text: &str) -> Option<Severity> {
    if text.contains("特別警報") {
        return Some(Severity::Special);
    }
    if text.contains("警報") {
        return Some(Severity::Warning);
    }
    if text.contains("注意報") {
        return Some(Severity::Advisory);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_supports_escalation_compare() {
        assert!(Severity::Special > Severity::Warning);
        assert!(Severity::Warning > Severity::Advisory);
    }

    #[test]
    fn status_marker_beats_levels_and_code() {
        let c = ClassifyConfig::default_seed();
        // Code 10 defaults to advisory, levels say warning, but the
        // status text carries an explicit special marker.
        let sev = c.severity_for(Some("10"), Some("大雨特別警報に切替"), &[3], "");
        assert_eq!(sev, Severity::Special);
    }

    #[test]
    fn level_thresholds_split_three_tiers() {
        let c = ClassifyConfig::default_seed();
        assert_eq!(c.severity_for(None, Some("発表"), &[5], ""), Severity::Special);
        assert_eq!(c.severity_for(None, Some("発表"), &[2, 4], ""), Severity::Warning);
        assert_eq!(c.severity_for(None, Some("発表"), &[1, 2], ""), Severity::Advisory);
    }

    #[test]
    fn code_default_when_no_marker_or_levels() {
        let c = ClassifyConfig::default_seed();
        assert_eq!(c.severity_for(Some("33"), Some("発表"), &[], ""), Severity::Special);
        assert_eq!(c.severity_for(Some("03"), Some("継続"), &[], ""), Severity::Warning);
        assert_eq!(c.severity_for(Some("14"), None, &[], ""), Severity::Advisory);
        assert_eq!(c.severity_for(Some("99"), None, &[], ""), Severity::Advisory);
    }

    #[test]
    fn kind_ladder_code_keyword_generic() {
        let c = ClassifyConfig::default_seed();
        assert_eq!(c.kind_for(Some("03"), "", Severity::Warning), "大雨警報");
        assert_eq!(
            c.kind_for(None, "東京地方に大雨のおそれ", Severity::Warning),
            "大雨警報"
        );
        assert_eq!(
            c.kind_for(None, "なにかの現象", Severity::Advisory),
            GENERIC_KIND
        );
    }

    #[test]
    fn cleared_statuses_detected() {
        assert!(ClassifyConfig::is_cleared("解除"));
        assert!(ClassifyConfig::is_cleared("発表警報・注意報はなし"));
        assert!(!ClassifyConfig::is_cleared("継続"));
        assert!(!ClassifyConfig::is_cleared("発表"));
    }
}
