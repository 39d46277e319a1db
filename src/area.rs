// src/area.rs
//! Area code hierarchy: office (prefecture scale) → class10 (forecast
//! sub-area) → class20 (municipality). Requested codes are resolved
//! against whatever granularity the upstream document actually carries,
//! and the fallback tier is reported as a confidence signal so callers
//! know when data is coarser than requested.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Capital-region office. Its office-level document is split into three
/// independently-warned groups: mainland and two island chains.
pub const CAPITAL_OFFICE: &str = "130000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTier {
    Exact,
    Class10Ancestor,
    OfficeLevel,
}

impl FallbackTier {
    pub fn confidence(self) -> Confidence {
        match self {
            FallbackTier::Exact => Confidence::High,
            FallbackTier::Class10Ancestor | FallbackTier::OfficeLevel => Confidence::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapitalGroup {
    Mainland,
    IzuIslands,
    Ogasawara,
}

impl CapitalGroup {
    pub fn label(self) -> &'static str {
        match self {
            CapitalGroup::Mainland => "東京地方",
            CapitalGroup::IzuIslands => "伊豆諸島",
            CapitalGroup::Ogasawara => "小笠原諸島",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub code_used: String,
    pub tier: FallbackTier,
    pub note: String,
}

impl Resolution {
    pub fn confidence(&self) -> Confidence {
        self.tier.confidence()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AreaTable {
    /// office code → display name
    #[serde(default)]
    offices: HashMap<String, String>,
    /// class10 code → (name, office)
    #[serde(default)]
    class10: HashMap<String, Class10Def>,
    /// class20 code → (name, class10)
    #[serde(default)]
    class20: HashMap<String, Class20Def>,
    /// explicit class20 → capital group assignments
    #[serde(default)]
    capital_groups: HashMap<String, CapitalGroup>,
    /// capital class10 → group (drives the three-way snapshot split)
    #[serde(default)]
    capital_class10_groups: HashMap<String, CapitalGroup>,
    /// island municipality name fragments → group
    #[serde(default)]
    island_hints: Vec<(String, CapitalGroup)>,
}

#[derive(Debug, Clone, Deserialize)]
struct Class10Def {
    name: String,
    office: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Class20Def {
    name: String,
    class10: String,
}

impl AreaTable {
    /// Load from a JSON file, falling back to the built-in seed.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|_| Self::default_seed()),
            Err(_) => Self::default_seed(),
        }
    }

    pub fn office_name(&self, office: &str) -> Option<&str> {
        self.offices.get(office).map(String::as_str)
    }

    pub fn class10_name(&self, code: &str) -> Option<&str> {
        self.class10.get(code).map(|d| d.name.as_str())
    }

    pub fn class20_name(&self, code: &str) -> Option<&str> {
        self.class20.get(code).map(|d| d.name.as_str())
    }

    pub fn class10_of(&self, class20: &str) -> Option<&str> {
        self.class20.get(class20).map(|d| d.class10.as_str())
    }

    /// Walk any known code up to its office.
    pub fn office_of(&self, code: &str) -> Option<&str> {
        if self.offices.contains_key(code) {
            return self.offices.get_key_value(code).map(|(k, _)| k.as_str());
        }
        if let Some(c10) = self.class10.get(code) {
            return Some(c10.office.as_str());
        }
        let c10 = self.class10_of(code)?;
        self.class10.get(c10).map(|d| d.office.as_str())
    }

    /// Office for a prefecture code, e.g. "13" → "130000". Used when a
    /// subscribed cell carries only the prefecture.
    pub fn office_for_pref(&self, pref_code: &str) -> Option<&str> {
        self.offices
            .keys()
            .find(|o| o.starts_with(pref_code))
            .map(String::as_str)
    }

    /// Resolve `requested` against the area codes actually present in an
    /// upstream document. `None` means not even the office entry exists
    /// upstream, and the caller must fall back to feed titles.
    pub fn resolve_in(&self, requested: &str, available: &HashSet<String>) -> Option<Resolution> {
        if available.contains(requested) {
            return Some(Resolution {
                code_used: requested.to_string(),
                tier: FallbackTier::Exact,
                note: format!("exact match for {requested}"),
            });
        }

        if let Some(c10) = self.class10_of(requested) {
            if available.contains(c10) {
                return Some(Resolution {
                    code_used: c10.to_string(),
                    tier: FallbackTier::Class10Ancestor,
                    note: format!("{requested} absent upstream; used class10 ancestor {c10}"),
                });
            }
        }

        if let Some(office) = self.office_of(requested) {
            if available.contains(office) {
                return Some(Resolution {
                    code_used: office.to_string(),
                    tier: FallbackTier::OfficeLevel,
                    note: format!("{requested} absent upstream; used office entry {office}"),
                });
            }
        }

        None
    }

    /// Capital-region group for a class20 code and its label: explicit
    /// table first, then island-name substring, then mainland.
    pub fn capital_group(&self, class20: &str, label: &str) -> CapitalGroup {
        if let Some(g) = self.capital_groups.get(class20) {
            return *g;
        }
        for (fragment, group) in &self.island_hints {
            if label.contains(fragment.as_str()) {
                return *group;
            }
        }
        CapitalGroup::Mainland
    }

    /// Group for a capital class10 code; non-capital codes read mainland.
    pub fn capital_class10_group(&self, class10: &str) -> CapitalGroup {
        self.capital_class10_groups
            .get(class10)
            .copied()
            .unwrap_or(CapitalGroup::Mainland)
    }

    pub fn default_seed() -> Self {
        let mut offices = HashMap::new();
        offices.insert("130000".into(), "東京都".into());
        offices.insert("270000".into(), "大阪府".into());
        offices.insert("400000".into(), "福岡県".into());
        offices.insert("220000".into(), "静岡県".into());

        let mut class10 = HashMap::new();
        let mut c10 = |code: &str, name: &str, office: &str| {
            class10.insert(
                code.to_string(),
                Class10Def {
                    name: name.into(),
                    office: office.into(),
                },
            );
        };
        c10("130010", "東京地方", "130000");
        c10("130030", "伊豆諸島北部", "130000");
        c10("130040", "伊豆諸島南部", "130000");
        c10("130050", "小笠原諸島", "130000");
        c10("270010", "大阪地方", "270000");
        c10("400010", "福岡地方", "400000");
        c10("220010", "中部", "220000");

        let mut class20 = HashMap::new();
        let mut c20 = |code: &str, name: &str, class10: &str| {
            class20.insert(
                code.to_string(),
                Class20Def {
                    name: name.into(),
                    class10: class10.into(),
                },
            );
        };
        c20("1310100", "千代田区", "130010");
        c20("1320100", "八王子市", "130010");
        c20("1336100", "大島町", "130030");
        c20("1338100", "三宅村", "130040");
        c20("1342100", "八丈町", "130040");
        c20("1342200", "青ヶ島村", "130040");
        c20("1342101", "小笠原村", "130050");
        c20("2710000", "大阪市", "270010");
        c20("4013000", "福岡市", "400010");

        let mut capital_groups = HashMap::new();
        capital_groups.insert("1336100".to_string(), CapitalGroup::IzuIslands);
        capital_groups.insert("1338100".to_string(), CapitalGroup::IzuIslands);
        capital_groups.insert("1342100".to_string(), CapitalGroup::IzuIslands);
        capital_groups.insert("1342200".to_string(), CapitalGroup::IzuIslands);
        capital_groups.insert("1342101".to_string(), CapitalGroup::Ogasawara);

        let mut capital_class10_groups = HashMap::new();
        capital_class10_groups.insert("130010".to_string(), CapitalGroup::Mainland);
        capital_class10_groups.insert("130030".to_string(), CapitalGroup::IzuIslands);
        capital_class10_groups.insert("130040".to_string(), CapitalGroup::IzuIslands);
        capital_class10_groups.insert("130050".to_string(), CapitalGroup::Ogasawara);

        let island_hints = vec![
            ("大島".to_string(), CapitalGroup::IzuIslands),
            ("利島".to_string(), CapitalGroup::IzuIslands),
            ("新島".to_string(), CapitalGroup::IzuIslands),
            ("神津島".to_string(), CapitalGroup::IzuIslands),
            ("三宅".to_string(), CapitalGroup::IzuIslands),
            ("御蔵島".to_string(), CapitalGroup::IzuIslands),
            ("八丈".to_string(), CapitalGroup::IzuIslands),
            ("青ヶ島".to_string(), CapitalGroup::IzuIslands),
            ("小笠原".to_string(), CapitalGroup::Ogasawara),
            ("父島".to_string(), CapitalGroup::Ogasawara),
            ("母島".to_string(), CapitalGroup::Ogasawara),
        ];

        Self {
            offices,
            class10,
            class20,
            capital_groups,
            capital_class10_groups,
            island_hints,
        }
    }
}
