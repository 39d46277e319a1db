// src/config.rs
//! Service configuration: feed endpoints, polling intervals, data
//! directory and push gateway. Load order: $BOUSAI_CONFIG_PATH, then
//! config/bousai.toml, then built-in defaults; a couple of env vars
//! override on top for deployment convenience.

use std::path::PathBuf;

use serde::Deserialize;

use crate::bucket::BucketScheme;
use crate::refresh::SourceSpec;
use crate::store::paths;

const ENV_CONFIG_PATH: &str = "BOUSAI_CONFIG_PATH";
const ENV_DATA_DIR: &str = "BOUSAI_DATA_DIR";
const ENV_PUSH_GATEWAY_URL: &str = "BOUSAI_PUSH_GATEWAY_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSpec {
    pub url: String,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedsConfig {
    pub regular: FeedSpec,
    pub extra: FeedSpec,
    pub eqvol: FeedSpec,
    pub other: FeedSpec,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        let feed = |name: &str, interval_secs: u64| FeedSpec {
            url: format!("https://www.data.jma.go.jp/developer/xml/feed/{name}.xml"),
            interval_secs,
        };
        Self {
            regular: feed("regular", 90),
            extra: feed("extra", 60),
            eqvol: feed("eqvol", 60),
            other: feed("other", 300),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsConfig {
    pub quake_list_url: String,
    pub quake_list_interval_secs: u64,
    /// `{office}` is substituted with the office code.
    pub warning_url_template: String,
    pub warning_interval_secs: u64,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            quake_list_url: "https://www.jma.go.jp/bosai/quake/data/list.json".into(),
            quake_list_interval_secs: 120,
            warning_url_template: "https://www.jma.go.jp/bosai/warning/data/warning/{office}.json"
                .into(),
            warning_interval_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub gateway_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            gateway_url: None,
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default = "default_bucket_scheme")]
    pub bucket_scheme: BucketScheme,
    #[serde(default = "default_area_table_path")]
    pub area_table_path: String,
    #[serde(default = "default_classify_path")]
    pub classify_path: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_bucket_scheme() -> BucketScheme {
    BucketScheme::SeverityTier
}

fn default_area_table_path() -> String {
    "config/areas.json".to_string()
}

fn default_classify_path() -> String {
    "config/classify.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            feeds: FeedsConfig::default(),
            endpoints: EndpointsConfig::default(),
            push: PushConfig::default(),
            bucket_scheme: default_bucket_scheme(),
            area_table_path: default_area_table_path(),
            classify_path: default_classify_path(),
        }
    }
}

impl Config {
    /// Load using env var + fallbacks; unreadable or invalid files fall
    /// back to defaults rather than failing startup.
    pub fn load() -> Self {
        let mut cfg = Self::load_file().unwrap_or_default();
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            cfg.data_dir = dir;
        }
        if let Ok(url) = std::env::var(ENV_PUSH_GATEWAY_URL) {
            cfg.push.gateway_url = Some(url);
        }
        cfg
    }

    fn load_file() -> Option<Self> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/bousai.toml"));
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::warn!(error = %e, "config file invalid, using defaults");
                None
            }
        }
    }

    pub fn warning_url(&self, office: &str) -> String {
        self.endpoints
            .warning_url_template
            .replace("{office}", office)
    }

    pub fn feed_specs(&self) -> Vec<SourceSpec> {
        [
            ("regular", &self.feeds.regular),
            ("extra", &self.feeds.extra),
            ("eqvol", &self.feeds.eqvol),
            ("other", &self.feeds.other),
        ]
        .into_iter()
        .map(|(name, feed)| SourceSpec {
            name: name.to_string(),
            url: feed.url.clone(),
            refresh_interval_ms: feed.interval_secs * 1000,
            raw_path: paths::raw_feed(name),
        })
        .collect()
    }

    pub fn quake_list_spec(&self) -> SourceSpec {
        SourceSpec {
            name: "quake-list".into(),
            url: self.endpoints.quake_list_url.clone(),
            refresh_interval_ms: self.endpoints.quake_list_interval_secs * 1000,
            raw_path: "raw/quake-list.json".into(),
        }
    }

    pub fn warning_spec(&self, office: &str) -> SourceSpec {
        SourceSpec {
            name: format!("warning:{office}"),
            url: self.warning_url(office),
            refresh_interval_ms: self.endpoints.warning_interval_secs * 1000,
            raw_path: format!("raw/warning-{office}.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_four_feeds() {
        let cfg = Config::default();
        let specs = cfg.feed_specs();
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().any(|s| s.name == "eqvol"));
        assert!(specs.iter().all(|s| s.refresh_interval_ms >= 60_000));
    }

    #[test]
    fn warning_url_substitutes_office() {
        let cfg = Config::default();
        assert!(cfg.warning_url("130000").ends_with("/warning/130000.json"));
        assert_eq!(cfg.warning_spec("130000").name, "warning:130000");
    }

    #[serial_test::serial]
    #[test]
    fn env_overrides_apply_on_top() {
        std::env::set_var(ENV_DATA_DIR, "/tmp/bousai-data");
        std::env::set_var(ENV_PUSH_GATEWAY_URL, "https://gw.test/push");
        let cfg = Config::load();
        assert_eq!(cfg.data_dir, "/tmp/bousai-data");
        assert_eq!(cfg.push.gateway_url.as_deref(), Some("https://gw.test/push"));
        std::env::remove_var(ENV_DATA_DIR);
        std::env::remove_var(ENV_PUSH_GATEWAY_URL);
    }

    #[test]
    fn toml_overrides_merge_over_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/bousai"
            bucket_scheme = "urgency_tier"

            [endpoints]
            quake_list_url = "https://mirror.test/quake.json"
            quake_list_interval_secs = 30
            warning_url_template = "https://mirror.test/warning/{office}.json"
            warning_interval_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, "/var/lib/bousai");
        assert_eq!(cfg.bucket_scheme, BucketScheme::UrgencyTier);
        assert_eq!(cfg.quake_list_spec().refresh_interval_ms, 30_000);
        // Unlisted sections keep defaults.
        assert_eq!(cfg.feeds.regular.interval_secs, 90);
    }
}
