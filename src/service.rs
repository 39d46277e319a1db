// src/service.rs
//! Pipeline orchestration and the public read API. Callers that have no
//! cached data get a blocking refresh-then-read; callers with any cache
//! get it immediately while a fire-and-forget refresh runs behind them.
//! Nothing here ever returns an error to a reader: failure shows up as
//! `fetch_status` + `last_error` in-band.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::area::{AreaTable, Confidence};
use crate::bucket::{Bucket, BucketEngine};
use crate::classify::ClassifyConfig;
use crate::config::Config;
use crate::dispatch::DispatchEngine;
use crate::fetch::{ConditionalFetch, FetchResult, HttpFetcher};
use crate::feed::parse_atom;
use crate::health::{self, FetchStatus};
use crate::lock::LockManager;
use crate::push::{self, DeviceRegistry, PushGateway};
use crate::quakes::{self, QuakeItem, QuakesSnapshot};
use crate::refresh::Refresher;
use crate::state::{SourceState, StateStore};
use crate::store::{paths, read_json, write_json, FileStore, SnapshotStore};
use crate::warnings::{OfficeWarnings, WarningItem, WarningNormalizer};

/// Bound on one-time detail fetches per refresh cycle.
const DETAIL_FETCH_LIMIT: usize = 20;
const NORMALIZE_LOCK_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub fetch_status: FetchStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuakesResponse {
    pub fetch_status: FetchStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub quakes: Vec<QuakeItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarningsResponse {
    pub fetch_status: FetchStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub area: String,
    pub area_name: Option<String>,
    pub confidence: Option<Confidence>,
    pub note: Option<String>,
    pub items: Vec<WarningItem>,
    pub buckets: Vec<Bucket>,
}

#[derive(Clone)]
pub struct FeedService {
    config: Config,
    store: Arc<dyn SnapshotStore>,
    locks: LockManager,
    state: StateStore,
    refresher: Refresher,
    fetcher: Arc<dyn ConditionalFetch>,
    areas: Arc<AreaTable>,
    normalizer: WarningNormalizer,
    buckets: BucketEngine,
}

impl FeedService {
    pub fn new(
        config: Config,
        store: Arc<dyn SnapshotStore>,
        fetcher: Arc<dyn ConditionalFetch>,
    ) -> Self {
        let locks = LockManager::new(store.clone());
        let state = StateStore::new(store.clone(), locks.clone());
        let refresher = Refresher::new(store.clone(), state.clone(), locks.clone(), fetcher.clone());
        let areas = Arc::new(AreaTable::load_from_file(&config.area_table_path));
        let rules = Arc::new(ClassifyConfig::load_from_file(&config.classify_path));
        let normalizer = WarningNormalizer::new(areas.clone(), rules);
        let buckets = BucketEngine::new(config.bucket_scheme);

        Self {
            config,
            store,
            locks,
            state,
            refresher,
            fetcher,
            areas,
            normalizer,
            buckets,
        }
    }

    /// File-backed service with the real HTTP fetcher.
    pub fn from_config(config: Config) -> Self {
        let store = Arc::new(FileStore::new(&config.data_dir)) as Arc<dyn SnapshotStore>;
        let fetcher = Arc::new(HttpFetcher::new()) as Arc<dyn ConditionalFetch>;
        Self::new(config, store, fetcher)
    }

    pub fn areas(&self) -> Arc<AreaTable> {
        self.areas.clone()
    }

    // --- public read API ---

    pub fn get_status(&self) -> StatusResponse {
        let st = self.state.read();
        let mut states: Vec<SourceState> = Vec::new();

        // Configured sources count even before their first state write:
        // a source that never ran is degraded, not invisible.
        let mut required: Vec<_> = self.config.feed_specs();
        required.push(self.config.quake_list_spec());
        for spec in &required {
            states.push(
                st.source(&spec.name)
                    .cloned()
                    .unwrap_or_else(|| SourceState::new(&spec.url, spec.refresh_interval_ms)),
            );
        }
        // Dynamic per-office warning sources, as far as they exist.
        for (name, src) in &st.sources {
            if name.starts_with("warning:") {
                states.push(src.clone());
            }
        }

        let h = health::aggregate(states.iter());
        StatusResponse {
            fetch_status: h.fetch_status,
            updated_at: h.updated_at,
            last_error: h.last_error,
        }
    }

    pub async fn get_quakes(&self) -> QuakesResponse {
        let snapshot = self.ensure_quakes().await;
        let st = self.state.read();
        let quake_states: Vec<SourceState> = ["eqvol", "quake-list"]
            .iter()
            .filter_map(|n| st.source(n).cloned())
            .collect();
        let h = health::aggregate(quake_states.iter());

        let updated_at = snapshot.as_ref().and_then(|s| s.updated_at).or(h.updated_at);
        let fetch_status = if updated_at.is_none() || h.last_error.is_some() {
            FetchStatus::Degraded
        } else {
            h.fetch_status
        };

        QuakesResponse {
            fetch_status,
            updated_at,
            last_error: h.last_error,
            quakes: snapshot.map(|s| s.items).unwrap_or_default(),
        }
    }

    pub async fn get_warnings(&self, area_code: &str) -> WarningsResponse {
        let Some(office) = self.areas.office_of(area_code).map(str::to_string) else {
            return WarningsResponse {
                fetch_status: FetchStatus::Degraded,
                updated_at: None,
                last_error: Some(format!("unknown area code {area_code}")),
                area: area_code.to_string(),
                area_name: None,
                confidence: None,
                note: Some("area code not in the area table".into()),
                items: Vec::new(),
                buckets: Vec::new(),
            };
        };

        let doc = self.ensure_warnings(&office).await;
        let source_state = self
            .state
            .read()
            .source(&format!("warning:{office}"))
            .cloned();
        let last_error = source_state.as_ref().and_then(|s| s.last_error.clone());

        let Some(doc) = doc else {
            return WarningsResponse {
                fetch_status: FetchStatus::Degraded,
                updated_at: None,
                last_error,
                area: area_code.to_string(),
                area_name: self.areas.office_name(&office).map(str::to_string),
                confidence: None,
                note: Some("no data fetched yet".into()),
                items: Vec::new(),
                buckets: Vec::new(),
            };
        };

        let resolved = self.normalizer.area_snapshot(&doc, area_code);
        let (snap, resolution) = match resolved {
            Some(v) => v,
            None => {
                return WarningsResponse {
                    fetch_status: FetchStatus::Degraded,
                    updated_at: doc.updated_at,
                    last_error,
                    area: area_code.to_string(),
                    area_name: self.areas.office_name(&office).map(str::to_string),
                    confidence: None,
                    note: Some(format!("{area_code} not resolvable in upstream data")),
                    items: Vec::new(),
                    buckets: Vec::new(),
                };
            }
        };

        // Title-derived documents are coarse by construction.
        let (confidence, note) = if doc.derived_from_titles {
            (
                Confidence::Low,
                format!("{}; derived from feed entry titles", resolution.note),
            )
        } else {
            (resolution.confidence(), resolution.note.clone())
        };

        let fetch_status = if doc.updated_at.is_none() || last_error.is_some() {
            FetchStatus::Degraded
        } else {
            FetchStatus::Ok
        };

        WarningsResponse {
            fetch_status,
            updated_at: doc.updated_at,
            last_error,
            area: area_code.to_string(),
            area_name: Some(snap.area_name.clone()),
            confidence: Some(confidence),
            note: Some(note),
            buckets: self.buckets.bucket(snap.items.clone()),
            items: snap.items,
        }
    }

    // --- freshness orchestration ---

    /// Blocking refresh when no cache exists; otherwise serve the cache
    /// and refresh in the background.
    async fn ensure_quakes(&self) -> Option<QuakesSnapshot> {
        let cached = read_json::<QuakesSnapshot>(self.store.as_ref(), &paths::quakes());
        match cached {
            Some(snapshot) => {
                let svc = self.clone();
                tokio::spawn(async move { svc.refresh_quakes_pipeline().await });
                Some(snapshot)
            }
            None => {
                self.refresh_quakes_pipeline().await;
                read_json::<QuakesSnapshot>(self.store.as_ref(), &paths::quakes())
            }
        }
    }

    async fn ensure_warnings(&self, office: &str) -> Option<OfficeWarnings> {
        let path = paths::warnings(office);
        let cached = read_json::<OfficeWarnings>(self.store.as_ref(), &path);
        match cached {
            Some(doc) => {
                let svc = self.clone();
                let office = office.to_string();
                tokio::spawn(async move { svc.refresh_warnings_pipeline(&office).await });
                Some(doc)
            }
            None => {
                self.refresh_warnings_pipeline(office).await;
                read_json::<OfficeWarnings>(self.store.as_ref(), &path)
            }
        }
    }

    /// Fetch + normalize the quake sources. Runs single-flight under its
    /// own lock; a contended call simply lets the other worker finish.
    pub async fn refresh_quakes_pipeline(&self) {
        let svc = self.clone();
        self.locks
            .run_exclusive(
                "normalize:quakes",
                Duration::seconds(NORMALIZE_LOCK_TTL_SECS),
                || async move { svc.refresh_quakes_locked().await },
            )
            .await;
    }

    async fn refresh_quakes_locked(&self) {
        let eqvol = self
            .config
            .feed_specs()
            .into_iter()
            .find(|s| s.name == "eqvol");
        if let Some(spec) = &eqvol {
            self.refresher.refresh(spec).await;
        }
        let list_spec = self.config.quake_list_spec();
        self.refresher.refresh(&list_spec).await;

        // Pull-feed side, enriched by one-time detail fetches.
        let mut feed_items = Vec::new();
        let mut feed_updated = None;
        if let Some(spec) = &eqvol {
            if let Some(raw) = self.store.read(&spec.raw_path) {
                let parsed = parse_atom(&String::from_utf8_lossy(&raw));
                feed_updated = parsed.feed_updated_at;
                let entries: Vec<_> = parsed
                    .entries
                    .into_iter()
                    .filter(|e| quakes::is_quake_entry(&e.title) && !quakes::is_preliminary(&e.title))
                    .take(DETAIL_FETCH_LIMIT)
                    .collect();
                for entry in entries {
                    if let Some(detail) = self.detail_document(&entry.id, entry.link.as_deref()).await
                    {
                        if let Some(item) = quakes::parse_detail(&entry, &detail) {
                            feed_items.push(item);
                        }
                    }
                }
            }
        }

        // Polled-JSON side.
        let mut web_items = Vec::new();
        if let Some(raw) = self.store.read(&list_spec.raw_path) {
            match quakes::parse_webjson(&String::from_utf8_lossy(&raw)) {
                Ok(items) => web_items = items,
                Err(e) => {
                    counter!("normalize_parse_errors_total").increment(1);
                    tracing::warn!(error = ?e, "quake list unparsable, keeping previous data");
                }
            }
        }

        let list_success = self
            .state
            .read()
            .source("quake-list")
            .and_then(|s| s.last_success_at);
        let updated_at = match (feed_updated, list_success) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let previous = read_json::<QuakesSnapshot>(self.store.as_ref(), &paths::quakes());
        let merged = quakes::merge(feed_items, web_items, updated_at, previous);
        counter!("normalize_items_total").increment(merged.items.len() as u64);

        if let Err(e) = write_json(self.store.as_ref(), &paths::quakes(), &merged) {
            tracing::warn!(error = ?e, "quake snapshot write failed");
        }
        self.write_status_snapshot();
    }

    /// Committed status document, refreshed after every cycle so external
    /// consumers can read the summary without touching the state store.
    fn write_status_snapshot(&self) {
        let status = self.get_status();
        if let Err(e) = write_json(self.store.as_ref(), &paths::status(), &status) {
            tracing::warn!(error = ?e, "status snapshot write failed");
        }
        gauge!("pipeline_last_refresh_ts").set(Utc::now().timestamp() as f64);
    }

    /// One-time detail fetch, cached under a content hash of the entry id.
    async fn detail_document(&self, entry_id: &str, link: Option<&str>) -> Option<String> {
        let link = link?;
        let mut hasher = Sha256::new();
        hasher.update(entry_id.as_bytes());
        let path = paths::quake_detail(&format!("{:x}", hasher.finalize()));

        if let Some(bytes) = self.store.read(&path) {
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        match self.fetcher.fetch(link, None, None).await {
            Ok(FetchResult::Fresh { body, .. }) => {
                if let Err(e) = self.store.write_atomic(&path, body.as_bytes()) {
                    tracing::warn!(error = ?e, "detail cache write failed");
                }
                Some(body)
            }
            Ok(FetchResult::NotModified) => None,
            Err(e) => {
                tracing::warn!(error = ?e, link, "detail fetch failed");
                None
            }
        }
    }

    pub async fn refresh_warnings_pipeline(&self, office: &str) {
        let svc = self.clone();
        let office_owned = office.to_string();
        let out = self
            .locks
            .run_exclusive(
                &format!("normalize:warnings:{office}"),
                Duration::seconds(NORMALIZE_LOCK_TTL_SECS),
                || async move { svc.refresh_warnings_locked(&office_owned).await },
            )
            .await;
        if out.executed {
            self.write_status_snapshot();
        }
    }

    async fn refresh_warnings_locked(&self, office: &str) {
        let spec = self.config.warning_spec(office);
        self.refresher.refresh(&spec).await;

        let path = paths::warnings(office);
        if let Some(raw) = self.store.read(&spec.raw_path) {
            match self
                .normalizer
                .normalize_office(office, &String::from_utf8_lossy(&raw))
            {
                Ok(doc) => {
                    let total: usize = doc.rows.values().map(|r| r.items.len()).sum();
                    counter!("normalize_items_total").increment(total as u64);
                    if let Err(e) = write_json(self.store.as_ref(), &path, &doc) {
                        tracing::warn!(error = ?e, office, "warning snapshot write failed");
                    }
                    return;
                }
                Err(e) => {
                    counter!("normalize_parse_errors_total").increment(1);
                    tracing::warn!(error = ?e, office, "warning doc unparsable, keeping previous");
                    if self.store.exists(&path) {
                        return;
                    }
                }
            }
        }

        // No webjson document at all: derive a coarse snapshot from feed
        // titles, but never overwrite an existing normalized document
        // with title-level data.
        if self.store.exists(&path) {
            return;
        }
        let mut entries = Vec::new();
        for spec in self.config.feed_specs() {
            if spec.name == "eqvol" {
                continue;
            }
            self.refresher.refresh(&spec).await;
            if let Some(raw) = self.store.read(&spec.raw_path) {
                entries.extend(parse_atom(&String::from_utf8_lossy(&raw)).entries);
            }
        }
        if entries.is_empty() {
            return;
        }
        let doc = self.normalizer.normalize_from_titles(office, &entries);
        if let Err(e) = write_json(self.store.as_ref(), &path, &doc) {
            tracing::warn!(error = ?e, office, "title fallback write failed");
        }
    }

    // --- push dispatch ---

    /// Run one dispatch cycle against the externally-owned device
    /// registry and gateway. Pure policy lives in `dispatch`; this wires
    /// snapshots in and reconciles the gateway report back out.
    pub async fn dispatch_cycle(
        &self,
        registry: &dyn DeviceRegistry,
        gateway: &dyn PushGateway,
    ) -> anyhow::Result<usize> {
        let devices = registry.load_devices().await?;

        // Current warning buckets for every office any device watches.
        let mut offices: HashSet<String> = HashSet::new();
        for device in &devices {
            for cell in &device.subscribed_cells {
                if let Some(office) = self.areas.office_for_pref(&cell.pref_code) {
                    offices.insert(office.to_string());
                }
            }
        }
        let mut warnings_by_area = BTreeMap::new();
        for office in offices {
            if let Some(doc) = self.ensure_warnings(&office).await {
                warnings_by_area.extend(self.normalizer.group_snapshots(&doc));
            }
        }

        let quakes = self.ensure_quakes().await.unwrap_or_default();

        let engine = DispatchEngine::new(self.areas.clone());
        let outcome = engine.dispatch(&devices, &warnings_by_area, &quakes, Utc::now());
        let sent = outcome.messages.len();
        counter!("dispatch_sent_total").increment(sent as u64);

        let report = push::send_all(gateway, &outcome.messages, self.config.push.batch_size).await;
        if !report.invalid_tokens.is_empty() {
            counter!("dispatch_invalid_tokens_total")
                .increment(report.invalid_tokens.len() as u64);
            registry.remove_tokens(&report.invalid_tokens).await?;
        }
        for (device_id, map) in &outcome.updated {
            registry.save_last_notified(device_id, map).await?;
        }

        tracing::info!(
            sent,
            invalid = report.invalid_tokens.len(),
            errors = report.errors.len(),
            "dispatch cycle finished"
        );
        Ok(sent)
    }
}
