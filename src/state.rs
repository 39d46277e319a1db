// src/state.rs
//! Durable per-source polling state: last attempt/success, last error and
//! HTTP cache validators. One JSON document for the whole pipeline,
//! mutated only under the lock manager. Reads are lock-free and return
//! whatever is currently committed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::LockManager;
use crate::store::{paths, read_json, write_json, SnapshotStore};

pub const STATE_VERSION: u32 = 1;

// Tuning knobs, not semantics: bounded lock retries with a short sleep,
// then one unlocked best-effort write. State is monitoring metadata, so
// last-writer-wins under extreme contention is an accepted tradeoff.
const UPDATE_ATTEMPTS: u32 = 25;
const UPDATE_RETRY_SLEEP_MS: u64 = 40;
const STATE_LOCK_TTL_SECS: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceState {
    pub url: String,
    pub refresh_interval_ms: u64,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl SourceState {
    pub fn new(url: impl Into<String>, refresh_interval_ms: u64) -> Self {
        Self {
            url: url.into(),
            refresh_interval_ms,
            last_attempt_at: None,
            last_success_at: None,
            last_error: None,
            etag: None,
            last_modified: None,
        }
    }

    fn interval(&self) -> Duration {
        Duration::milliseconds(self.refresh_interval_ms as i64)
    }

    /// Never succeeded, or the last success is older than the interval.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.last_success_at {
            None => true,
            Some(at) => now - at > self.interval(),
        }
    }

    /// An attempt inside the interval gates re-fetching, so a failing or
    /// slow source is not hammered by every caller.
    pub fn recently_attempted(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt_at {
            None => false,
            Some(at) => now - at <= self.interval(),
        }
    }

    pub fn should_refresh(&self, now: DateTime<Utc>) -> bool {
        self.is_stale(now) && !self.recently_attempted(now)
    }

    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt_at = Some(now);
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.last_success_at = Some(now);
        self.last_error = None;
    }

    pub fn record_error(&mut self, err: impl Into<String>) {
        self.last_error = Some(err.into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceState>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            sources: BTreeMap::new(),
        }
    }
}

impl PipelineState {
    /// Entry with defaults merged in on first access. Sources are never
    /// deleted, only overwritten.
    pub fn source_mut(&mut self, name: &str, url: &str, interval_ms: u64) -> &mut SourceState {
        self.sources
            .entry(name.to_string())
            .or_insert_with(|| SourceState::new(url, interval_ms))
    }

    pub fn source(&self, name: &str) -> Option<&SourceState> {
        self.sources.get(name)
    }
}

#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn SnapshotStore>,
    locks: LockManager,
}

impl StateStore {
    pub fn new(store: Arc<dyn SnapshotStore>, locks: LockManager) -> Self {
        Self { store, locks }
    }

    /// Lock-free read of the committed state. Absent or unparsable
    /// documents read as the empty v1 state.
    pub fn read(&self) -> PipelineState {
        read_json::<PipelineState>(self.store.as_ref(), &paths::pipeline_state())
            .unwrap_or_default()
    }

    /// Read-modify-write under the `state` lock, retrying on contention.
    /// Returns the state as written.
    pub async fn update<F>(&self, mut mutate: F) -> PipelineState
    where
        F: FnMut(&mut PipelineState),
    {
        for _ in 0..UPDATE_ATTEMPTS {
            let m = &mut mutate;
            let out = self
                .locks
                .run_exclusive("state", Duration::seconds(STATE_LOCK_TTL_SECS), || async move {
                    let mut st = self.read();
                    st.version = STATE_VERSION;
                    m(&mut st);
                    self.write(&st);
                    st
                })
                .await;
            if let Some(st) = out.value {
                return st;
            }
            tokio::time::sleep(std::time::Duration::from_millis(UPDATE_RETRY_SLEEP_MS)).await;
        }

        tracing::warn!(
            attempts = UPDATE_ATTEMPTS,
            "state lock contended, falling back to unlocked write"
        );
        let mut st = self.read();
        st.version = STATE_VERSION;
        mutate(&mut st);
        self.write(&st);
        st
    }

    fn write(&self, st: &PipelineState) {
        if let Err(e) = write_json(self.store.as_ref(), &paths::pipeline_state(), st) {
            tracing::warn!(error = ?e, "pipeline state write failed");
        }
    }
}
