// src/refresh.rs
//! Per-source refresh: staleness gating, double-checked locking and
//! conditional fetch. All network and parse failures are absorbed here;
//! the cached snapshot is only ever replaced by a successful fetch, so
//! stale data always survives an upstream outage.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;

use crate::fetch::{ConditionalFetch, FetchResult};
use crate::lock::LockManager;
use crate::state::{SourceState, StateStore};
use crate::store::SnapshotStore;

const REFRESH_LOCK_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Fresh body fetched and the raw snapshot replaced.
    Refreshed,
    /// 304 — success, cached body untouched.
    NotModified,
    /// Not stale, or attempted too recently.
    Skipped,
    /// Another worker holds the refresh lock.
    Contended,
    /// Fetch or store failure, recorded in the source state.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
    pub refresh_interval_ms: u64,
    /// Store path for the raw body.
    pub raw_path: String,
}

#[derive(Clone)]
pub struct Refresher {
    store: Arc<dyn SnapshotStore>,
    state: StateStore,
    locks: LockManager,
    fetcher: Arc<dyn ConditionalFetch>,
}

impl Refresher {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        state: StateStore,
        locks: LockManager,
        fetcher: Arc<dyn ConditionalFetch>,
    ) -> Self {
        Self {
            store,
            state,
            locks,
            fetcher,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Refresh one source if it is due. Cheap gating happens before the
    /// lock; both conditions are re-checked against freshly read state
    /// inside it, because another worker may have just finished.
    pub async fn refresh(&self, spec: &SourceSpec) -> RefreshOutcome {
        let now = Utc::now();
        if let Some(src) = self.state.read().source(&spec.name) {
            if !src.should_refresh(now) {
                return RefreshOutcome::Skipped;
            }
        }

        let key = format!("refresh:{}", spec.name);
        let out = self
            .locks
            .run_exclusive(&key, Duration::seconds(REFRESH_LOCK_TTL_SECS), || {
                self.refresh_locked(spec)
            })
            .await;
        match out.value {
            Some(outcome) => outcome,
            None => {
                counter!("refresh_contended_total", "source" => spec.name.clone()).increment(1);
                RefreshOutcome::Contended
            }
        }
    }

    async fn refresh_locked(&self, spec: &SourceSpec) -> RefreshOutcome {
        let now = Utc::now();
        let current = self
            .state
            .read()
            .source(&spec.name)
            .cloned()
            .unwrap_or_else(|| SourceState::new(&spec.url, spec.refresh_interval_ms));
        if !current.should_refresh(now) {
            return RefreshOutcome::Skipped;
        }

        // The attempt is recorded before the network call, so a slow or
        // hanging fetch does not draw a thundering herd of retries.
        self.state
            .update(|st| {
                st.source_mut(&spec.name, &spec.url, spec.refresh_interval_ms)
                    .record_attempt(now);
            })
            .await;
        counter!("refresh_attempts_total", "source" => spec.name.clone()).increment(1);

        let fetched = self
            .fetcher
            .fetch(
                &spec.url,
                current.etag.as_deref(),
                current.last_modified.as_deref(),
            )
            .await;

        match fetched {
            Ok(FetchResult::NotModified) => {
                counter!("refresh_not_modified_total", "source" => spec.name.clone()).increment(1);
                self.state
                    .update(|st| {
                        st.source_mut(&spec.name, &spec.url, spec.refresh_interval_ms)
                            .record_success(Utc::now());
                    })
                    .await;
                RefreshOutcome::NotModified
            }
            Ok(FetchResult::Fresh {
                body,
                etag,
                last_modified,
            }) => {
                if let Err(e) = self.store.write_atomic(&spec.raw_path, body.as_bytes()) {
                    let msg = format!("{e:#}");
                    tracing::warn!(source = %spec.name, error = %msg, "raw snapshot write failed");
                    self.record_failure(spec, &msg).await;
                    return RefreshOutcome::Failed(msg);
                }
                self.state
                    .update(|st| {
                        let src = st.source_mut(&spec.name, &spec.url, spec.refresh_interval_ms);
                        src.record_success(Utc::now());
                        src.etag = etag.clone();
                        src.last_modified = last_modified.clone();
                    })
                    .await;
                counter!("refresh_fetched_total", "source" => spec.name.clone()).increment(1);
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                let msg = format!("{e:#}");
                tracing::warn!(source = %spec.name, error = %msg, "refresh failed");
                counter!("refresh_errors_total", "source" => spec.name.clone()).increment(1);
                self.record_failure(spec, &msg).await;
                RefreshOutcome::Failed(msg)
            }
        }
    }

    async fn record_failure(&self, spec: &SourceSpec, msg: &str) {
        self.state
            .update(|st| {
                st.source_mut(&spec.name, &spec.url, spec.refresh_interval_ms)
                    .record_error(msg);
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ScriptedFetch;
    use crate::store::MemoryStore;

    fn spec() -> SourceSpec {
        SourceSpec {
            name: "regular".into(),
            url: "https://example.test/regular.xml".into(),
            refresh_interval_ms: 60_000,
            raw_path: "raw/regular.xml".into(),
        }
    }

    async fn age_state(r: &Refresher, name: &str, secs: i64) {
        let shift = Duration::seconds(secs);
        r.state()
            .update(|st| {
                if let Some(src) = st.sources.get_mut(name) {
                    src.last_success_at = src.last_success_at.map(|t| t - shift);
                    src.last_attempt_at = src.last_attempt_at.map(|t| t - shift);
                }
            })
            .await;
    }

    fn refresher(fetcher: Arc<ScriptedFetch>) -> (Arc<MemoryStore>, Refresher) {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone() as Arc<dyn SnapshotStore>);
        let state = StateStore::new(store.clone() as Arc<dyn SnapshotStore>, locks.clone());
        let r = Refresher::new(
            store.clone() as Arc<dyn SnapshotStore>,
            state,
            locks,
            fetcher as Arc<dyn ConditionalFetch>,
        );
        (store, r)
    }

    #[tokio::test]
    async fn stale_source_fetches_exactly_once() {
        let fetcher = Arc::new(ScriptedFetch::new());
        fetcher.push_fresh_with("<feed/>", Some("\"v1\""), None);
        let (store, r) = refresher(fetcher.clone());

        assert_eq!(r.refresh(&spec()).await, RefreshOutcome::Refreshed);
        assert_eq!(fetcher.call_count(), 1);
        assert_eq!(store.read("raw/regular.xml").unwrap(), b"<feed/>");

        let st = r.state().read();
        let src = st.source("regular").unwrap();
        assert!(src.last_success_at.is_some());
        assert_eq!(src.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn fresh_source_makes_zero_requests() {
        let fetcher = Arc::new(ScriptedFetch::new());
        fetcher.push_fresh("<feed/>");
        let (_store, r) = refresher(fetcher.clone());

        assert_eq!(r.refresh(&spec()).await, RefreshOutcome::Refreshed);
        assert_eq!(fetcher.call_count(), 1);

        // Immediately after a success nothing is due.
        assert_eq!(r.refresh(&spec()).await, RefreshOutcome::Skipped);
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn recent_failed_attempt_gates_retry() {
        let fetcher = Arc::new(ScriptedFetch::new());
        fetcher.push_error("connect timeout");
        let (_store, r) = refresher(fetcher.clone());

        match r.refresh(&spec()).await {
            RefreshOutcome::Failed(msg) => assert!(msg.contains("connect timeout")),
            other => panic!("expected failure, got {other:?}"),
        }
        // Still stale, but attempted moments ago: no hammering.
        assert_eq!(r.refresh(&spec()).await, RefreshOutcome::Skipped);
        assert_eq!(fetcher.call_count(), 1);

        let st = r.state().read();
        assert!(st.source("regular").unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn not_modified_counts_as_success_and_keeps_body() {
        let fetcher = Arc::new(ScriptedFetch::new());
        fetcher.push_fresh("<feed>old</feed>");
        fetcher.push_not_modified();
        let (store, r) = refresher(fetcher.clone());

        assert_eq!(r.refresh(&spec()).await, RefreshOutcome::Refreshed);

        // Age the state past the interval so the next pass is due again.
        age_state(&r, "regular", 70).await;
        assert_eq!(r.refresh(&spec()).await, RefreshOutcome::NotModified);

        assert_eq!(store.read("raw/regular.xml").unwrap(), b"<feed>old</feed>");
        let st = r.state().read();
        let src = st.source("regular").unwrap();
        assert_eq!(src.last_error, None);
        assert!(src.last_success_at.is_some());
    }

    #[tokio::test]
    async fn failure_leaves_previous_snapshot_untouched() {
        let fetcher = Arc::new(ScriptedFetch::new());
        fetcher.push_fresh("<feed>good</feed>");
        fetcher.push_error("HTTP 500");
        let (store, r) = refresher(fetcher.clone());

        assert_eq!(r.refresh(&spec()).await, RefreshOutcome::Refreshed);

        age_state(&r, "regular", 70).await;
        assert!(matches!(
            r.refresh(&spec()).await,
            RefreshOutcome::Failed(_)
        ));
        // Stale data beats no data.
        assert_eq!(store.read("raw/regular.xml").unwrap(), b"<feed>good</feed>");
    }
}
