// tests/quakes_e2e.rs
//
// Quake pipeline through the service: feed + detail enrichment merged
// with the polled list, preliminary reports excluded, and the previous
// snapshot surviving a total upstream outage.

use std::sync::Arc;

use bousai_feed::config::Config;
use bousai_feed::fetch::{ConditionalFetch, ScriptedFetch};
use bousai_feed::health::FetchStatus;
use bousai_feed::quakes::QuakeSource;
use bousai_feed::service::FeedService;
use bousai_feed::store::{MemoryStore, SnapshotStore};

const EQVOL_FEED: &str = include_str!("fixtures/eqvol_feed.xml");
const QUAKE_DETAIL: &str = include_str!("fixtures/quake_detail.xml");
// The list carries the same event thirty seconds later, plus one rapid
// report that must vanish.
const QUAKE_LIST: &str = include_str!("fixtures/quake_list.json");

fn service(fetcher: Arc<ScriptedFetch>) -> FeedService {
    FeedService::new(
        Config::default(),
        Arc::new(MemoryStore::new()) as Arc<dyn SnapshotStore>,
        fetcher as Arc<dyn ConditionalFetch>,
    )
}

#[tokio::test]
async fn two_sources_merge_into_one_detail_enriched_item() {
    let fetcher = Arc::new(ScriptedFetch::new());
    // Order inside the pipeline: eqvol feed, quake list, then details.
    fetcher.push_fresh(EQVOL_FEED);
    fetcher.push_fresh(QUAKE_LIST);
    fetcher.push_fresh(QUAKE_DETAIL);
    let svc = service(fetcher);

    let resp = svc.get_quakes().await;
    assert_eq!(resp.fetch_status, FetchStatus::Ok);
    assert_eq!(resp.quakes.len(), 1, "both sources describe one event");

    let q = &resp.quakes[0];
    assert_eq!(q.source, QuakeSource::PullDetail);
    assert_eq!(q.magnitude, Some(6.2));
    assert_eq!(q.epicenter.as_deref(), Some("千葉県東方沖"));
    assert_eq!(q.depth_km, Some(30));
    assert_eq!(q.max_intensity.as_deref(), Some("5-"));
    assert!(resp.updated_at.is_some());
}

#[tokio::test]
async fn total_outage_returns_empty_but_degraded_not_error() {
    let fetcher = Arc::new(ScriptedFetch::new());
    fetcher.push_error("connect timeout");
    fetcher.push_error("connect timeout");
    let svc = service(fetcher);

    let resp = svc.get_quakes().await;
    assert_eq!(resp.fetch_status, FetchStatus::Degraded);
    assert!(resp.quakes.is_empty());
    assert!(resp.last_error.is_some());
}

#[tokio::test]
async fn list_only_outage_keeps_previous_items() {
    let fetcher = Arc::new(ScriptedFetch::new());
    fetcher.push_fresh(EQVOL_FEED);
    fetcher.push_fresh(QUAKE_LIST);
    fetcher.push_fresh(QUAKE_DETAIL);
    let svc = service(fetcher.clone());

    let first = svc.get_quakes().await;
    assert_eq!(first.quakes.len(), 1);

    // The cached snapshot answers immediately on the next read even if
    // every upstream is now failing.
    fetcher.push_error("HTTP 500");
    fetcher.push_error("HTTP 500");
    let second = svc.get_quakes().await;
    assert_eq!(second.quakes.len(), 1);
}
