// tests/dispatch_cycle.rs
//
// Full dispatch cycle: device registry in, gateway batches out, dedup
// state persisted, invalid tokens reconciled.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use bousai_feed::config::Config;
use bousai_feed::dispatch::{DeviceRecord, NotifiedEntry, SubscribedCell};
use bousai_feed::fetch::{ConditionalFetch, ScriptedFetch};
use bousai_feed::push::{DeviceRegistry, MockGateway};
use bousai_feed::service::FeedService;
use bousai_feed::store::{MemoryStore, SnapshotStore};

struct MockRegistry {
    devices: Vec<DeviceRecord>,
    saved: Mutex<Vec<(String, BTreeMap<String, NotifiedEntry>)>>,
    removed: Mutex<Vec<String>>,
}

impl MockRegistry {
    fn new(devices: Vec<DeviceRecord>) -> Self {
        Self {
            devices,
            saved: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DeviceRegistry for MockRegistry {
    async fn load_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.devices.clone())
    }

    async fn save_last_notified(
        &self,
        device_id: &str,
        map: &BTreeMap<String, NotifiedEntry>,
    ) -> Result<()> {
        self.saved
            .lock()
            .unwrap()
            .push((device_id.to_string(), map.clone()));
        Ok(())
    }

    async fn remove_tokens(&self, tokens: &[String]) -> Result<()> {
        self.removed.lock().unwrap().extend(tokens.iter().cloned());
        Ok(())
    }
}

fn tokyo_device(id: &str) -> DeviceRecord {
    DeviceRecord {
        device_id: id.to_string(),
        push_token: format!("tok-{id}"),
        subscribed_cells: vec![SubscribedCell {
            cell_id: format!("cell-{id}"),
            pref_code: "13".into(),
            last_seen_at: Utc::now(),
        }],
        last_notified: BTreeMap::new(),
    }
}

const TOKYO_DOC: &str = r#"{
  "reportDatetime": "2024-06-01T10:00:00+09:00",
  "areaTypes": [
    { "areas": [
      { "code": "130010", "name": "東京地方",
        "warnings": [ { "code": "03", "status": "発表" } ] }
    ] }
  ]
}"#;

fn service(fetcher: Arc<ScriptedFetch>) -> FeedService {
    FeedService::new(
        Config::default(),
        Arc::new(MemoryStore::new()) as Arc<dyn SnapshotStore>,
        fetcher as Arc<dyn ConditionalFetch>,
    )
}

#[tokio::test]
async fn cycle_sends_and_persists_dedup_state() {
    let fetcher = Arc::new(ScriptedFetch::new());
    // Warning webjson for Tokyo, then the two quake sources (empty).
    fetcher.push_fresh(TOKYO_DOC);
    fetcher.push_error("HTTP 404");
    fetcher.push_error("HTTP 404");
    let svc = service(fetcher);

    let registry = MockRegistry::new(vec![tokyo_device("a"), tokyo_device("b")]);
    let gateway = MockGateway::new();

    let sent = svc.dispatch_cycle(&registry, &gateway).await.unwrap();
    assert_eq!(sent, 2, "one warning per device");
    assert_eq!(*gateway.batches.lock().unwrap(), vec![2]);

    let saved = registry.saved.lock().unwrap();
    assert_eq!(saved.len(), 2);
    let (dev, map) = &saved[0];
    assert_eq!(dev, "a");
    assert!(map.keys().any(|k| k.starts_with("warning:大雨警報:")));
}

#[tokio::test]
async fn second_cycle_within_window_sends_nothing() {
    let fetcher = Arc::new(ScriptedFetch::new());
    fetcher.push_fresh(TOKYO_DOC);
    fetcher.push_error("HTTP 404");
    fetcher.push_error("HTTP 404");
    let svc = service(fetcher);

    let mut device = tokyo_device("a");
    let registry = MockRegistry::new(vec![device.clone()]);
    let gateway = MockGateway::new();
    svc.dispatch_cycle(&registry, &gateway).await.unwrap();

    // Re-run with the persisted dedup map applied to the device.
    let persisted = registry.saved.lock().unwrap()[0].1.clone();
    device.last_notified = persisted;
    let registry2 = MockRegistry::new(vec![device]);
    let gateway2 = MockGateway::new();
    let sent = svc.dispatch_cycle(&registry2, &gateway2).await.unwrap();
    assert_eq!(sent, 0);
    assert!(registry2.saved.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_tokens_are_reconciled() {
    let fetcher = Arc::new(ScriptedFetch::new());
    fetcher.push_fresh(TOKYO_DOC);
    fetcher.push_error("HTTP 404");
    fetcher.push_error("HTTP 404");
    let svc = service(fetcher);

    let registry = MockRegistry::new(vec![tokyo_device("a")]);
    let mut gateway = MockGateway::new();
    gateway.invalid = vec!["tok-a".into()];

    svc.dispatch_cycle(&registry, &gateway).await.unwrap();
    assert_eq!(*registry.removed.lock().unwrap(), vec!["tok-a".to_string()]);
}
