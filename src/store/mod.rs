// src/store/mod.rs
pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Path-addressed blob store for raw feed bodies, normalized snapshots,
/// polling state and lock records. Implementations must guarantee that
/// `write_atomic` is all-or-nothing from a reader's point of view.
pub trait SnapshotStore: Send + Sync {
    /// Replace the content at `path`. A concurrent reader observes either
    /// the previous content or the new content, never a partial write.
    fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Read the full content, or `None` when absent.
    fn read(&self, path: &str) -> Option<Vec<u8>>;

    fn exists(&self, path: &str) -> bool;

    /// Create `path` only if it does not exist yet. Returns `false` when
    /// another writer got there first. Used for lock records.
    fn create_exclusive(&self, path: &str, bytes: &[u8]) -> Result<bool>;

    /// Remove `path`. Removing an absent path is not an error.
    fn remove(&self, path: &str) -> Result<()>;
}

/// Lenient JSON read: absent or unparsable both mean "no data yet".
pub fn read_json<T: DeserializeOwned>(store: &dyn SnapshotStore, path: &str) -> Option<T> {
    let bytes = store.read(path)?;
    serde_json::from_slice(&bytes).ok()
}

pub fn write_json<T: Serialize>(store: &dyn SnapshotStore, path: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.write_atomic(path, &bytes)
}

/// Canonical store layout, kept in one place so tests and the service
/// agree on where documents live.
pub mod paths {
    pub fn raw_feed(feed: &str) -> String {
        format!("raw/{feed}.xml")
    }

    pub fn quake_detail(content_hash: &str) -> String {
        format!("details/{content_hash}.xml")
    }

    pub fn quakes() -> String {
        "normalized/quakes.json".to_string()
    }

    pub fn status() -> String {
        "normalized/status.json".to_string()
    }

    pub fn warnings(office: &str) -> String {
        format!("normalized/warnings/{office}.json")
    }

    pub fn pipeline_state() -> String {
        "state/pipeline.json".to_string()
    }

    pub fn lock(key: &str) -> String {
        format!("locks/{key}.json")
    }
}
