// src/store/memory.rs
use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use super::SnapshotStore;

/// In-memory store for tests and embedded use. Writes are atomic by
/// construction (the map entry swaps under one mutex guard).
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn keys(&self) -> Vec<String> {
        let mut v: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        v.sort();
        v
    }
}

impl SnapshotStore for MemoryStore {
    fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().get(path).cloned()
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.lock().unwrap().contains_key(path)
    }

    fn create_exclusive(&self, path: &str, bytes: &[u8]) -> Result<bool> {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(path) {
            return Ok(false);
        }
        map.insert(path.to_string(), bytes.to_vec());
        Ok(true)
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.inner.lock().unwrap().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{read_json, write_json};

    #[test]
    fn read_json_absorbs_garbage() {
        let store = MemoryStore::new();
        assert_eq!(read_json::<u32>(&store, "nope.json"), None);

        store.write_atomic("bad.json", b"{not json").unwrap();
        assert_eq!(read_json::<u32>(&store, "bad.json"), None);

        write_json(&store, "n.json", &7u32).unwrap();
        assert_eq!(read_json::<u32>(&store, "n.json"), Some(7));
    }
}
