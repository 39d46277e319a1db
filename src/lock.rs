// src/lock.rs
//! Named mutual exclusion with TTL expiry, backed by lock records in the
//! snapshot store. A crashed holder never deadlocks anyone: its record
//! expires and the next acquirer reaps it. Contention is not an error,
//! it means another worker is already doing the job.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{paths, read_json, SnapshotStore};

static OWNER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Result of `run_exclusive`: `executed == false` means the lock was held
/// by someone else and the closure never ran.
#[derive(Debug)]
pub struct Exclusive<T> {
    pub executed: bool,
    pub value: Option<T>,
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn SnapshotStore>,
    owner: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        let owner = format!(
            "{}-{}",
            std::process::id(),
            OWNER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self { store, owner }
    }

    /// Run `f` under the named lock. If the lock is held (and not expired)
    /// the closure is skipped and `executed` is false.
    pub async fn run_exclusive<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Exclusive<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.try_acquire(key, ttl, Utc::now()) {
            return Exclusive {
                executed: false,
                value: None,
            };
        }
        let value = f().await;
        self.release(key);
        Exclusive {
            executed: true,
            value: Some(value),
        }
    }

    fn try_acquire(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        let path = paths::lock(key);
        let record = LockRecord {
            owner: self.owner.clone(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        let bytes = match serde_json::to_vec(&record) {
            Ok(b) => b,
            Err(_) => return false,
        };

        match self.store.create_exclusive(&path, &bytes) {
            Ok(true) => true,
            Ok(false) => {
                // Held by someone. Reap it only if its TTL has passed (or
                // the record is unreadable), then retry the create once.
                let expired = match read_json::<LockRecord>(self.store.as_ref(), &path) {
                    Some(rec) => rec.expires_at <= now,
                    None => true,
                };
                if !expired {
                    return false;
                }
                tracing::debug!(key, "reaping expired lock record");
                if self.store.remove(&path).is_err() {
                    return false;
                }
                matches!(self.store.create_exclusive(&path, &bytes), Ok(true))
            }
            Err(e) => {
                tracing::warn!(key, error = ?e, "lock acquisition failed");
                false
            }
        }
    }

    fn release(&self, key: &str) {
        let path = paths::lock(key);
        // Only remove our own record. A TTL-expired lock may have been
        // reaped and re-acquired while we were still running.
        match read_json::<LockRecord>(self.store.as_ref(), &path) {
            Some(rec) if rec.owner == self.owner => {
                if let Err(e) = self.store.remove(&path) {
                    tracing::warn!(key, error = ?e, "lock release failed");
                }
            }
            _ => {}
        }
    }
}
