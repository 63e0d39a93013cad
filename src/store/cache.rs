/// Read cache with a fresh TTL for normal reads and a stale TTL for fallback
use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: String,
    pub value: Value,
    pub fetched_at: Instant,
}

impl CacheEntry {
    fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    fresh_ttl: Duration,
    stale_ttl: Duration,
}

impl ResponseCache {
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        ResponseCache {
            entries: RwLock::new(HashMap::new()),
            fresh_ttl,
            stale_ttl: stale_ttl.max(fresh_ttl),
        }
    }

    /// Value fetched within the fresh TTL
    pub fn fresh(&self, path: &str) -> Option<Value> {
        self.within(path, self.fresh_ttl)
    }

    /// Last known value fetched within the stale TTL, for fallback only
    pub fn stale(&self, path: &str) -> Option<Value> {
        self.within(path, self.stale_ttl)
    }

    fn within(&self, path: &str, ttl: Duration) -> Option<Value> {
        let entries = self.entries.read();
        entries
            .get(path)
            .filter(|entry| entry.age() <= ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, path: &str, value: Value) {
        let entry = CacheEntry {
            path: path.to_string(),
            value,
            fetched_at: Instant::now(),
        };
        self.entries.write().insert(path.to_string(), entry);
    }

    /// Drop every entry whose value contains `path`: itself, ancestors and descendants
    pub fn invalidate(&self, path: &str) {
        let path = path.trim_matches('/');
        let prefix = format!("{}/", path);
        let mut entries = self.entries.write();
        entries.retain(|key, _| {
            let key = key.trim_matches('/');
            let ancestor = path.starts_with(&format!("{}/", key));
            key != path && !key.starts_with(&prefix) && !ancestor
        });
    }

    /// Evict entries too old to serve even as stale fallback
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let stale_ttl = self.stale_ttl;
        entries.retain(|_, entry| entry.age() <= stale_ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
