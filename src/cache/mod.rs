//! Cached aggregate views (settlement snapshots, dashboard counts).
//!
//! The reconciliation bridge only ever *invalidates*; recomputation is
//! pull-based from the authoritative store. Entries carry a TTL as a backstop
//! so a missed invalidation can never serve stale money figures forever.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

#[derive(Debug, Default)]
pub struct AggregateCache {
    store: DashMap<String, CacheEntry>,
    default_ttl: Option<Duration>,
}

impl AggregateCache {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            store: DashMap::new(),
            default_ttl,
        }
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.store.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        serde_json::from_str(&entry.value).ok()
    }

    pub fn set<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let serialized = serde_json::to_string(value)?;
        self.store
            .insert(key.to_string(), CacheEntry::new(serialized, self.default_ttl));
        Ok(())
    }

    /// Drops every entry under a key prefix. This is the bridge's
    /// invalidation primitive: one applied event may stale many windows.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.store.retain(|key, _| !key.starts_with(prefix));
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
