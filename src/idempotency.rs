//! At-most-once effect for client-initiated mutations.
//!
//! The first call with a given key executes and stores its serialized
//! result; replays within the retention window return the stored result
//! without re-executing. Retries after provider timeouts reuse the same key,
//! which is why storing happens only after a successful commit.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::ServiceError;

#[derive(Debug, Clone)]
struct StoredResult {
    value: serde_json::Value,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct IdempotencyGuard {
    entries: DashMap<String, StoredResult>,
    retention: Duration,
}

impl IdempotencyGuard {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    /// Returns the stored result for `key` if present and unexpired.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ServiceError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.stored_at.elapsed() >= self.retention {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        let value = serde_json::from_value(entry.value.clone())?;
        Ok(Some(value))
    }

    /// Stores the result of a completed execution. First write wins: if a
    /// concurrent duplicate raced past the lookup, the earlier stored result
    /// stays authoritative.
    pub fn store<T: Serialize>(&self, key: &str, result: &T) -> Result<(), ServiceError> {
        let value = serde_json::to_value(result)?;
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| StoredResult {
                value,
                stored_at: Instant::now(),
            });
        Ok(())
    }

    /// Drops expired entries. Run periodically from a background task.
    pub fn sweep_expired(&self) {
        self.entries
            .retain(|_, entry| entry.stored_at.elapsed() < self.retention);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
