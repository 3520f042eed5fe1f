//! Fixed-window rate limiting over keyed counters.
//!
//! Used to bound OTP verification attempts per dispatch: delivery codes are
//! six digits, so unthrottled guessing is a real attack surface.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

impl WindowEntry {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub attempts_per_window: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            attempts_per_window: 5,
            window: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<String, WindowEntry>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Counts one attempt against `key`. Returns `false` when the key has
    /// exhausted its window.
    pub fn check_and_count(&self, key: &str) -> bool {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(WindowEntry::new);

        if entry.window_start.elapsed() >= self.config.window {
            entry.count = 0;
            entry.window_start = Instant::now();
        }

        if entry.count >= self.config.attempts_per_window {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Clears a key's counter, e.g. after successful OTP verification.
    pub fn reset(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops entries whose window has passed. Run periodically from a
    /// background task.
    pub fn cleanup_expired(&self) {
        self.entries
            .retain(|_, entry| entry.window_start.elapsed() < self.config.window);
    }
}
