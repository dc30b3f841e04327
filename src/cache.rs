//! Read-through cache for GET responses
//!
//! Backs [`NetworkClient::request_cached`](crate::client::NetworkClient::request_cached).
//! Entries are keyed by normalized endpoint (query string included) and
//! carry tags such as `"user"` or `"tasks"`, so a mutation can drop every
//! read it affects with one [`ResponseCache::remove_by_tags`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

/// Tagged response cache with per-entry deadlines
#[derive(Default)]
pub struct ResponseCache {
    entries: DashMap<String, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct Entry {
    value: Value,
    deadline: Instant,
    tags: Vec<String>,
}

impl ResponseCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live value for `endpoint`; an expired entry is dropped and counts as a miss
    pub fn get(&self, endpoint: &str) -> Option<Value> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(endpoint)
            .filter(|entry| entry.deadline > now)
            .map(|entry| entry.value.clone());

        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            if self
                .entries
                .remove_if(endpoint, |_, entry| entry.deadline <= now)
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        hit
    }

    /// Cache `value` for `endpoint` until `ttl` elapses
    pub fn set(&self, endpoint: &str, value: Value, ttl: Duration, tags: &[&str]) {
        self.entries.insert(
            endpoint.to_string(),
            Entry {
                value,
                deadline: Instant::now() + ttl,
                tags: tags.iter().map(ToString::to_string).collect(),
            },
        );
    }

    /// Drop every entry carrying any of `tags`; returns how many went
    pub fn remove_by_tags(&self, tags: &[&str]) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.tags.iter().any(|t| tags.contains(&t.as_str())));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(?tags, removed, "Invalidated cached responses");
        }
        removed
    }

    /// Current counters
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };
        CacheStatsSnapshot {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate,
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that found nothing live
    pub misses: u64,
    /// Entries dropped by expiry or tag invalidation
    pub evictions: u64,
    /// Entries currently held
    pub size: usize,
    /// 0.0-1.0
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hit_then_miss() {
        let cache = ResponseCache::new();
        cache.set("api/user/42", json!({"id": 42}), Duration::from_secs(60), &["user"]);

        assert_eq!(cache.get("api/user/42"), Some(json!({"id": 42})));
        assert_eq!(cache.get("api/user/43"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_at_their_deadline() {
        let cache = ResponseCache::new();
        cache.set("api/tasks", json!([]), Duration::from_secs(30), &[]);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get("api/tasks"), Some(json!([])));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("api/tasks"), None);
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn query_strings_are_distinct_entries() {
        let cache = ResponseCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("api/tasks?page=1", json!([1]), ttl, &["tasks"]);
        cache.set("api/tasks?page=2", json!([2]), ttl, &["tasks"]);

        assert_eq!(cache.get("api/tasks?page=2"), Some(json!([2])));
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn remove_by_tags_drops_only_tagged() {
        let cache = ResponseCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("api/tasks", json!([]), ttl, &["tasks"]);
        cache.set("api/profile", json!({}), ttl, &["user", "profile"]);
        cache.set("api/raffles", json!([]), ttl, &["raffles"]);

        assert_eq!(cache.remove_by_tags(&["user", "tasks"]), 2);
        assert_eq!(cache.get("api/tasks"), None);
        assert_eq!(cache.get("api/profile"), None);
        assert_eq!(cache.get("api/raffles"), Some(json!([])));
        assert_eq!(cache.remove_by_tags(&["missing"]), 0);
        assert_eq!(cache.stats().evictions, 2);
    }
}
