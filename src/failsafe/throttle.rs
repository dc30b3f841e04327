//! Per-endpoint throttling and rate-limit blocks
//!
//! Two mechanisms share one registry:
//!
//! - **Min interval**: ordered `(pattern, interval)` rules, first match wins.
//!   Each matched pattern gets its own `governor` limiter with burst 1.
//! - **Blocks**: after a 429 the matched pattern is refused locally until
//!   `unblock_at`, so callers fail fast instead of re-hitting the server.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ThrottleConfig, ThrottleRule};

/// Wildcard pattern that blocks every endpoint
pub const DEFAULT_PATTERN: &str = "default";

/// An active block
struct BlockedEndpoint {
    unblock_at: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Snapshot of one active block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    /// Blocked pattern
    pub pattern: String,
    /// Time left
    #[serde(with = "crate::config::humantime_serde")]
    pub remaining: Duration,
}

/// Throttle & block registry
pub struct ThrottleRegistry {
    enabled: bool,
    default_interval: Duration,
    rules: Vec<ThrottleRule>,
    limiters: DashMap<String, Arc<DefaultDirectRateLimiter>>,
    blocks: Arc<DashMap<String, BlockedEndpoint>>,
    generation: AtomicU64,
}

impl ThrottleRegistry {
    /// Create from configuration
    #[must_use]
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            enabled: config.enabled,
            default_interval: config.default_interval,
            rules: config.rules.clone(),
            limiters: DashMap::new(),
            blocks: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn matching_rule(&self, endpoint: &str) -> Option<&ThrottleRule> {
        self.rules.iter().find(|r| r.matches(endpoint))
    }

    /// Pattern that `endpoint` is throttled and blocked under: the first
    /// matching rule's pattern, else the endpoint itself
    #[must_use]
    pub fn pattern_for(&self, endpoint: &str) -> String {
        self.matching_rule(endpoint)
            .map_or_else(|| endpoint.to_string(), |r| r.pattern.clone())
    }

    /// Minimum interval between calls to `endpoint`
    #[must_use]
    pub fn min_interval(&self, endpoint: &str) -> Duration {
        self.matching_rule(endpoint)
            .map_or(self.default_interval, |r| r.interval)
    }

    /// Take a slot for `endpoint`, returning how long the caller still owes.
    ///
    /// `Duration::ZERO` means go now.
    pub fn acquire(&self, endpoint: &str) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let interval = self.min_interval(endpoint);
        let Some(quota) = Quota::with_period(interval) else {
            // zero interval
            return Duration::ZERO;
        };

        let key = self.pattern_for(endpoint);
        let limiter = self
            .limiters
            .entry(key)
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN))))
            .clone();

        match limiter.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(DefaultClock::default().now()),
        }
    }

    /// Whether `endpoint` is currently blocked
    #[must_use]
    pub fn is_blocked(&self, endpoint: &str) -> bool {
        self.remaining_block(endpoint).is_some()
    }

    /// Longest remaining block covering `endpoint`, including the wildcard
    #[must_use]
    pub fn remaining_block(&self, endpoint: &str) -> Option<Duration> {
        let now = Instant::now();
        let key = self.pattern_for(endpoint);

        self.blocks
            .iter()
            .filter(|entry| {
                let pattern = entry.key().as_str();
                pattern == DEFAULT_PATTERN || pattern == key || pattern == endpoint
            })
            .filter_map(|entry| {
                let unblock_at = entry.value().unblock_at;
                (unblock_at > now).then(|| unblock_at - now)
            })
            .max()
    }

    /// Block `endpoint` for `retry_after_secs`, replacing any existing block
    /// for the same pattern. Returns the blocked pattern.
    ///
    /// Must be called inside a tokio runtime: the clearing timer is a task.
    pub fn register_block(&self, endpoint: &str, retry_after_secs: u64) -> String {
        let pattern = if endpoint == DEFAULT_PATTERN {
            DEFAULT_PATTERN.to_string()
        } else {
            self.pattern_for(endpoint)
        };
        let unblock_at = Instant::now() + Duration::from_secs(retry_after_secs);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let blocks = Arc::clone(&self.blocks);
        let key = pattern.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(unblock_at).await;
            if blocks
                .remove_if(&key, |_, b| b.generation == generation)
                .is_some()
            {
                debug!(pattern = %key, "Rate-limit block expired");
            }
        });

        let block = BlockedEndpoint {
            unblock_at,
            generation,
            timer,
        };
        if let Some(previous) = self.blocks.insert(pattern.clone(), block) {
            previous.timer.abort();
            debug!(pattern = %pattern, "Replaced existing rate-limit block");
        }

        info!(pattern = %pattern, retry_after_secs, "Endpoint blocked after 429");
        pattern
    }

    /// Lift the block on `pattern`
    pub fn clear_block(&self, pattern: &str) -> bool {
        if let Some((_, block)) = self.blocks.remove(pattern) {
            block.timer.abort();
            true
        } else {
            false
        }
    }

    /// Lift every block and forget interval history
    pub fn clear_all(&self) {
        let patterns: Vec<String> = self.blocks.iter().map(|e| e.key().clone()).collect();
        for pattern in patterns {
            self.clear_block(&pattern);
        }
        self.limiters.clear();
    }

    /// Active blocks
    #[must_use]
    pub fn blocked_patterns(&self) -> Vec<BlockInfo> {
        let now = Instant::now();
        let mut blocks: Vec<BlockInfo> = self
            .blocks
            .iter()
            .filter(|e| e.value().unblock_at > now)
            .map(|e| BlockInfo {
                pattern: e.key().clone(),
                remaining: e.value().unblock_at - now,
            })
            .collect();
        blocks.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        blocks
    }
}

/// Whole seconds left, rounded up so callers never retry early
#[must_use]
pub fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ThrottleRegistry {
        ThrottleRegistry::new(&ThrottleConfig {
            enabled: true,
            default_interval: Duration::from_millis(300),
            rules: vec![
                ThrottleRule::contains("raffles", Duration::from_secs(2)),
                ThrottleRule::contains("raffles/participate", Duration::from_secs(9)),
                ThrottleRule::contains("tasks", Duration::ZERO),
            ],
            default_retry_after: Duration::from_secs(30),
        })
    }

    #[test]
    fn first_match_wins() {
        let r = registry();
        // the broader rule is listed first
        assert_eq!(r.min_interval("api/raffles/participate"), Duration::from_secs(2));
        assert_eq!(r.pattern_for("api/raffles/participate"), "raffles");
        assert_eq!(r.min_interval("api/user/42"), Duration::from_millis(300));
        assert_eq!(r.pattern_for("api/user/42"), "api/user/42");
    }

    #[test]
    fn acquire_enforces_interval() {
        let r = registry();
        assert_eq!(r.acquire("api/raffles"), Duration::ZERO);
        let owed = r.acquire("api/raffles/7");
        assert!(owed > Duration::from_millis(1500), "{owed:?}");
        assert!(owed <= Duration::from_secs(2));
    }

    #[test]
    fn zero_interval_and_disabled_never_wait() {
        let r = registry();
        assert_eq!(r.acquire("api/tasks"), Duration::ZERO);
        assert_eq!(r.acquire("api/tasks"), Duration::ZERO);

        let off = ThrottleRegistry::new(&ThrottleConfig {
            enabled: false,
            ..ThrottleConfig::default()
        });
        assert_eq!(off.acquire("api/raffles"), Duration::ZERO);
        assert_eq!(off.acquire("api/raffles"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn block_expires_with_timer() {
        let r = registry();
        let pattern = r.register_block("api/raffles/3", 5);
        assert_eq!(pattern, "raffles");
        assert!(r.is_blocked("api/raffles"));
        assert!(!r.is_blocked("api/user/42"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!r.is_blocked("api/raffles"));
        assert!(r.blocked_patterns().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn re_registering_replaces_block() {
        let r = registry();
        r.register_block("api/user/42", 5);
        tokio::time::sleep(Duration::from_secs(2)).await;
        r.register_block("api/user/42", 5);

        let blocks = r.blocked_patterns();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].remaining, Duration::from_secs(5));

        // past the first deadline: the superseded timer must not clear the new block
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(r.is_blocked("api/user/42"));
        assert_eq!(r.remaining_block("api/user/42"), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn wildcard_blocks_everything() {
        let r = registry();
        r.register_block(DEFAULT_PATTERN, 3);
        assert!(r.is_blocked("api/user/42"));
        assert!(r.is_blocked("api/tasks"));
        assert!(r.clear_block(DEFAULT_PATTERN));
        assert!(!r.is_blocked("api/user/42"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_lifts_blocks() {
        let r = registry();
        r.register_block("api/raffles", 10);
        r.register_block("api/user/1", 10);
        r.clear_all();
        assert!(r.blocked_patterns().is_empty());
    }

    #[test]
    fn ceil_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(4001)), 5);
        assert_eq!(ceil_secs(Duration::from_secs(5)), 5);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }
}
