//! Connection state, request counters and diagnostics snapshots
//!
//! Tracks:
//! - Connectivity as seen by real requests (not probes)
//! - Total / failed / in-flight request counts, zeroed periodically
//! - Self-test probe outcomes

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::CacheStatsSnapshot;
use crate::config::Deployment;
use crate::failsafe::{BlockInfo, HealthState};

/// Connectivity as observed by the request executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Last terminal outcome reached the backend successfully
    pub is_connected: bool,
    /// Time of the last successful request
    pub last_success_at: Option<DateTime<Utc>>,
    /// Transport failures since the last success
    pub failed_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            is_connected: true,
            last_success_at: None,
            failed_attempts: 0,
        }
    }
}

/// Owner of [`ConnectionState`]
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    state: RwLock<ConnectionState>,
}

impl ConnectionTracker {
    /// Fresh tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A request completed with a 2xx
    pub fn record_success(&self) {
        let mut state = self.state.write();
        state.is_connected = true;
        state.failed_attempts = 0;
        state.last_success_at = Some(Utc::now());
    }

    /// A dispatch failed at the transport level (network or timeout)
    pub fn record_transport_failure(&self) -> u32 {
        let mut state = self.state.write();
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        state.failed_attempts
    }

    /// The backend answered 5xx
    pub fn record_server_failure(&self) {
        self.state.write().is_connected = false;
    }

    /// Transport failures since the last success
    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.state.read().failed_attempts
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> ConnectionState {
        self.state.read().clone()
    }

    /// Back to defaults
    pub fn reset(&self) {
        *self.state.write() = ConnectionState::default();
    }
}

/// Request counters, zeroed every `reset_interval`
pub struct RequestCounters {
    total: AtomicU64,
    errors: AtomicU64,
    current: AtomicU64,
    reset_interval: Duration,
    last_reset: Mutex<(Instant, DateTime<Utc>)>,
}

/// Decrements the in-flight counter when dropped
pub struct InFlightCount<'a>(&'a AtomicU64);

impl Drop for InFlightCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RequestCounters {
    /// Counters zeroed every `reset_interval`
    #[must_use]
    pub fn new(reset_interval: Duration) -> Self {
        Self {
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            current: AtomicU64::new(0),
            reset_interval,
            last_reset: Mutex::new((Instant::now(), Utc::now())),
        }
    }

    /// Count a new logical request; the returned guard tracks it as in flight
    pub fn begin(&self) -> InFlightCount<'_> {
        self.roll_window();
        self.total.fetch_add(1, Ordering::Relaxed);
        self.current.fetch_add(1, Ordering::AcqRel);
        InFlightCount(&self.current)
    }

    /// Count a terminal failure
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn roll_window(&self) {
        let mut last = self.last_reset.lock();
        if last.0.elapsed() >= self.reset_interval {
            debug!(
                total = self.total.load(Ordering::Relaxed),
                errors = self.errors.load(Ordering::Relaxed),
                "Resetting request counters"
            );
            self.total.store(0, Ordering::Relaxed);
            self.errors.store(0, Ordering::Relaxed);
            *last = (Instant::now(), Utc::now());
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        self.roll_window();
        CountersSnapshot {
            total: self.total.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Acquire),
            last_reset_at: self.last_reset.lock().1,
        }
    }

    /// Zero totals; in-flight requests keep their count until they finish
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self.last_reset.lock() = (Instant::now(), Utc::now());
    }
}

/// Snapshot of [`RequestCounters`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    /// Requests since the last reset
    pub total: u64,
    /// Failed requests since the last reset
    pub errors: u64,
    /// Requests in flight
    pub current: u64,
    /// When the counters were last zeroed
    pub last_reset_at: DateTime<Utc>,
}

/// Full client snapshot returned by `NetworkClient::diagnostics`
#[derive(Debug, Clone, Serialize)]
pub struct ClientDiagnostics {
    /// Effective deployment
    pub deployment: Deployment,
    /// Backend origin
    pub base_url: String,
    /// Health monitor state
    pub health: HealthState,
    /// Connectivity seen by requests
    pub connection: ConnectionState,
    /// Request counters
    pub counters: CountersSnapshot,
    /// Active rate-limit blocks
    pub blocked: Vec<BlockInfo>,
    /// Non-parallel endpoints currently in flight
    pub in_flight: Vec<String>,
    /// A token is held (possibly expired)
    pub has_token: bool,
    /// Expiry of the held token
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Response cache statistics
    pub cache: CacheStatsSnapshot,
}

/// Outcome of one self-test probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// Probe name (`liveness`, `auth`, `cors`)
    pub name: String,
    /// Probed URL
    pub url: String,
    /// Whether the probe passed
    pub passed: bool,
    /// HTTP status, when a response arrived
    pub status: Option<u16>,
    /// Probe duration
    pub duration_ms: u64,
    /// Failure detail
    pub error: Option<String>,
}

/// Self-test report
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    /// When the self-test started
    pub started_at: DateTime<Utc>,
    /// Effective deployment
    pub deployment: Deployment,
    /// Backend origin
    pub base_url: String,
    /// Transport reports connectivity
    pub online: bool,
    /// Individual probes
    pub probes: Vec<ProbeResult>,
    /// Wall time of the whole suite
    pub total_ms: u64,
}

impl DiagnosticsReport {
    /// Whether every probe passed
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.online && self.probes.iter().all(|p| p.passed)
    }

    /// Number of failed probes
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.probes.iter().filter(|p| !p.passed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_tracks_outcomes() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.record_transport_failure(), 1);
        assert_eq!(tracker.record_transport_failure(), 2);
        tracker.record_server_failure();
        assert!(!tracker.snapshot().is_connected);

        tracker.record_success();
        let state = tracker.snapshot();
        assert!(state.is_connected);
        assert_eq!(state.failed_attempts, 0);
        assert!(state.last_success_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn counters_track_in_flight_and_roll_over() {
        let counters = RequestCounters::new(Duration::from_secs(3600));
        {
            let _a = counters.begin();
            let _b = counters.begin();
            counters.record_error();
            let snap = counters.snapshot();
            assert_eq!((snap.total, snap.errors, snap.current), (2, 1, 2));
        }
        assert_eq!(counters.snapshot().current, 0);

        tokio::time::advance(Duration::from_secs(3601)).await;
        let snap = counters.snapshot();
        assert_eq!((snap.total, snap.errors), (0, 0));
    }

    #[test]
    fn report_summary() {
        let probe = |passed| ProbeResult {
            name: "liveness".into(),
            url: "http://localhost/api/health".into(),
            passed,
            status: Some(200),
            duration_ms: 3,
            error: None,
        };
        let mut report = DiagnosticsReport {
            started_at: Utc::now(),
            deployment: Deployment::Local,
            base_url: "http://localhost".into(),
            online: true,
            probes: vec![probe(true), probe(true)],
            total_ms: 5,
        };
        assert!(report.all_passed());
        report.probes.push(probe(false));
        assert!(!report.all_passed());
        assert_eq!(report.failed_count(), 1);
    }
}
