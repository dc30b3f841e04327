//! Backend liveness monitor
//!
//! Tracks:
//! - Probe outcome and consecutive failures (`unknown → healthy ⇄ degraded`)
//! - Adaptive polling interval derived from the failure streak
//! - The "server unavailable" banner, raised at the warning threshold and
//!   withdrawn on the next success

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Method;
use reqwest::header::{ACCEPT, HeaderValue};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::events::{NetworkEvent, Observers};
use crate::transport::{HttpRequest, Transport};

/// Coarse health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No probe has completed yet
    Unknown,
    /// Last probe succeeded
    Healthy,
    /// Last probe (or request) failed
    Degraded,
}

/// Health state snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthState {
    /// Whether the backend is considered up
    pub is_healthy: bool,
    /// Coarse status
    pub status: HealthStatus,
    /// Completion time of the last probe
    pub last_check_at: Option<DateTime<Utc>>,
    /// A probe is running right now
    pub check_in_progress: bool,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Streak length that raises the banner
    pub failure_threshold_for_warning: u32,
    /// Duration of the last probe
    pub last_probe_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    status: HealthStatus,
    last_check: Option<Instant>,
    last_check_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_probe: Option<Duration>,
}

impl Inner {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            last_check_at: None,
            consecutive_failures: 0,
            last_probe: None,
        }
    }
}

/// Resets the in-progress flag however the probe ends
struct ProbeGuard<'a>(&'a AtomicBool);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Health monitor
pub struct HealthMonitor {
    transport: Arc<dyn Transport>,
    probe_url: String,
    probe_timeout: Duration,
    config: HealthConfig,
    observers: Observers,
    state: RwLock<Inner>,
    in_progress: AtomicBool,
    warning_active: AtomicBool,
}

impl HealthMonitor {
    /// Create a monitor probing `probe_url`
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        probe_url: String,
        probe_timeout: Duration,
        config: HealthConfig,
        observers: Observers,
    ) -> Self {
        Self {
            transport,
            probe_url,
            probe_timeout,
            config,
            observers,
            state: RwLock::new(Inner::new()),
            in_progress: AtomicBool::new(false),
            warning_active: AtomicBool::new(false),
        }
    }

    /// Probe the backend once. Never fails.
    ///
    /// If another probe is already running this returns the last known
    /// result instead of starting a second one.
    pub async fn check(&self) -> bool {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Health probe already running, using last known state");
            return self.is_healthy();
        }
        let _guard = ProbeGuard(&self.in_progress);

        let mut request = HttpRequest::new(Method::GET, self.probe_url.clone(), self.probe_timeout);
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        let started = Instant::now();
        let healthy = match tokio::time::timeout(self.probe_timeout, self.transport.send(request)).await {
            Ok(Ok(response)) if response.is_success() => true,
            Ok(Ok(response)) => {
                debug!(status = response.status.as_u16(), "Health probe returned non-success");
                false
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.probe_timeout.as_millis(), "Health probe timed out");
                false
            }
        };
        let elapsed = started.elapsed();

        {
            let mut state = self.state.write();
            state.last_check = Some(Instant::now());
            state.last_check_at = Some(Utc::now());
            state.last_probe = Some(elapsed);
        }

        if healthy {
            self.record_success();
        } else {
            self.record_failure();
        }
        healthy
    }

    /// Mark the backend healthy and reset the failure streak
    pub fn record_success(&self) {
        let recovered = {
            let mut state = self.state.write();
            let was_degraded = state.status == HealthStatus::Degraded;
            state.status = HealthStatus::Healthy;
            state.consecutive_failures = 0;
            was_degraded
        };

        if recovered {
            info!(url = %self.probe_url, "Backend recovered");
        }
        if self.warning_active.swap(false, Ordering::AcqRel) {
            self.observers.emit(&NetworkEvent::ServerRecovered);
        }
    }

    /// Count a failure, raising the banner at the threshold
    pub fn record_failure(&self) {
        let consecutive = {
            let mut state = self.state.write();
            state.status = HealthStatus::Degraded;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_failures
        };

        if consecutive >= self.config.failure_threshold
            && !self.warning_active.swap(true, Ordering::AcqRel)
        {
            warn!(
                url = %self.probe_url,
                consecutive_failures = consecutive,
                "Backend marked unavailable"
            );
            self.observers.emit(&NetworkEvent::ServerUnavailable {
                consecutive_failures: consecutive,
            });
        }
    }

    /// Whether the backend is currently considered up
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.read().status == HealthStatus::Healthy
    }

    /// Failures since the last success
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.read().consecutive_failures
    }

    /// Whether the last probe is older than `bound` (or never ran)
    #[must_use]
    pub fn is_stale(&self, bound: Duration) -> bool {
        self.state
            .read()
            .last_check
            .is_none_or(|at| at.elapsed() > bound)
    }

    /// Delay before the next scheduled probe
    #[must_use]
    pub fn next_interval(&self) -> Duration {
        interval_for(&self.config, self.consecutive_failures())
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> HealthState {
        let state = self.state.read();
        HealthState {
            is_healthy: state.status == HealthStatus::Healthy,
            status: state.status,
            last_check_at: state.last_check_at,
            check_in_progress: self.in_progress.load(Ordering::Acquire),
            consecutive_failures: state.consecutive_failures,
            failure_threshold_for_warning: self.config.failure_threshold,
            last_probe_ms: state
                .last_probe
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Back to `unknown`, banner withdrawn silently
    pub fn reset(&self) {
        *self.state.write() = Inner::new();
        self.warning_active.store(false, Ordering::Release);
        debug!("Health state reset");
    }

    /// Poll on the adaptive schedule until `cancel` fires
    pub fn spawn_polling(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                monitor.check().await;
                let delay = monitor.next_interval();
                debug!(delay_ms = delay.as_millis(), "Next health probe scheduled");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            debug!("Health polling stopped");
        })
    }
}

/// Adaptive poll interval for a failure streak
#[must_use]
pub fn interval_for(config: &HealthConfig, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        config.healthy_interval
    } else if consecutive_failures < config.failure_threshold {
        config.degraded_interval
    } else {
        config.critical_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::Result;
    use crate::transport::HttpResponse;

    struct Flaky {
        up: AtomicBool,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            if self.up.load(Ordering::Relaxed) {
                Ok(HttpResponse::empty(200))
            } else {
                Ok(HttpResponse::empty(503))
            }
        }
    }

    fn monitor(up: bool) -> (Arc<Flaky>, HealthMonitor, Observers) {
        let transport = Arc::new(Flaky {
            up: AtomicBool::new(up),
        });
        let observers = Observers::new();
        let monitor = HealthMonitor::new(
            transport.clone(),
            "http://localhost:8000/api/health".into(),
            Duration::from_secs(5),
            HealthConfig::default(),
            observers.clone(),
        );
        (transport, monitor, observers)
    }

    #[test]
    fn interval_adapts_to_failures() {
        let config = HealthConfig::default();
        assert_eq!(interval_for(&config, 0), Duration::from_secs(60));
        assert_eq!(interval_for(&config, 1), Duration::from_secs(30));
        assert_eq!(interval_for(&config, 2), Duration::from_secs(30));
        assert_eq!(interval_for(&config, 3), Duration::from_secs(15));
        assert_eq!(interval_for(&config, 40), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn starts_unknown_and_turns_healthy() {
        let (_t, monitor, _o) = monitor(true);
        let snap = monitor.snapshot();
        assert_eq!(snap.status, HealthStatus::Unknown);
        assert!(!snap.is_healthy);
        assert!(monitor.is_stale(Duration::from_secs(30)));

        assert!(monitor.check().await);
        let snap = monitor.snapshot();
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.last_check_at.is_some());
        assert!(!snap.check_in_progress);
        assert!(!monitor.is_stale(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn banner_raised_at_threshold_and_withdrawn() {
        let (transport, monitor, observers) = monitor(false);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        observers.subscribe(move |e| sink.lock().push(e.clone()));

        for _ in 0..4 {
            assert!(!monitor.check().await);
        }
        assert_eq!(monitor.consecutive_failures(), 4);
        assert_eq!(monitor.next_interval(), Duration::from_secs(15));

        transport.up.store(true, Ordering::Relaxed);
        assert!(monitor.check().await);

        assert_eq!(
            *events.lock(),
            vec![
                NetworkEvent::ServerUnavailable {
                    consecutive_failures: 3
                },
                NetworkEvent::ServerRecovered,
            ]
        );
    }

    #[test]
    fn reset_returns_to_unknown() {
        let (_t, monitor, _o) = monitor(true);
        monitor.record_failure();
        monitor.reset();
        let snap = monitor.snapshot();
        assert_eq!(snap.status, HealthStatus::Unknown);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_on_cancel() {
        let (_t, monitor, _o) = monitor(true);
        let monitor = Arc::new(monitor);
        let cancel = CancellationToken::new();
        let handle = monitor.spawn_polling(cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(monitor.is_healthy());
        cancel.cancel();
        handle.await.unwrap();
    }
}
