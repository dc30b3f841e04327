//! Network client
//!
//! One [`NetworkClient`] owns all network state: health, throttling,
//! blocks, the token, in-flight tracking, counters and the response cache.
//! Clones share that state.

mod builder;
mod execute;
mod options;

pub use builder::NetworkClientBuilder;
pub use options::RequestOptions;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::auth::{IdentityProvider, TokenManager};
use crate::cache::ResponseCache;
use crate::config::{ClientConfig, Deployment, Tuning};
use crate::diagnostics::{
    ClientDiagnostics, ConnectionState, ConnectionTracker, RequestCounters,
};
use crate::endpoint::{Endpoint, is_absolute, normalize};
use crate::error::Error;
use crate::events::{NetworkEvent, Observers, SubscriptionId};
use crate::failsafe::{HealthMonitor, HealthState, RetryPolicy, ThrottleRegistry};
use crate::transport::Transport;

/// Shared state behind a [`NetworkClient`]
pub(crate) struct NetworkClientState {
    pub(crate) config: ClientConfig,
    pub(crate) deployment: Deployment,
    pub(crate) tuning: Tuning,
    pub(crate) default_headers: HeaderMap,
    pub(crate) refresh_endpoint: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) identity: Arc<dyn IdentityProvider>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) throttle: ThrottleRegistry,
    pub(crate) tokens: TokenManager,
    pub(crate) retry: RetryPolicy,
    pub(crate) observers: Observers,
    pub(crate) connection: ConnectionTracker,
    pub(crate) counters: RequestCounters,
    pub(crate) in_flight: DashSet<String>,
    pub(crate) cache: ResponseCache,
}

/// Resilient client for the mini-app backend
#[derive(Clone)]
pub struct NetworkClient {
    state: Arc<NetworkClientState>,
}

impl NetworkClient {
    /// Client with default collaborators
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self> {
        NetworkClientBuilder::new(config).build()
    }

    /// Builder for custom transport, identity, storage or observers
    #[must_use]
    pub fn builder(config: ClientConfig) -> NetworkClientBuilder {
        NetworkClientBuilder::new(config)
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.state.config
    }

    /// Effective deployment
    #[must_use]
    pub fn deployment(&self) -> Deployment {
        self.state.deployment
    }

    /// Canonical form of `endpoint` (absolute URLs pass through)
    #[must_use]
    pub fn normalize(&self, endpoint: &str) -> String {
        if is_absolute(endpoint) {
            endpoint.trim().to_string()
        } else {
            normalize(Some(endpoint), &self.state.config.api_prefix)
        }
    }

    /// Probe readiness now.
    ///
    /// Returns `Ok(true)` when the backend answered, `Ok(false)` when it did
    /// not but the production fallback lets traffic through.
    ///
    /// # Errors
    ///
    /// Returns `ServerUnavailable` when the backend is down and no fallback
    /// applies.
    pub async fn ensure_ready(&self) -> Result<bool> {
        if self.probe_if_needed().await {
            return Ok(true);
        }
        if self.production_fallback() {
            warn!("Backend not ready, continuing under production fallback");
            return Ok(false);
        }
        Err(Error::ServerUnavailable(
            "Server is not ready. Please try again later.".to_string(),
        ))
    }

    /// Healthy according to a fresh probe result, probing when stale
    pub(crate) async fn probe_if_needed(&self) -> bool {
        let health = &self.state.health;
        if health.is_healthy() && !health.is_stale(self.state.tuning.health_staleness) {
            return true;
        }
        debug!("Health state stale or unhealthy, probing");
        health.check().await
    }

    pub(crate) fn production_fallback(&self) -> bool {
        self.state.deployment.is_production() && self.state.config.health.production_fallback
    }

    /// Fetch a new token (single-flight)
    pub async fn refresh_token(&self) -> Result<String> {
        self.state.tokens.refresh().await
    }

    /// Wipe the token from memory and storage
    pub fn clear_token(&self) {
        self.state.tokens.clear();
    }

    /// Token manager, for seeding a token obtained elsewhere
    #[must_use]
    pub fn tokens(&self) -> &TokenManager {
        &self.state.tokens
    }

    /// Health snapshot
    #[must_use]
    pub fn health(&self) -> HealthState {
        self.state.health.snapshot()
    }

    /// Connection snapshot
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection.snapshot()
    }

    /// Full state snapshot
    #[must_use]
    pub fn diagnostics(&self) -> ClientDiagnostics {
        let token = self.state.tokens.current();
        let mut in_flight: Vec<String> = self.state.in_flight.iter().map(|e| e.key().clone()).collect();
        in_flight.sort();

        ClientDiagnostics {
            deployment: self.state.deployment,
            base_url: self.state.config.base_url.clone(),
            health: self.state.health.snapshot(),
            connection: self.state.connection.snapshot(),
            counters: self.state.counters.snapshot(),
            blocked: self.state.throttle.blocked_patterns(),
            in_flight,
            has_token: token.value.is_some(),
            token_expires_at: token.expires_at,
            cache: self.state.cache.stats(),
        }
    }

    /// Zero counters, drop blocks, reset health and connection state.
    ///
    /// The token and the cache survive. In-flight entries belong to the
    /// calls holding them and are released when those calls finish.
    pub fn reset_state(&self) {
        self.state.counters.reset();
        self.state.throttle.clear_all();
        self.state.health.reset();
        self.state.connection.reset();
        info!("Network state reset");
    }

    /// Register an event callback
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.state.observers.subscribe(callback)
    }

    /// Remove an event callback
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.observers.unsubscribe(id)
    }

    /// Broadcast receiver for events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.state.observers.listen()
    }

    /// Poll backend health on the adaptive schedule until `cancel` fires
    pub fn start_health_monitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        info!("Starting health monitor");
        self.state.health.spawn_polling(cancel)
    }

    /// GET through the response cache.
    ///
    /// A hit returns without touching the network. Successful responses are
    /// stored for `ttl` under `tags`; suppressed error objects are not.
    pub async fn request_cached(
        &self,
        endpoint: impl Into<Endpoint>,
        ttl: Duration,
        tags: &[&str],
        options: RequestOptions,
    ) -> Result<Value> {
        let endpoint = endpoint.into();
        let Some(raw) = endpoint.resolve() else {
            return self.request(endpoint, Method::GET, None, options).await;
        };
        let key = self.normalize(&raw);

        if let Some(hit) = self.state.cache.get(&key) {
            debug!(endpoint = %raw, "Serving cached response");
            return Ok(hit);
        }

        let value = self.request(raw.as_str(), Method::GET, None, options).await?;
        let is_error_object = value.get("status").and_then(Value::as_str) == Some("error")
            && value.get("code").is_some();
        if !is_error_object {
            self.state.cache.set(&key, value.clone(), ttl, tags);
        }
        Ok(value)
    }

    /// Drop cached responses carrying any of `tags`
    pub fn invalidate(&self, tags: &[&str]) -> usize {
        self.state.cache.remove_by_tags(tags)
    }
}
