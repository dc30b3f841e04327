//! Client construction

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info};

use super::{NetworkClient, NetworkClientState};
use crate::auth::{
    FileStore, IdentityProvider, MemoryStore, StaticIdentity, TokenManager, TokenManagerConfig,
    TokenStore,
};
use crate::cache::ResponseCache;
use crate::config::ClientConfig;
use crate::diagnostics::{ConnectionTracker, RequestCounters};
use crate::endpoint::{normalize, plain_url};
use crate::events::Observers;
use crate::failsafe::{HealthMonitor, RetryPolicy, ThrottleRegistry};
use crate::transport::{HttpTransport, Transport};
use crate::{Error, Result};

/// Connect timeout for the default `reqwest` transport
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for [`NetworkClient`]; every collaborator has a default
pub struct NetworkClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    store: Option<Arc<dyn TokenStore>>,
    observers: Option<Observers>,
}

impl NetworkClientBuilder {
    /// Start from `config`
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            identity: None,
            store: None,
            observers: None,
        }
    }

    /// Dispatch through `transport` instead of `reqwest`
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Resolve the user id from `identity` instead of `config.user_id`
    #[must_use]
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Persist the token in `store`
    #[must_use]
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an observer registry
    #[must_use]
    pub fn observers(mut self, observers: Observers) -> Self {
        self.observers = Some(observers);
        self
    }

    /// Build the client
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a default header
    /// cannot be encoded, or the default transport or token store cannot be
    /// created.
    pub fn build(self) -> Result<NetworkClient> {
        let config = self.config;
        config.validate()?;

        let deployment = config.deployment();
        let tuning = config.tuning().clone();
        let prefix = config.api_prefix.as_str();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => HttpTransport::new(CONNECT_TIMEOUT)?,
        };
        let identity: Arc<dyn IdentityProvider> = match self.identity {
            Some(i) => i,
            None => Arc::new(StaticIdentity::new(config.user_id.clone())),
        };
        let store: Arc<dyn TokenStore> = match self.store {
            Some(s) => s,
            None => match &config.token.storage_dir {
                Some(dir) => Arc::new(FileStore::new(PathBuf::from(dir))?),
                None => Arc::new(MemoryStore::new()),
            },
        };
        let observers = self.observers.unwrap_or_default();

        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&transport),
            plain_url(&config.base_url, &config.endpoints.health, prefix)?,
            tuning.probe_timeout,
            config.health.clone(),
            observers.clone(),
        ));

        let tokens = TokenManager::new(
            TokenManagerConfig {
                refresh_url: plain_url(&config.base_url, &config.endpoints.refresh, prefix)?,
                refresh_timeout: tuning.refresh_timeout,
                default_lifetime: config.token.default_lifetime,
            },
            Arc::clone(&transport),
            Arc::clone(&identity),
            store,
            observers.clone(),
        );

        let default_headers = encode_headers(
            config
                .default_headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )?;

        info!(
            base_url = %config.base_url,
            deployment = ?deployment,
            request_timeout_ms = tuning.request_timeout.as_millis(),
            "Network client ready"
        );

        let state = NetworkClientState {
            refresh_endpoint: normalize(Some(&config.endpoints.refresh), prefix),
            throttle: ThrottleRegistry::new(&config.throttle),
            retry: RetryPolicy::new(&config.retry, &tuning),
            counters: RequestCounters::new(config.counters_reset_interval),
            connection: ConnectionTracker::new(),
            in_flight: DashSet::new(),
            cache: ResponseCache::new(),
            deployment,
            tuning,
            default_headers,
            transport,
            identity,
            health,
            tokens,
            observers,
            config,
        };
        debug!("Client state initialized");

        Ok(NetworkClient {
            state: Arc::new(state),
        })
    }
}

/// Encode `(name, value)` pairs as a header map
pub(crate) fn encode_headers<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_str(name)
            .map_err(|e| Error::Config(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("Invalid value for header '{name}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_header_names() {
        assert!(encode_headers([("x-ok", "1")]).is_ok());
        let err = encode_headers([("bad header", "1")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = NetworkClientBuilder::new(ClientConfig::for_base_url("ftp://example.com"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
