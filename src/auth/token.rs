//! Bearer token ownership and single-flight refresh

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::USER_ID_HEADER;
use super::identity::IdentityProvider;
use super::storage::{TOKEN_EXPIRY_KEY, TOKEN_KEY, TokenStore};
use crate::events::{NetworkEvent, Observers};
use crate::transport::{HttpRequest, Transport};
use crate::{Error, Result};

type SharedRefresh = Shared<BoxFuture<'static, Result<String>>>;

/// Token value and expiry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthToken {
    /// Bearer token
    pub value: Option<String>,
    /// Expiry, if known
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    /// Whether the token is past its expiry; a token without expiry never expires
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// Refresh endpoint response.
///
/// Accepts `token` or `access_token`, `expires_at` (RFC 3339 or unix
/// seconds) or `expires_in`, optionally nested under `data`.
#[derive(Debug, Default, Deserialize)]
struct RefreshResponse {
    #[serde(default, alias = "access_token")]
    token: Option<String>,
    #[serde(default)]
    expires_at: Option<Value>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    data: Option<Box<RefreshResponse>>,
}

impl RefreshResponse {
    fn flatten(self) -> Self {
        if self.token.is_none() {
            if let Some(data) = self.data {
                return data.flatten();
            }
        }
        self
    }

    fn expiry(&self, default_lifetime: Duration) -> DateTime<Utc> {
        let explicit = match &self.expires_at {
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            _ => None,
        };

        explicit
            .or_else(|| {
                self.expires_in.and_then(|secs| {
                    chrono::Duration::try_seconds(i64::try_from(secs).ok()?).map(|d| Utc::now() + d)
                })
            })
            .unwrap_or_else(|| {
                Utc::now()
                    + chrono::Duration::from_std(default_lifetime)
                        .unwrap_or_else(|_| chrono::Duration::hours(24))
            })
    }
}

struct TokenInner {
    token: RwLock<AuthToken>,
    store: Arc<dyn TokenStore>,
    identity: Arc<dyn IdentityProvider>,
    transport: Arc<dyn Transport>,
    refresh_url: String,
    refresh_timeout: Duration,
    default_lifetime: Duration,
    observers: Observers,
    pending: Mutex<Option<SharedRefresh>>,
    refresh_calls: AtomicU64,
}

/// Settings for [`TokenManager::new`]
pub struct TokenManagerConfig {
    /// Absolute refresh URL
    pub refresh_url: String,
    /// Refresh dispatch timeout
    pub refresh_timeout: Duration,
    /// Lifetime when the server omits an expiry
    pub default_lifetime: Duration,
}

/// Owns the bearer token. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

impl TokenManager {
    /// Create a token manager
    #[must_use]
    pub fn new(
        config: TokenManagerConfig,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn TokenStore>,
        observers: Observers,
    ) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                token: RwLock::new(AuthToken::default()),
                store,
                identity,
                transport,
                refresh_url: config.refresh_url,
                refresh_timeout: config.refresh_timeout,
                default_lifetime: config.default_lifetime,
                observers,
                pending: Mutex::new(None),
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Current token, stale or not; falls back to persisted storage
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.current().value
    }

    /// Current token with its expiry
    #[must_use]
    pub fn current(&self) -> AuthToken {
        {
            let token = self.inner.token.read();
            if token.value.is_some() {
                return token.clone();
            }
        }
        self.inner.load_persisted()
    }

    /// Whether a token exists and has not expired
    #[must_use]
    pub fn has_valid_token(&self) -> bool {
        let token = self.current();
        token.value.is_some() && !token.is_expired()
    }

    /// Store a token obtained elsewhere
    pub fn set(&self, value: String, expires_at: Option<DateTime<Utc>>) {
        self.inner.store_token(value, expires_at);
    }

    /// Fetch a new token. Concurrent callers share one network call and
    /// receive the same token or error.
    pub async fn refresh(&self) -> Result<String> {
        let refresh = {
            let mut pending = self.inner.pending.lock();
            if let Some(existing) = pending.as_ref() {
                debug!("Joining in-flight token refresh");
                existing.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let refresh = async move {
                    let result = inner.run_refresh().await;
                    inner.pending.lock().take();
                    result
                }
                .boxed()
                .shared();
                *pending = Some(refresh.clone());
                refresh
            }
        };
        refresh.await
    }

    /// Wipe memory and storage, notifying observers; a no-op without a token
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Number of refresh calls that reached the network path
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::Relaxed)
    }

    /// Absolute refresh URL
    #[must_use]
    pub fn refresh_url(&self) -> &str {
        &self.inner.refresh_url
    }
}

impl TokenInner {
    fn load_persisted(&self) -> AuthToken {
        let Some(value) = self.store.get_item(TOKEN_KEY) else {
            return AuthToken::default();
        };
        let expires_at = self
            .store
            .get_item(TOKEN_EXPIRY_KEY)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let token = AuthToken {
            value: Some(value),
            expires_at,
        };
        debug!(expired = token.is_expired(), "Loaded persisted token");
        *self.token.write() = token.clone();
        token
    }

    fn store_token(&self, value: String, expires_at: Option<DateTime<Utc>>) {
        if let Err(e) = self.store.set_item(TOKEN_KEY, &value) {
            warn!(error = %e, "Failed to persist token");
        }
        match expires_at {
            Some(at) => {
                if let Err(e) = self.store.set_item(TOKEN_EXPIRY_KEY, &at.to_rfc3339()) {
                    warn!(error = %e, "Failed to persist token expiry");
                }
            }
            None => {
                let _ = self.store.remove_item(TOKEN_EXPIRY_KEY);
            }
        }
        *self.token.write() = AuthToken {
            value: Some(value),
            expires_at,
        };
    }

    fn clear(&self) {
        let held = std::mem::take(&mut *self.token.write()).value.is_some();
        if !held && self.store.get_item(TOKEN_KEY).is_none() {
            return;
        }
        for key in [TOKEN_KEY, TOKEN_EXPIRY_KEY] {
            if let Err(e) = self.store.remove_item(key) {
                warn!(key, error = %e, "Failed to remove persisted token");
            }
        }
        info!("Token cleared");
        self.observers.emit(&NetworkEvent::TokenCleared);
    }

    async fn run_refresh(&self) -> Result<String> {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);

        let user_id = self
            .identity
            .user_id()
            .ok_or_else(|| Error::Unauthorized("no user identity available".to_string()))?;

        let mut request = HttpRequest::new(Method::POST, self.refresh_url.clone(), self.refresh_timeout);
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(&user_id) {
            request.headers.insert(USER_ID_HEADER, v);
        }
        request.body = Some(json!({ "user_id": user_id }));

        let timeout_ms = u64::try_from(self.refresh_timeout.as_millis()).unwrap_or(u64::MAX);
        let response = tokio::time::timeout(self.refresh_timeout, self.transport.send(request))
            .await
            .map_err(|_| Error::Timeout(timeout_ms))??;

        let status = response.status;
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            warn!(status = status.as_u16(), "Token refresh rejected");
            self.clear();
            return Err(Error::Unauthorized(format!(
                "token refresh rejected with HTTP {}",
                status.as_u16()
            )));
        }
        if status.is_server_error() {
            return Err(Error::ServerUnavailable(format!(
                "token refresh returned HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: response.error_message(),
            });
        }

        let parsed: RefreshResponse = serde_json::from_slice::<RefreshResponse>(&response.body)
            .map_err(|e| Error::Unknown(format!("Failed to parse refresh response: {e}")))?
            .flatten();
        let expires_at = parsed.expiry(self.default_lifetime);
        let token = parsed
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Unknown("refresh response carried no token".to_string()))?;

        self.store_token(token.clone(), Some(expires_at));
        info!(expires_at = %expires_at, "Token refreshed successfully");
        self.observers.emit(&NetworkEvent::TokenRefreshed {
            expires_at: expires_at.to_rfc3339(),
        });

        Ok(token)
    }
}
