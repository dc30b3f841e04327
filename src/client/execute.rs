//! Request execution
//!
//! One logical call runs: dedup → readiness → block/throttle → offline
//! check → headers → dispatch → classify, looping only for transport
//! failures (with backoff) and a single refresh-and-replay after a 401.

use dashmap::DashSet;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{Instrument, debug, info, info_span, warn};

use super::builder::encode_headers;
use super::{NetworkClient, RequestOptions};
use crate::auth::USER_ID_HEADER;
use crate::endpoint::{Endpoint, build_url};
use crate::events::NetworkEvent;
use crate::failsafe::ceil_secs;
use crate::request_id::{self, REQUEST_ID_HEADER};
use crate::transport::{HttpRequest, HttpResponse};
use crate::{Error, Result};

/// Marks a non-parallel endpoint as in flight until dropped
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    key: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a DashSet<String>, key: &str) -> Result<Self> {
        if set.insert(key.to_string()) {
            Ok(Self {
                set,
                key: key.to_string(),
            })
        } else {
            Err(Error::ConcurrentRequest(key.to_string()))
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

/// What to do after classifying a response
enum Outcome {
    Done(Value),
    Replay,
}

impl NetworkClient {
    /// Perform one logical request.
    ///
    /// `body` is sent as JSON. On success the parsed payload is returned
    /// (`null` for an empty body).
    ///
    /// # Errors
    ///
    /// Returns the classified failure, unless `options.suppress_errors` is
    /// set, in which case the normalized error object is returned as `Ok`.
    pub async fn request(
        &self,
        endpoint: impl Into<Endpoint>,
        method: Method,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let endpoint = endpoint.into().resolve().map(|raw| self.normalize(&raw));
        let request_id = request_id::current().unwrap_or_else(request_id::generate);
        let span = info_span!(
            "request",
            endpoint = endpoint.as_deref().unwrap_or(""),
            method = %method,
            request_id = %request_id,
        );

        let _count = self.state.counters.begin();
        let result = match endpoint.as_deref() {
            None => Err(Error::MissingEndpoint),
            Some(ep) => {
                request_id::with_request_id(request_id, self.execute(ep, &method, body, &options))
                    .instrument(span.clone())
                    .await
            }
        };

        result.or_else(|error| {
            let _enter = span.enter();
            self.fail(endpoint.as_deref().unwrap_or(""), error, &options)
        })
    }

    fn fail(&self, endpoint: &str, error: Error, options: &RequestOptions) -> Result<Value> {
        self.state.counters.record_error();
        warn!(code = %error.code(), error = %error, "Request failed");

        if options.suppress_errors {
            return Ok(error.to_value());
        }
        self.state.observers.emit(&NetworkEvent::RequestFailed {
            endpoint: endpoint.to_string(),
            code: error.code(),
            message: error.user_message(self.state.deployment),
        });
        Err(error)
    }

    async fn execute(
        &self,
        endpoint: &str,
        method: &Method,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> Result<Value> {
        let state = &self.state;

        // Rejection happens before any await so the second caller never
        // touches the network
        let _in_flight = if !options.allow_parallel || state.config.is_non_parallel(endpoint) {
            Some(InFlightGuard::acquire(&state.in_flight, endpoint)?)
        } else {
            None
        };

        if !options.skip_health_check {
            self.check_readiness(endpoint).await?;
        }

        if !options.bypass_throttle {
            if let Some(remaining) = state.throttle.remaining_block(endpoint) {
                return Err(Error::RateLimited {
                    retry_after: ceil_secs(remaining),
                });
            }
            let wait = state.throttle.acquire(endpoint);
            if !wait.is_zero() {
                debug!(delay_ms = wait.as_millis(), "Waiting out min interval");
                tokio::time::sleep(wait).await;
            }
        }

        if !state.transport.is_online() {
            return Err(Error::Offline);
        }

        let extra_headers = encode_headers(
            options
                .headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        let timeout = options.timeout.unwrap_or(state.tuning.request_timeout);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let max_retries = options.retries.unwrap_or(state.retry.max_retries);

        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let mut request = HttpRequest::new(
                method.clone(),
                build_url(&state.config.base_url, endpoint, &state.config.api_prefix)?,
                timeout,
            );
            request.headers = self.headers_for(options, &extra_headers).await;
            request.body.clone_from(&body);

            debug!(attempt, url = %request.url, "Dispatching");
            let sent = tokio::time::timeout(timeout, state.transport.send(request))
                .await
                .unwrap_or(Err(Error::Timeout(timeout_ms)));

            match sent {
                Ok(response) => {
                    match self
                        .classify(endpoint, response, options, attempt < max_retries, &mut refreshed)
                        .await?
                    {
                        Outcome::Done(value) => return Ok(value),
                        Outcome::Replay => {
                            attempt += 1;
                            debug!(attempt, "Replaying with refreshed token");
                        }
                    }
                }
                Err(e) if e.is_transport() => {
                    let failed = state.connection.record_transport_failure();
                    if attempt >= max_retries {
                        warn!(attempt, failed_attempts = failed, error = %e, "Retries exhausted");
                        return Err(e);
                    }
                    // failed_attempts spans calls until the next success
                    let delay = state.retry.delay_for(failed.saturating_sub(1));
                    attempt += 1;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Readiness gate ahead of dispatch
    async fn check_readiness(&self, endpoint: &str) -> Result<()> {
        if self.probe_if_needed().await {
            return Ok(());
        }
        if self.production_fallback() {
            warn!("Health probe failed, proceeding under production fallback");
            return Ok(());
        }
        if self.state.config.is_critical(endpoint) {
            return Err(Error::ServerUnavailable(
                "Server is not responding. Please try again later.".to_string(),
            ));
        }
        debug!("Health probe failed, non-critical endpoint proceeds");
        Ok(())
    }

    async fn headers_for(&self, options: &RequestOptions, extra: &HeaderMap) -> HeaderMap {
        let state = &self.state;
        let mut headers = state.default_headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if !options.skip_token_check {
            if let Some(token) = self.bearer_token().await {
                if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(AUTHORIZATION, v);
                }
            }
        }

        if !options.skip_user_id_check {
            if let Some(v) = state
                .identity
                .user_id()
                .and_then(|id| HeaderValue::from_str(&id).ok())
            {
                headers.insert(USER_ID_HEADER, v);
            }
        }

        for (name, value) in extra {
            headers.insert(name.clone(), value.clone());
        }

        if let Some(v) = request_id::current().and_then(|id| HeaderValue::from_str(&id).ok()) {
            headers.insert(REQUEST_ID_HEADER, v);
        }
        headers
    }

    /// Token to attach: refreshed first when expired, the stale one if that fails
    async fn bearer_token(&self) -> Option<String> {
        let token = self.state.tokens.current();
        let value = token.value.clone()?;
        if !token.is_expired() {
            return Some(value);
        }
        match self.state.tokens.refresh().await {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                debug!(error = %e, "Refresh of expired token failed, sending stale token");
                Some(value)
            }
        }
    }

    async fn classify(
        &self,
        endpoint: &str,
        response: HttpResponse,
        options: &RequestOptions,
        retries_left: bool,
        refreshed: &mut bool,
    ) -> Result<Outcome> {
        let state = &self.state;
        let status = response.status;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .retry_after_secs()
                .unwrap_or_else(|| ceil_secs(state.config.throttle.default_retry_after));
            let pattern = state.throttle.register_block(endpoint, retry_after);
            warn!(%pattern, retry_after, "Rate limited by server");
            state.observers.emit(&NetworkEvent::RateLimited {
                pattern,
                retry_after,
            });
            return Err(Error::RateLimited { retry_after });
        }

        if status == StatusCode::UNAUTHORIZED {
            if endpoint == state.refresh_endpoint || options.skip_token_check {
                return Err(Error::Unauthorized(response.error_message()));
            }
            if retries_left && !*refreshed {
                *refreshed = true;
                info!("Unauthorized, refreshing token");
                return match state.tokens.refresh().await {
                    Ok(_) => Ok(Outcome::Replay),
                    Err(e) => {
                        state.tokens.clear();
                        Err(Error::Unauthorized(format!("Token refresh failed: {e}")))
                    }
                };
            }
            state.tokens.clear();
            return Err(Error::Unauthorized(response.error_message()));
        }

        if status.is_server_error() {
            state.connection.record_server_failure();
            state.health.record_failure();
            return Err(Error::ServerUnavailable(format!(
                "Server temporarily unavailable (HTTP {})",
                status.as_u16()
            )));
        }

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(endpoint.to_string()));
        }

        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: response.error_message(),
            });
        }

        let value = response.json_body()?;
        state.connection.record_success();
        state.health.record_success();
        debug!(status = status.as_u16(), "Request succeeded");
        Ok(Outcome::Done(value))
    }
}
