//! Per-call request options

use std::collections::HashMap;
use std::time::Duration;

/// Knobs for one [`NetworkClient::request`](super::NetworkClient::request) call
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Skip the readiness probe
    pub skip_health_check: bool,
    /// Ignore blocks and min intervals
    pub bypass_throttle: bool,
    /// Allow concurrent calls to this endpoint; `false` rejects a second
    /// caller while one is in flight
    pub allow_parallel: bool,
    /// Send no `Authorization` header and never refresh
    pub skip_token_check: bool,
    /// Send no user id header
    pub skip_user_id_check: bool,
    /// Dispatch timeout; the deployment default when unset
    pub timeout: Option<Duration>,
    /// Return the normalized error object as `Ok` instead of `Err`
    pub suppress_errors: bool,
    /// Extra headers, applied after the defaults
    pub headers: HashMap<String, String>,
    /// Retry budget override
    pub retries: Option<u32>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            skip_health_check: false,
            bypass_throttle: false,
            allow_parallel: true,
            skip_token_check: false,
            skip_user_id_check: false,
            timeout: None,
            suppress_errors: false,
            headers: HashMap::new(),
            retries: None,
        }
    }
}

impl RequestOptions {
    /// Default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject concurrent calls to the same endpoint
    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.allow_parallel = false;
        self
    }

    /// Return failures as the normalized error object
    #[must_use]
    pub fn suppress_errors(mut self) -> Self {
        self.suppress_errors = true;
        self
    }

    /// Skip the readiness probe
    #[must_use]
    pub fn skip_health_check(mut self) -> Self {
        self.skip_health_check = true;
        self
    }

    /// Ignore blocks and min intervals
    #[must_use]
    pub fn bypass_throttle(mut self) -> Self {
        self.bypass_throttle = true;
        self
    }

    /// Dispatch timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry budget for this call
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}
