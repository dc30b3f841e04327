//! Error types for the network layer

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::Deployment;

/// Result type alias for the network layer
pub type Result<T> = std::result::Result<T, Error>;

/// Network layer errors
///
/// Every variant is `Clone` so a single refresh outcome can be handed to
/// all callers waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Empty endpoint passed to `request`
    #[error("Endpoint is required")]
    MissingEndpoint,

    /// Runtime reports no network connectivity
    #[error("No network connection")]
    Offline,

    /// Endpoint is blocked after a 429
    #[error("Rate limited, retry in {retry_after}s")]
    RateLimited {
        /// Seconds until the block lifts
        retry_after: u64,
    },

    /// A non-parallel endpoint already has a call in flight
    #[error("Request already in progress: {0}")]
    ConcurrentRequest(String),

    /// Authentication failed after the refresh cycle
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 404 from the backend
    #[error("Not found: {0}")]
    NotFound(String),

    /// 5xx response or failed readiness gate
    #[error("Server temporarily unavailable: {0}")]
    ServerUnavailable(String),

    /// Transport-level failure (connection refused, reset, DNS)
    #[error("Network error: {0}")]
    Network(String),

    /// Dispatch exceeded its time bound
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// Any other non-2xx status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code
        status: u16,
        /// Message parsed from the response body
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything that fits nowhere else (bad JSON, storage failures)
    #[error("{0}")]
    Unknown(String),
}

/// Stable, serializable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// See [`Error::MissingEndpoint`]
    MissingEndpoint,
    /// See [`Error::Offline`]
    Offline,
    /// See [`Error::RateLimited`]
    RateLimited,
    /// See [`Error::ConcurrentRequest`]
    ConcurrentRequest,
    /// See [`Error::Unauthorized`]
    Unauthorized,
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::ServerUnavailable`]
    ServerUnavailable,
    /// See [`Error::Network`]
    NetworkError,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::Http`]
    HttpError,
    /// See [`Error::Config`]
    Config,
    /// See [`Error::Unknown`]
    Unknown,
}

impl ErrorCode {
    /// Wire name of the code
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingEndpoint => "missing_endpoint",
            Self::Offline => "offline",
            Self::RateLimited => "rate_limited",
            Self::ConcurrentRequest => "concurrent_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::ServerUnavailable => "server_unavailable",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::HttpError => "http_error",
            Self::Config => "config",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized error object returned instead of `Err` when errors are suppressed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Always `"error"`
    pub status: &'static str,
    /// Classification
    pub code: ErrorCode,
    /// Human readable message
    pub message: String,
    /// Seconds to wait, for `rate_limited`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl Error {
    /// Classification of this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingEndpoint => ErrorCode::MissingEndpoint,
            Self::Offline => ErrorCode::Offline,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::ConcurrentRequest(_) => ErrorCode::ConcurrentRequest,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::ServerUnavailable(_) => ErrorCode::ServerUnavailable,
            Self::Network(_) => ErrorCode::NetworkError,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Http { .. } => ErrorCode::HttpError,
            Self::Config(_) => ErrorCode::Config,
            Self::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// Transport-level failures are the only ones retried with backoff
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Seconds to wait, for rate-limit errors
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Message suitable for a user-facing banner.
    ///
    /// Token problems hide technical detail in production.
    #[must_use]
    pub fn user_message(&self, deployment: Deployment) -> String {
        match self {
            Self::RateLimited { retry_after } => {
                format!("Too many requests. Please wait {retry_after} seconds.")
            }
            Self::Unauthorized(detail) => {
                if deployment.is_production() {
                    "Session expired. Please reload the app.".to_string()
                } else {
                    format!("Session expired. Please reload the app. ({detail})")
                }
            }
            Self::Offline => "No internet connection.".to_string(),
            Self::ServerUnavailable(_) | Self::Timeout(_) | Self::Network(_) => {
                "Server is temporarily unavailable. Please try again later.".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Normalized error object
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            status: "error",
            code: self.code(),
            message: self.to_string(),
            retry_after: self.retry_after(),
        }
    }

    /// Normalized error object as JSON
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.to_payload()).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Unknown(format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rate_limited_payload_carries_retry_after() {
        let err = Error::RateLimited { retry_after: 10 };
        let value = err.to_value();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "rate_limited");
        assert_eq!(value["retryAfter"], 10);
    }

    #[test]
    fn payload_omits_retry_after_for_other_codes() {
        let value = Error::NotFound("api/user/1".into()).to_value();
        assert_eq!(value["code"], "not_found");
        assert!(value.get("retryAfter").is_none());
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(Error::Network("reset".into()).is_transport());
        assert!(Error::Timeout(100).is_transport());
        assert!(!Error::ServerUnavailable("503".into()).is_transport());
        assert!(!Error::NotFound("x".into()).is_transport());
        assert!(!Error::Offline.is_transport());
    }

    #[test]
    fn unauthorized_message_hides_detail_in_production() {
        let err = Error::Unauthorized("refresh returned 401".into());
        let prod = err.user_message(Deployment::Production);
        assert_eq!(prod, "Session expired. Please reload the app.");
        let local = err.user_message(Deployment::Local);
        assert!(local.contains("refresh returned 401"));
    }

    #[test]
    fn code_wire_names_match_serde() {
        for code in [ErrorCode::MissingEndpoint, ErrorCode::ConcurrentRequest, ErrorCode::NetworkError] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.as_str()));
        }
    }
}
