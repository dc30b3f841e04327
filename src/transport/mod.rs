//! Transport seam for backend dispatch

mod http;

pub use self::http::HttpTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::Result;

/// A fully assembled outbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Headers
    pub headers: HeaderMap,
    /// JSON body
    pub body: Option<Value>,
    /// Upper bound for the whole exchange
    pub timeout: Duration,
}

impl HttpRequest {
    /// Request with no headers or body
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout,
        }
    }

    /// Path component of the URL, for logging and test routing
    #[must_use]
    pub fn path(&self) -> String {
        url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.url.clone())
    }
}

/// A buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Bytes,
}

impl HttpResponse {
    /// Response with a JSON body
    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    /// Response with an empty body
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header, ignoring invalid names or values
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(k), Ok(v)) = (
            name.parse::<reqwest::header::HeaderName>(),
            value.parse::<reqwest::header::HeaderValue>(),
        ) {
            self.headers.insert(k, v);
        }
        self
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// `Retry-After` in whole seconds, if present and numeric
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    }

    /// Body parsed as JSON; an empty body is `null`
    pub fn json_body(&self) -> Result<Value> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Best-effort error message from the body
    #[must_use]
    pub fn error_message(&self) -> String {
        if let Ok(value) = serde_json::from_slice::<Value>(&self.body) {
            for key in ["message", "error", "detail"] {
                if let Some(msg) = value.get(key).and_then(Value::as_str) {
                    return msg.to_string();
                }
            }
        }
        let text = String::from_utf8_lossy(&self.body).trim().to_string();
        if text.is_empty() {
            self.status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        } else {
            text
        }
    }
}

/// Transport trait for backend communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dispatch a request and buffer the response.
    ///
    /// Only transport-level failures are errors (`Network`/`Timeout`);
    /// any received status, including 4xx/5xx, is an `Ok` response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Whether the runtime has network connectivity
    fn is_online(&self) -> bool {
        true
    }
}
