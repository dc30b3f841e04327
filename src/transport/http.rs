//! HTTP transport backed by `reqwest`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, trace};

use super::{HttpRequest, HttpResponse, Transport};
use crate::{Error, Result};

/// `reqwest`-backed transport
pub struct HttpTransport {
    /// Pooled HTTP client
    client: Client,
    /// Connectivity flag; flipped by the host when the OS reports offline
    online: AtomicBool,
}

impl HttpTransport {
    /// Create a transport with a pooled client
    pub fn new(connect_timeout: Duration) -> Result<Arc<Self>> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Arc::new(Self {
            client,
            online: AtomicBool::new(true),
        }))
    }

    /// Record connectivity as reported by the host environment
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
        trace!(method = %request.method, url = %request.url, "Dispatching");

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers)
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify(&e, timeout_ms))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify(&e, timeout_ms))?;

        debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "Response received");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}

fn classify(e: &reqwest::Error, timeout_ms: u64) -> Error {
    if e.is_timeout() {
        Error::Timeout(timeout_ms)
    } else {
        Error::Network(e.to_string())
    }
}
