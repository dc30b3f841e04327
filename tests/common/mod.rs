//! Shared test fixtures: a scripted in-process transport and client helpers

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};

use miniapp_net::auth::{MemoryStore, StaticIdentity};
use miniapp_net::transport::{HttpRequest, HttpResponse, Transport};
use miniapp_net::{ClientConfig, Error, NetworkClient, Result};

pub const BASE_URL: &str = "http://localhost:8000";
pub const HEALTH: &str = "/api/health";
pub const REFRESH: &str = "/api/auth/refresh";

/// One scripted answer
#[derive(Clone)]
pub enum Reply {
    Respond(HttpResponse),
    Fail(Error),
    /// Answer after sleeping (tokio time)
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Self::Respond(HttpResponse::json(status, &body))
    }

    pub fn ok() -> Self {
        Self::json(200, json!({"status": "ok"}))
    }

    pub fn status(status: u16) -> Self {
        Self::Respond(HttpResponse::empty(status))
    }

    pub fn network_error() -> Self {
        Self::Fail(Error::Network("connection refused".to_string()))
    }

    pub fn token(token: &str) -> Self {
        Self::json(
            200,
            json!({"token": token, "expires_at": "2099-01-01T00:00:00Z"}),
        )
    }

    pub fn after(delay: Duration, reply: Reply) -> Self {
        Self::Delayed(delay, Box::new(reply))
    }
}

/// What the transport saw
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

/// Replies keyed by URL path. The last reply for a path repeats; unknown
/// paths answer 404.
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    online: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
        })
    }

    /// Backend whose health probe succeeds
    pub fn healthy() -> Arc<Self> {
        let transport = Self::new();
        transport.on(HEALTH, Reply::ok());
        transport
    }

    /// Queue `reply` for `path`
    pub fn on(&self, path: &str, reply: Reply) -> &Self {
        self.routes
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls_to(path).len()
    }

    fn next_reply(&self, path: &str) -> Reply {
        let mut routes = self.routes.lock();
        match routes.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| Reply::status(404)),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| Reply::status(404)),
            None => Reply::status(404),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let path = request.path();
        self.calls.lock().push(RecordedCall {
            method: request.method.clone(),
            path: path.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });

        let mut reply = self.next_reply(&path);
        loop {
            match reply {
                Reply::Respond(response) => return Ok(response),
                Reply::Fail(error) => return Err(error),
                Reply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Local config with min-interval throttling off and fast backoff
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::for_base_url(BASE_URL);
    config.user_id = Some("42".to_string());
    config.throttle.enabled = false;
    config.local.backoff_base = Duration::from_millis(10);
    config
}

pub fn client_with(transport: &Arc<ScriptedTransport>, config: ClientConfig) -> NetworkClient {
    NetworkClient::builder(config.clone())
        .transport(Arc::clone(transport) as Arc<dyn Transport>)
        .identity(Arc::new(StaticIdentity::new(config.user_id.clone())))
        .token_store(Arc::new(MemoryStore::new()))
        .build()
        .unwrap()
}

pub fn client(transport: &Arc<ScriptedTransport>) -> NetworkClient {
    client_with(transport, test_config())
}
