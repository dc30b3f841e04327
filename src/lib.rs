//! miniapp-net
//!
//! Resilient network access layer for Telegram mini-app backends.
//!
//! # Features
//!
//! - **Readiness gating**: health probes with an adaptive schedule and a
//!   "server unavailable" banner after repeated failures
//! - **Throttling**: per-endpoint minimum intervals and local blocks after a 429
//! - **Deduplication**: one call in flight for non-parallel endpoints
//! - **Auth**: bearer token with single-flight refresh and one replay after a 401
//! - **Failsafes**: bounded exponential backoff for transport failures
//! - **Diagnostics**: counters, snapshots and a connectivity self-test

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod failsafe;
pub mod request_id;
pub mod transport;

pub use client::{NetworkClient, NetworkClientBuilder, RequestOptions};
pub use config::ClientConfig;
pub use error::{Error, ErrorCode, Result};
pub use events::{NetworkEvent, SubscriptionId};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
