//! Notification events and observer registry
//!
//! The network layer never talks to a presentation layer directly. It emits
//! [`NetworkEvent`]s; UI code subscribes with a callback or listens on a
//! broadcast channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ErrorCode;

/// Buffered events per broadcast listener
const EVENT_BUFFER: usize = 64;

/// Something UI code may want to react to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    /// A new token was stored
    TokenRefreshed {
        /// Expiry of the new token (RFC 3339)
        expires_at: String,
    },
    /// Token wiped from memory and storage
    TokenCleared,
    /// Consecutive probe failures reached the warning threshold
    ServerUnavailable {
        /// Failures so far
        consecutive_failures: u32,
    },
    /// First success after `ServerUnavailable`
    ServerRecovered,
    /// A 429 registered a local block
    RateLimited {
        /// Blocked pattern
        pattern: String,
        /// Block duration in seconds
        retry_after: u64,
    },
    /// A request ended in failure
    RequestFailed {
        /// Normalized endpoint
        endpoint: String,
        /// Classification
        code: ErrorCode,
        /// User-facing message
        message: String,
    },
}

/// Handle returned by [`Observers::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;

/// Observer registry; cheap to clone, clones share subscribers
#[derive(Clone)]
pub struct Observers {
    inner: Arc<ObserversInner>,
}

struct ObserversInner {
    callbacks: DashMap<u64, Callback>,
    next_id: AtomicU64,
    tx: broadcast::Sender<NetworkEvent>,
}

impl Observers {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(ObserversInner {
                callbacks: DashMap::new(),
                next_id: AtomicU64::new(1),
                tx,
            }),
        }
    }

    /// Register a callback invoked synchronously for every event
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.insert(id, Arc::new(callback));
        SubscriptionId(id)
    }

    /// Remove a callback; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.callbacks.remove(&id.0).is_some()
    }

    /// Receiver for events emitted after this call
    #[must_use]
    pub fn listen(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.tx.subscribe()
    }

    /// Number of registered callbacks
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.len()
    }

    /// Deliver an event to every callback and listener
    pub fn emit(&self, event: &NetworkEvent) {
        // Snapshot first so a callback may (un)subscribe without deadlocking the map
        let callbacks: Vec<Callback> = self
            .inner
            .callbacks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for callback in callbacks {
            callback(event);
        }

        if self.inner.tx.send(event.clone()).is_err() {
            debug!("No event listeners attached");
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn callbacks_receive_events_until_unsubscribed() {
        let observers = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = observers.subscribe(move |e| sink.lock().push(e.clone()));

        observers.emit(&NetworkEvent::TokenCleared);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.emit(&NetworkEvent::ServerRecovered);

        assert_eq!(*seen.lock(), vec![NetworkEvent::TokenCleared]);
        assert_eq!(observers.callback_count(), 0);
    }

    #[tokio::test]
    async fn listeners_receive_broadcast() {
        let observers = Observers::new();
        let mut rx = observers.listen();
        observers.emit(&NetworkEvent::ServerUnavailable {
            consecutive_failures: 3,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            NetworkEvent::ServerUnavailable {
                consecutive_failures: 3
            }
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(NetworkEvent::RateLimited {
            pattern: "raffles".into(),
            retry_after: 10,
        })
        .unwrap();
        assert_eq!(value["type"], "rate_limited");
        assert_eq!(value["retry_after"], 10);
    }
}
