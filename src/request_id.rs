//! Request ID generation and task-local propagation.
//!
//! A request ID is a UUID v4 string prefixed with `"mn-"`, minted once per
//! logical [`NetworkClient::request`](crate::client::NetworkClient::request)
//! call. Every attempt of that call (retries and the post-refresh replay)
//! carries it in the `X-Request-Id` header, so backend logs can group them.
//!
//! Callers that already have a correlation ID can install it with
//! [`with_request_id`]; the client then reuses it instead of minting one.

use uuid::Uuid;

/// Header carrying the request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    /// Request ID for the current task
    pub static REQUEST_ID: String;
}

/// New request ID: `"mn-<uuid-v4>"`
#[must_use]
pub fn generate() -> String {
    format!("mn-{}", Uuid::new_v4())
}

/// Request ID installed for the current task, if any
#[must_use]
pub fn current() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// Run `future` with `request_id` installed as the task-local ID
pub async fn with_request_id<F, T>(request_id: String, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    REQUEST_ID.scope(request_id, future).await
}
