//! Failsafe mechanisms: retry backoff, throttling, rate-limit blocks, health monitoring

mod health;
mod retry;
mod throttle;

pub use health::{HealthMonitor, HealthState, HealthStatus, interval_for};
pub use retry::RetryPolicy;
pub use throttle::{BlockInfo, DEFAULT_PATTERN, ThrottleRegistry, ceil_secs};
