//! Authentication for backend calls
//!
//! - Bearer token ownership with single-flight refresh
//! - Persisted token storage (memory or JSON file)
//! - Caller identity (Telegram user id)

mod identity;
mod storage;
mod token;

pub use identity::{IdentityProvider, StaticIdentity};
pub use storage::{FileStore, MemoryStore, TOKEN_EXPIRY_KEY, TOKEN_KEY, TokenStore};
pub use token::{AuthToken, TokenManager, TokenManagerConfig};

/// Header carrying the caller's Telegram user id
pub const USER_ID_HEADER: &str = "x-telegram-user-id";
