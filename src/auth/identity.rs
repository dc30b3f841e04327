//! Caller identity

use parking_lot::RwLock;

/// Source of the current Telegram user id
pub trait IdentityProvider: Send + Sync {
    /// Current user id, `None` before the mini-app has initialized
    fn user_id(&self) -> Option<String>;
}

/// Identity set once (from config) and replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticIdentity {
    user_id: RwLock<Option<String>>,
}

impl StaticIdentity {
    /// Identity with an optional initial id
    #[must_use]
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id: RwLock::new(user_id.filter(|id| !id.trim().is_empty())),
        }
    }

    /// Replace the id, e.g. after Telegram init data arrives
    pub fn set(&self, user_id: Option<String>) {
        *self.user_id.write() = user_id.filter(|id| !id.trim().is_empty());
    }
}

impl IdentityProvider for StaticIdentity {
    fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_ids_are_absent() {
        assert!(StaticIdentity::new(Some("  ".into())).user_id().is_none());
        let identity = StaticIdentity::new(None);
        identity.set(Some("42".into()));
        assert_eq!(identity.user_id().as_deref(), Some("42"));
    }
}
