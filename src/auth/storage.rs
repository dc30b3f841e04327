//! Persisted key/value storage for the auth token
//!
//! Mirrors browser `localStorage` semantics so a token survives restarts.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Storage key for the token value
pub const TOKEN_KEY: &str = "auth_token";

/// Storage key for the token expiry (RFC 3339)
pub const TOKEN_EXPIRY_KEY: &str = "auth_token_expires_at";

/// `getItem` / `setItem` / `removeItem`
pub trait TokenStore: Send + Sync {
    /// Read a value
    fn get_item(&self, key: &str) -> Option<String>;

    /// Write a value
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value; deleting a missing key is not an error
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: DashMap<String, String>,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).map(|v| v.value().clone())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items.remove(key);
        Ok(())
    }
}

/// JSON file store, one file holding all keys
pub struct FileStore {
    path: PathBuf,
    // serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileStore {
    /// Store under `base_dir`, creating it if needed
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir)
                .map_err(|e| Error::Unknown(format!("Failed to create token storage dir: {e}")))?;
        }

        Ok(Self {
            path: base_dir.join("token_store.json"),
            lock: Mutex::new(()),
        })
    }

    /// Store in the default location (~/.miniapp-net)
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Unknown("Cannot determine home directory".to_string()))?;

        Self::new(home.join(".miniapp-net"))
    }

    fn read_all(&self) -> BTreeMap<String, String> {
        if !self.path.exists() {
            return BTreeMap::new();
        }
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Failed to parse token store");
                BTreeMap::new()
            }),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read token store");
                BTreeMap::new()
            }
        }
    }

    fn write_all(&self, items: &BTreeMap<String, String>) -> Result<()> {
        let content = serde_json::to_string_pretty(items)
            .map_err(|e| Error::Unknown(format!("Failed to serialize token store: {e}")))?;

        fs::write(&self.path, content)
            .map_err(|e| Error::Unknown(format!("Failed to write token store: {e}")))?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&self.path, perms);
        }

        Ok(())
    }
}

impl TokenStore for FileStore {
    fn get_item(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock();
        self.read_all().remove(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut items = self.read_all();
        items.insert(key.to_string(), value.to_string());
        self.write_all(&items)?;
        debug!(key, "Persisted item");
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut items = self.read_all();
        if items.remove(key).is_some() {
            self.write_all(&items)?;
            debug!(key, "Removed persisted item");
        }
        Ok(())
    }
}
