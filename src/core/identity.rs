//! Small key/value store for the local identity and session secrets.
//!
//! The chat core reads three values: the current user id, the auth token used
//! for REST calls, and the ledger signing key. The keyring-backed store is the
//! default; [`MemoryStore`] backs tests and `--no-keyring` runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use keyring::Entry;
use tracing::{debug, warn};

use crate::core::keyring::StoreError;
use crate::core::session::SessionError;

pub const KEYRING_SERVICE: &str = "sparkchat";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_AUTH_TOKEN: &str = "auth_token";
pub const KEY_LEDGER_SIGNING_KEY: &str = "ledger_signing_key";

pub trait IdentityStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Whether values outlive the process.
    fn persists(&self) -> bool {
        false
    }
}

/// Platform keyring, with a per-process read cache so repeated lookups do not
/// prompt the OS credential service.
pub struct KeyringStore {
    service: String,
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(cached) = self.cache().get(key) {
            return Ok(cached.clone());
        }

        let entry = Entry::new(&self.service, key)?;
        let value = match entry.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(err) => return Err(StoreError::from(err)),
        };
        debug!(key, present = value.is_some(), "Keyring lookup");
        self.cache().insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let entry = Entry::new(&self.service, key)?;
        entry.set_password(value)?;
        self.cache().insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let entry = Entry::new(&self.service, key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                self.cache().insert(key.to_string(), None);
                Ok(())
            }
            Err(err) => Err(StoreError::from(err)),
        }
    }

    fn persists(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user_id: &str) -> Self {
        let store = Self::new();
        store
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(KEY_USER_ID.to_string(), user_id.to_string());
        store
    }

    /// Number of `set` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl IdentityStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
        *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Reads the local user id. Missing, blank, or unreadable all mean the
/// session cannot start.
pub fn resolve_user_id(store: &dyn IdentityStore) -> Result<String, SessionError> {
    match store.get(KEY_USER_ID) {
        Ok(Some(user_id)) if !user_id.trim().is_empty() => Ok(user_id.trim().to_string()),
        Ok(_) => Err(SessionError::IdentityUnavailable),
        Err(err) => {
            warn!(error = %err, "Identity store lookup failed");
            Err(SessionError::IdentityUnavailable)
        }
    }
}

/// Auth token for REST calls, if one was stored at login.
pub fn resolve_auth_token(store: &dyn IdentityStore) -> Option<String> {
    match store.get(KEY_AUTH_TOKEN) {
        Ok(token) => token.filter(|token| !token.trim().is_empty()),
        Err(err) => {
            warn!(error = %err, "Auth token lookup failed");
            None
        }
    }
}
