//! Bearer token and signing secret storage.
//!
//! The [`CredentialStore`] is the only owner of the credential pair. Every
//! setter writes straight through to the backing [`Storage`]; without a
//! backend the store behaves as permanently logged out.

use std::sync::Arc;

use veil::Redact;

use crate::storage::{Storage, SIGNING_SECRET_KEY, TOKEN_KEY};

/// Snapshot of the current credentials.
#[derive(Clone, Default, PartialEq, Eq, Hash, Redact)]
pub struct Credential {
    /// Opaque bearer token.
    #[redact]
    pub token: Option<String>,

    /// Shared secret for request signatures.
    #[redact]
    pub signing_secret: Option<String>,
}

/// Persistent store for the bearer token and signing secret.
#[derive(Clone, Default)]
pub struct CredentialStore {
    storage: Option<Arc<dyn Storage>>,
}

impl CredentialStore {
    #[must_use]
    pub fn new(storage: Option<Arc<dyn Storage>>) -> Self {
        Self { storage }
    }

    /// Creates a store without a backend: getters return `None` and setters
    /// do nothing.
    #[must_use]
    pub fn detached() -> Self {
        Self { storage: None }
    }

    /// The backing storage, shared with other session state.
    #[must_use]
    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref()
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.read(TOKEN_KEY)
    }

    pub fn set_token(&self, token: Option<&str>) {
        self.write(TOKEN_KEY, token);
    }

    #[must_use]
    pub fn signing_secret(&self) -> Option<String> {
        self.read(SIGNING_SECRET_KEY)
    }

    pub fn set_signing_secret(&self, secret: Option<&str>) {
        self.write(SIGNING_SECRET_KEY, secret);
    }

    /// Removes both the token and the signing secret.
    pub fn clear(&self) {
        self.set_token(None);
        self.set_signing_secret(None);
    }

    #[must_use]
    pub fn credential(&self) -> Credential {
        Credential {
            token: self.token(),
            signing_secret: self.signing_secret(),
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        self.storage
            .as_ref()
            .and_then(|storage| storage.get(key))
            .filter(|value| !value.is_empty())
    }

    fn write(&self, key: &str, value: Option<&str>) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };

        match value {
            Some(value) if !value.is_empty() => storage.set(key, value),
            _ => storage.remove(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn setters_write_through() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let store = CredentialStore::new(Some(Arc::clone(&storage)));

        store.set_token(Some("T1"));
        store.set_signing_secret(Some("S1"));
        assert_eq!(storage.get(TOKEN_KEY).as_deref(), Some("T1"));
        assert_eq!(store.signing_secret().as_deref(), Some("S1"));

        store.set_token(None);
        assert_eq!(storage.get(TOKEN_KEY), None);
        assert_eq!(store.token(), None);
    }

    #[test]
    fn empty_values_remove_the_key() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let store = CredentialStore::new(Some(Arc::clone(&storage)));

        store.set_token(Some("T1"));
        store.set_token(Some(""));
        assert_eq!(storage.get(TOKEN_KEY), None);
    }

    #[test]
    fn detached_store_is_inert() {
        let store = CredentialStore::detached();
        store.set_token(Some("T1"));
        store.set_signing_secret(Some("S1"));
        assert_eq!(store.credential(), Credential::default());
    }

    #[test]
    fn credentials_are_redacted() {
        let store = CredentialStore::new(Some(Arc::new(MemoryStorage::new())));
        store.set_token(Some("super-secret-token"));
        let debug = format!("{:?}", store.credential());
        assert!(!debug.contains("super-secret-token"));
    }
}
