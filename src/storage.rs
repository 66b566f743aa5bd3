//! Durable key-value storage for credentials and session state.
//!
//! Storage is synchronous and infallible at the call site: a backend that
//! fails to persist logs a warning and carries on, so that a broken disk
//! never takes the API client down with it.
//!
//! # Backends
//!
//! * [`MemoryStorage`] - process-local map, lost on exit
//! * [`FileStorage`] - JSON object on disk, written through on every change

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::error::Result;

/// Key holding the bearer token.
pub const TOKEN_KEY: &str = "joyful.token";

/// Key holding the request signing secret.
pub const SIGNING_SECRET_KEY: &str = "joyful.sign";

/// Key holding the reason of the last forced logout.
pub const LOGOUT_REASON_KEY: &str = "joyful.logout_reason";

/// Key holding the per-installation device identifier.
pub const DEVICE_ID_KEY: &str = "JOYFUL_DEVICE_ID";

/// A synchronous string key-value store.
pub trait Storage: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str);

    /// Removes `key` if present.
    fn remove(&self, key: &str);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Storage holds plain strings, so a panic elsewhere cannot leave it
    // half-updated.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        lock(&self.entries).insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        lock(&self.entries).remove(key);
    }
}

/// Storage persisted as a JSON object in a single file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Largest state file that will be loaded.
    ///
    /// The file only ever holds a handful of short strings.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Opens the storage file at `path`, starting empty when it does not
    /// exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * the file exists but cannot be read
    /// * the file is larger than expected
    /// * the file is not a JSON object of strings
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = match fs::metadata(&path) {
            Ok(attributes) => {
                // Prevent out-of-memory condition: state file should be small.
                if attributes.len() > Self::MAX_FILE_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} is too large", path.display()),
                    )
                    .into());
                }

                let contents = fs::read_to_string(&path)?;
                if contents.trim().is_empty() {
                    BTreeMap::new()
                } else {
                    serde_json::from_str(&contents)?
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("opened storage {} with {} keys", path.display(), entries.len());

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) {
        let result = serde_json::to_string_pretty(entries)
            .map_err(io::Error::from)
            .and_then(|contents| fs::write(&self.path, contents));

        if let Err(e) = result {
            warn!("failed to persist {}: {e}", self.path.display());
        }
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_owned(), value.to_owned());
        self.persist(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.persist(&entries);
        }
    }
}
