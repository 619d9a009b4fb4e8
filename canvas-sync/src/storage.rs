//! Key-value durable storage for queue and connection snapshots.
//!
//! Two backends are provided: [`MemoryStorage`] (optionally bounded by a byte
//! quota) and [`FileStorage`] (one JSON file per key in a data directory).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Storage key for the persisted operation queue.
pub const QUEUE_STORAGE_KEY: &str = "canvas-sync.operation-queue";

/// Storage key for the persisted connection state.
pub const CONNECTION_STORAGE_KEY: &str = "canvas-sync.connection-state";

/// Schema version written into every persisted blob.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Writing would exceed the backend's quota.
    #[error("Storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded {
        /// Bytes the write required.
        needed: usize,
        /// Bytes still free.
        available: usize,
    },
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A blob could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Synchronous string key-value storage.
pub trait KeyValueStorage: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or exceeds the quota.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a value. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be modified.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Versioned envelope around every persisted blob.
#[derive(Debug, Serialize, Deserialize)]
struct Versioned<T> {
    version: u32,
    #[serde(flatten)]
    data: T,
}

/// Serialize `value` with the current schema version and store it.
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub fn save_versioned<T: Serialize>(
    storage: &dyn KeyValueStorage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let json = serde_json::to_string(&Versioned {
        version: SCHEMA_VERSION,
        data: value,
    })
    .map_err(|e| StorageError::Serialization(e.to_string()))?;
    storage.set(key, &json)
}

/// Load a versioned blob.
///
/// Missing keys, unreadable blobs and unknown schema versions all yield
/// `None`; the latter two are logged.
pub fn load_versioned<T: DeserializeOwned>(storage: &dyn KeyValueStorage, key: &str) -> Option<T> {
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(key, error = %e, "Failed to read persisted state");
            return None;
        }
    };
    match serde_json::from_str::<Versioned<T>>(&raw) {
        Ok(blob) if blob.version == SCHEMA_VERSION => Some(blob.data),
        Ok(blob) => {
            tracing::warn!(
                key,
                version = blob.version,
                expected = SCHEMA_VERSION,
                "Discarding persisted state with unknown schema version"
            );
            None
        }
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding unreadable persisted state");
            None
        }
    }
}

/// In-process storage with an optional byte quota.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    values: Arc<RwLock<HashMap<String, String>>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    /// Create unbounded storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage that rejects writes pushing the total size over `bytes`.
    #[must_use]
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            values: Arc::default(),
            quota: Some(bytes),
        }
    }

    /// Total bytes stored across keys and values.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        let values = self
            .values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        values.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self
            .values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self
            .values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(quota) = self.quota {
            let others: usize = values
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = key.len() + value.len();
            let available = quota.saturating_sub(others);
            if needed > available {
                return Err(StorageError::QuotaExceeded { needed, available });
            }
        }
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self
            .values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// Filesystem storage: each key is a JSON file in `data_dir`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    /// Create file storage rooted at `data_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.json", sanitize_filename(key)))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        // Write-then-rename so a crash never leaves a torn blob behind.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sanitize a storage key for use as a filename.
///
/// Replaces any character that is not alphanumeric, `-`, or `_` with `_`.
fn sanitize_filename(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        items: Vec<u32>,
    }

    #[test]
    fn test_memory_set_get_remove() {
        let storage = MemoryStorage::new();
        assert!(storage.get("k").expect("get").is_none());

        storage.set("k", "v").expect("set");
        assert_eq!(storage.get("k").expect("get").as_deref(), Some("v"));

        storage.remove("k").expect("remove");
        assert!(storage.get("k").expect("get").is_none());
    }

    #[test]
    fn test_memory_quota_rejects_oversized_write() {
        let storage = MemoryStorage::with_quota(10);
        storage.set("a", "12345").expect("fits");

        let result = storage.set("b", "123456789");
        assert!(matches!(result, Err(StorageError::QuotaExceeded { .. })));

        // Replacing an existing key only counts the new value.
        storage.set("a", "123456789").expect("replacement fits");
        assert_eq!(storage.used_bytes(), 10);
    }

    #[test]
    fn test_versioned_round_trip() {
        let storage = MemoryStorage::new();
        save_versioned(&storage, "blob", &Blob { items: vec![1, 2] }).expect("save");

        let raw = storage.get("blob").expect("get").expect("present");
        assert!(raw.contains("\"version\":1"));

        let loaded: Blob = load_versioned(&storage, "blob").expect("loads");
        assert_eq!(loaded.items, vec![1, 2]);
    }

    #[test]
    fn test_unknown_version_is_discarded() {
        let storage = MemoryStorage::new();
        storage
            .set("blob", r#"{"version":99,"items":[1]}"#)
            .expect("set");
        assert!(load_versioned::<Blob>(&storage, "blob").is_none());

        storage.set("blob", "not json").expect("set");
        assert!(load_versioned::<Blob>(&storage, "blob").is_none());
    }

    #[test]
    fn test_file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path()).expect("storage");
        storage.set(QUEUE_STORAGE_KEY, "{}").expect("set");

        let path = dir.path().join("canvas-sync_operation-queue.json");
        assert!(path.exists(), "key should map to a sanitized file name");

        let reopened = FileStorage::new(dir.path()).expect("storage");
        assert_eq!(
            reopened.get(QUEUE_STORAGE_KEY).expect("get").as_deref(),
            Some("{}")
        );

        reopened.remove(QUEUE_STORAGE_KEY).expect("remove");
        assert!(!path.exists());
        reopened.remove(QUEUE_STORAGE_KEY).expect("missing key is fine");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("simple"), "simple");
        assert_eq!(sanitize_filename("with-dash"), "with-dash");
        assert_eq!(sanitize_filename("has/slash"), "has_slash");
        assert_eq!(sanitize_filename("a.b.c"), "a_b_c");
    }
}
