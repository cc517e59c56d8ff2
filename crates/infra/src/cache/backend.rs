use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::CacheError;

/// Hash-per-key storage the cache store writes through.
///
/// No expiry: entries live until deleted or overwritten field by field.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Upsert one field of the hash at `key`.
    async fn hash_set(&self, key: &str, field: &str, value: String) -> Result<(), CacheError>;

    /// Upsert several fields at once. Other fields of the hash are untouched.
    async fn hash_set_many(&self, key: &str, entries: Vec<(String, String)>) -> Result<(), CacheError> {
        for (field, value) in entries {
            self.hash_set(key, &field, value).await?;
        }
        Ok(())
    }

    /// Every field of the hash at `key` (empty when absent).
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Process-local backend for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hashes.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> CacheError {
        CacheError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn hash_set(&self, key: &str, field: &str, value: String) -> Result<(), CacheError> {
        let mut hashes = self.hashes.write().map_err(|_| Self::poisoned())?;
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_set_many(&self, key: &str, entries: Vec<(String, String)>) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut hashes = self.hashes.write().map_err(|_| Self::poisoned())?;
        hashes.entry(key.to_string()).or_default().extend(entries);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let hashes = self.hashes.read().map_err(|_| Self::poisoned())?;
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.hashes.write().map_err(|_| Self::poisoned())?.remove(key);
        Ok(())
    }
}
