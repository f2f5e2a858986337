//! Process-wide result cache backed by [`DashMap`].
//!
//! Entries are opaque JSON blobs keyed by cache key. There is no TTL:
//! invalidation is explicit, either everything at once ([`ResultCache::flush`])
//! or one key ([`ResultCache::flush_key`]). The cache is constructed once and
//! shared through an `Arc`; it is never a global.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

/// A cached value and when it was written.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Arc<Value>,
    pub inserted_at: Instant,
}

/// Concurrent key -> result map.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
}

impl ResultCache {
    /// Creates a new, empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the cached value for `key`, if any. Never performs I/O.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.entries.get(key).map(|e| Arc::clone(&e.value))
    }

    /// Returns the full entry for `key`, including its insertion time.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Stores `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: Arc<Value>) {
        let key = key.into();
        trace!(key = %key, "cache set");
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Removes every entry.
    pub fn flush(&self) {
        trace!(entries = self.entries.len(), "cache flush");
        self.entries.clear();
    }

    /// Removes one entry. Returns whether it existed.
    pub fn flush_key(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write-through lookup for plain data fetches.
    ///
    /// Returns the cached value if present; otherwise runs `fetch`, stores a
    /// successful result and returns it. Errors are returned uncached.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `fetch`.
    pub async fn get_or_try_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Arc<Value>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = Arc::new(fetch().await?);
        self.set(key, Arc::clone(&value));
        Ok(value)
    }
}
