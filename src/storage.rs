//! Storage backends for cached documents
//!
//! A [`CacheStore`] holds opaque bytes under string keys with a TTL. Stores
//! that live in the same process may also implement [`ReferenceStore`] and
//! hand out documents by reference, skipping serialization entirely.

use crate::document::HttpDocument;
use crate::error::{CacheError, Result};
use crate::status::LookupStatus;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Key/value storage with expiry
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    async fn store(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()>;

    /// Fetch the bytes stored under `key`
    ///
    /// A missing or expired key is `Err(CacheError::KeyNotFound)`.
    async fn retrieve(&self, key: &str) -> Result<(Bytes, LookupStatus)>;

    async fn remove(&self, key: &str) -> Result<()>;

    async fn set_ttl(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Reference-passing interface, when the store supports it
    fn reference(&self) -> Option<&dyn ReferenceStore> {
        None
    }
}

/// Storage of live documents without serialization
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn store_reference(&self, key: &str, doc: Arc<HttpDocument>, ttl: Duration) -> Result<()>;

    async fn retrieve_reference(&self, key: &str) -> Result<(Arc<HttpDocument>, LookupStatus)>;
}

#[derive(Clone)]
enum StoredValue {
    Bytes(Bytes),
    Document(Arc<HttpDocument>),
}

#[derive(Clone)]
struct MemoryEntry {
    value: StoredValue,
    size: usize,
    expires_at: Instant,
    last_accessed: Instant,
}

/// Memory store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// In-process store with TTL expiry and an optional LRU size bound
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    max_size_bytes: Option<usize>,
    reference_passing: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryStore {
    /// Create an unbounded store that passes documents by reference
    pub fn new() -> Self {
        Self::with_options(None, true)
    }

    /// Create a store
    ///
    /// # Arguments
    /// * `max_size_bytes` - Evict least recently used entries beyond this size
    /// * `reference_passing` - Expose [`ReferenceStore`]; when false every
    ///   document goes through the serialization path
    pub fn with_options(max_size_bytes: Option<usize>, reference_passing: bool) -> Self {
        MemoryStore {
            entries: RwLock::new(HashMap::new()),
            max_size_bytes,
            reference_passing,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> StoreStats {
        let entries = self.entries.read();
        StoreStats {
            total_entries: entries.len(),
            total_bytes: entries.values().map(|e| e.size).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Keys currently held, expired or not
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn insert(&self, key: &str, value: StoredValue, size: usize, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, e| e.expires_at > now);

        if let Some(max) = self.max_size_bytes {
            let current: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, e)| e.size)
                .sum();
            if current + size > max {
                let mut by_age: Vec<(String, Instant, usize)> = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, e)| (k.clone(), e.last_accessed, e.size))
                    .collect();
                by_age.sort_by_key(|(_, accessed, _)| *accessed);

                let needed = current + size - max;
                let mut freed = 0;
                for (k, _, sz) in by_age {
                    if freed >= needed {
                        break;
                    }
                    entries.remove(&k);
                    freed += sz;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                debug!("LRU eviction: freed {} bytes for key={}", freed, key);
            }
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                size,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
    }

    fn lookup(&self, key: &str) -> Result<StoredValue> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::KeyNotFound)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::KeyNotFound)
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        let size = data.len();
        self.insert(key, StoredValue::Bytes(data), size, ttl);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<(Bytes, LookupStatus)> {
        match self.lookup(key)? {
            StoredValue::Bytes(b) => Ok((b, LookupStatus::Hit)),
            StoredValue::Document(_) => Err(CacheError::StorageError(format!(
                "key {} holds a document reference, not bytes",
                key
            ))),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        match self.entries.write().get_mut(key) {
            Some(entry) => {
                entry.expires_at = Instant::now() + ttl;
                Ok(())
            }
            None => Err(CacheError::KeyNotFound),
        }
    }

    fn reference(&self) -> Option<&dyn ReferenceStore> {
        if self.reference_passing {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl ReferenceStore for MemoryStore {
    async fn store_reference(&self, key: &str, doc: Arc<HttpDocument>, ttl: Duration) -> Result<()> {
        let size = doc.size();
        self.insert(key, StoredValue::Document(doc), size, ttl);
        Ok(())
    }

    async fn retrieve_reference(&self, key: &str) -> Result<(Arc<HttpDocument>, LookupStatus)> {
        match self.lookup(key)? {
            StoredValue::Document(d) => Ok((d, LookupStatus::Hit)),
            StoredValue::Bytes(_) => Err(CacheError::StorageError(format!(
                "key {} holds bytes, not a document reference",
                key
            ))),
        }
    }
}
