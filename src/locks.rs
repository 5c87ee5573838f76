//! Per-key reader/writer locks with upgrade detection
//!
//! Requests for the same cache key take a read lock while they consult the
//! cache. A request that must fetch from the origin upgrades to the write
//! lock; of a group of requests upgrading concurrently, only the first is
//! told it won. The others learn that someone else just refreshed the key
//! and can rerun against the cache.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Result of trading a read lock for the write lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The lock was not held for reading, nothing changed
    NotUpgraded,
    /// Write lock acquired, and this caller is the first of its upgrade group
    UpgradedFirst,
    /// Write lock acquired after another upgrader of the same group
    UpgradedNotFirst,
}

struct LockEntry {
    lock: Arc<RwLock<()>>,
    /// Upgraders that have not yet released their write lock
    upgraders: AtomicUsize,
    /// Outstanding handles for this key
    holders: AtomicUsize,
}

type Registry = Arc<Mutex<HashMap<String, Arc<LockEntry>>>>;

/// Registry of per-key locks; entries vanish once nobody holds them
#[derive(Clone, Default)]
pub struct NamedLocker {
    registry: Registry,
}

enum Guard {
    None,
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// A held lock on one key
pub struct NamedLock {
    key: String,
    entry: Arc<LockEntry>,
    registry: Registry,
    guard: Guard,
}

impl NamedLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<LockEntry> {
        let mut registry = self.registry.lock();
        let entry = registry
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(LockEntry {
                    lock: Arc::new(RwLock::new(())),
                    upgraders: AtomicUsize::new(0),
                    holders: AtomicUsize::new(0),
                })
            })
            .clone();
        entry.holders.fetch_add(1, Ordering::SeqCst);
        entry
    }

    /// Acquire a read lock on `key`
    pub async fn read(&self, key: &str) -> NamedLock {
        let entry = self.entry(key);
        let mut handle = NamedLock {
            key: key.to_string(),
            entry: entry.clone(),
            registry: self.registry.clone(),
            guard: Guard::None,
        };
        handle.guard = Guard::Read(entry.lock.clone().read_owned().await);
        handle
    }

    /// Number of keys with live lock entries
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }
}

impl NamedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_write(&self) -> bool {
        matches!(self.guard, Guard::Write(_))
    }

    pub fn is_read(&self) -> bool {
        matches!(self.guard, Guard::Read(_))
    }

    /// Trade the read lock for the write lock
    pub async fn upgrade(&mut self) -> UpgradeOutcome {
        if !self.is_read() {
            return UpgradeOutcome::NotUpgraded;
        }
        let ticket = self.entry.upgraders.fetch_add(1, Ordering::SeqCst);
        self.guard = Guard::None;
        self.guard = Guard::Write(self.entry.lock.clone().write_owned().await);
        if ticket == 0 {
            UpgradeOutcome::UpgradedFirst
        } else {
            UpgradeOutcome::UpgradedNotFirst
        }
    }

    /// Release the write lock and wait for a read lock on the same key
    pub async fn downgrade_to_read(&mut self) {
        self.release_guard();
        self.guard = Guard::Read(self.entry.lock.clone().read_owned().await);
    }

    fn release_guard(&mut self) {
        if let Guard::Write(_) = std::mem::replace(&mut self.guard, Guard::None) {
            self.entry.upgraders.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Release whatever is held; the handle stays valid for `downgrade_to_read`
    pub fn release(&mut self) {
        self.release_guard();
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        self.release_guard();
        let mut registry = self.registry.lock();
        if self.entry.holders.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(current) = registry.get(&self.key) {
                if Arc::ptr_eq(current, &self.entry) {
                    registry.remove(&self.key);
                }
            }
        }
    }
}
