//! Key → bucket routing table.
//!
//! The directory is the only state shared across keys. `register_if_absent` is a
//! single critical section, so concurrent first access to a new key yields
//! exactly one registered bucket.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::bucket::{BucketHandle, BucketId};
use tracing::{debug, warn};

/// Outcome of [`Directory::register_if_absent`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// The handle is now the key's entry.
    Registered,
    /// Another live bucket already owns the key; use its handle instead.
    AlreadyPresent(BucketHandle),
}

impl Registration {
    pub fn is_registered(&self) -> bool {
        matches!(self, Registration::Registered)
    }
}

/// Trait for bucket directories (injectable into the manager).
pub trait Directory: Send + Sync + std::fmt::Debug {
    /// Handle for `key`, if a live bucket is registered.
    fn lookup(&self, key: &str) -> Option<BucketHandle>;
    /// Atomically insert `handle` unless a live bucket already owns `key`.
    ///
    /// An entry whose bucket has already closed its mailbox is replaced.
    fn register_if_absent(&self, key: &str, handle: BucketHandle) -> Registration;
    /// Remove the entry for `key`. Removing an absent key is a no-op.
    fn remove(&self, key: &str);
    /// Remove the entry for `key` only if it belongs to bucket `id`.
    ///
    /// Returns `true` if an entry was removed. A retiring bucket uses this so it
    /// can never evict the bucket that replaced it.
    fn remove_instance(&self, key: &str, id: BucketId) -> bool;
    /// Registered keys, sorted.
    fn keys(&self) -> Vec<String>;
    /// Number of registered keys.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory implementation backed by an RwLock.
#[derive(Default, Clone, Debug)]
pub struct InMemoryDirectory {
    inner: Arc<RwLock<HashMap<String, BucketHandle>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Default directory used when none is injected.
pub type DefaultDirectory = InMemoryDirectory;

impl Directory for InMemoryDirectory {
    fn lookup(&self, key: &str) -> Option<BucketHandle> {
        let guard = self.inner.read().expect("bucket directory poisoned");
        guard.get(key).filter(|h| h.is_alive()).cloned()
    }

    fn register_if_absent(&self, key: &str, handle: BucketHandle) -> Registration {
        let mut map = self.inner.write().expect("bucket directory poisoned");
        if let Some(existing) = map.get(key) {
            if existing.is_alive() {
                debug!(target: "quotabox::directory", key = %key, winner = %existing.id(), "registration lost to live bucket");
                return Registration::AlreadyPresent(existing.clone());
            }
            warn!(target: "quotabox::directory", key = %key, stale = %existing.id(), "replacing entry of closed bucket");
        }
        map.insert(key.to_string(), handle);
        Registration::Registered
    }

    fn remove(&self, key: &str) {
        let mut map = self.inner.write().expect("bucket directory poisoned");
        map.remove(key);
    }

    fn remove_instance(&self, key: &str, id: BucketId) -> bool {
        let mut map = self.inner.write().expect("bucket directory poisoned");
        match map.get(key) {
            Some(existing) if existing.id() == id => {
                map.remove(key);
                true
            }
            _ => false,
        }
    }

    fn keys(&self) -> Vec<String> {
        let map = self.inner.read().expect("bucket directory poisoned");
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn len(&self) -> usize {
        self.inner.read().expect("bucket directory poisoned").len()
    }
}
