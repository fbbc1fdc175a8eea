//! Live-swappable values, used for the manager's default bucket config.
//!
//! Default backend is `ArcSwap` for lock-free reads on the lazy-creation path;
//! feature `adaptive-rwlock` switches to a `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared value with cheap snapshots and whole-value replacement.
///
/// Clones observe the same value. Swapping the value never affects buckets
/// that were already created with an earlier snapshot.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(value)) }
        }
    }

    /// Snapshot the current value.
    #[cfg(not(feature = "adaptive-rwlock"))]
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Snapshot the current value.
    #[cfg(feature = "adaptive-rwlock")]
    pub fn get(&self) -> Arc<T>
    where
        T: Clone,
    {
        Arc::new(self.inner.read().expect("dynamic config poisoned").clone())
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().expect("dynamic config poisoned") = value;
        }
    }
}
