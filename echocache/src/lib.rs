//! # Content cache
//!
//! A bounded cache of values keyed by path, with an optional time-to-live.
//! Used by the storage facade to keep recently read or written object
//! content in memory. Storage and eviction are handled by [`moka`]; this
//! crate adds fills which lose to concurrent writes.

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use moka::sync::Cache;
use parking_lot::Mutex;

/// Fills in progress. A write or invalidation of the key removes the
/// ticket, so the stale fill is dropped when it completes.
#[derive(Debug)]
struct Pending<K> {
    tickets: Mutex<HashMap<K, u64>>,
    clock: AtomicU64,
}

impl<K> Pending<K>
where
    K: Eq + Hash,
{
    fn issue(&self, key: K) -> u64 {
        let ticket = self.clock.fetch_add(1, Ordering::Relaxed);
        self.tickets.lock().insert(key, ticket);
        ticket
    }

    fn cancel<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.tickets.lock().remove(key);
    }

    /// Whether `ticket` is still the current fill for `key`, retiring it.
    fn redeem(&self, key: &K, ticket: u64) -> bool {
        let mut tickets = self.tickets.lock();
        if tickets.get(key) == Some(&ticket) {
            tickets.remove(key);
            true
        } else {
            false
        }
    }
}

/// A cache which holds at most `capacity` values.
///
/// Cloning the cache produces another handle to the same entries.
pub struct ContentCache<K, V> {
    entries: Option<Cache<K, V>>,
    pending: Arc<Pending<K>>,
    capacity: usize,
    expiration: Option<Duration>,
}

impl<K, V> Clone for ContentCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            pending: Arc::clone(&self.pending),
            capacity: self.capacity,
            expiration: self.expiration,
        }
    }
}

impl<K, V> fmt::Debug for ContentCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCache")
            .field("capacity", &self.capacity)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

impl<K, V> ContentCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` entries, each of which
    /// expires `expiration` after it was stored.
    ///
    /// A capacity of zero disables caching.
    #[must_use]
    pub fn new(capacity: usize, expiration: Option<Duration>) -> Self {
        let entries = (capacity > 0).then(|| {
            let builder = Cache::builder().max_capacity(capacity as u64);
            match expiration {
                Some(lifetime) => builder.time_to_live(lifetime).build(),
                None => builder.build(),
            }
        });

        Self {
            entries,
            pending: Arc::new(Pending {
                tickets: Mutex::new(HashMap::new()),
                clock: AtomicU64::new(0),
            }),
            capacity,
            expiration,
        }
    }

    /// The maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| {
            entries.run_pending_tasks();
            entries.entry_count() as usize
        })
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live entry.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.as_ref()?.get(key)
    }

    /// Store a value, replacing any previous entry and cancelling any fill
    /// of the same key which is still in progress.
    pub fn set(&self, key: K, value: V) {
        self.pending.cancel(&key);
        if let Some(entries) = &self.entries {
            entries.insert(key, value);
        }
    }

    /// Drop the entry for a key, cancelling any fill still in progress.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.pending.cancel(key);
        if let Some(entries) = &self.entries {
            entries.invalidate(key);
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.pending.tickets.lock().clear();
        if let Some(entries) = &self.entries {
            entries.invalidate_all();
        }
    }

    /// Return the cached value for `key`, or run `fill` and cache its
    /// successful result.
    ///
    /// Errors are returned to the caller and never cached. If the key is
    /// written or invalidated while `fill` runs, the filled value is returned
    /// but not stored.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, fill: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let Some(entries) = &self.entries else {
            return fill().await;
        };

        if let Some(value) = entries.get(&key) {
            tracing::trace!("Cache hit");
            return Ok(value);
        }

        let ticket = self.pending.issue(key.clone());
        tracing::trace!("Cache miss");
        let result = fill().await;

        if self.pending.redeem(&key, ticket) {
            if let Ok(value) = &result {
                entries.insert(key, value.clone());
            }
        } else {
            tracing::trace!("Entry changed during fill, not caching");
        }

        result
    }
}
