//! Short-lived in-memory caches.
//!
//! [`TtlCache`] is a bounded map whose entries expire after a fixed TTL. It
//! backs the document [`ReadCache`] and the usage-total cache. Entries use
//! the tokio clock so expiry follows a paused test clock.
//!
//! The lock is a `std::sync::Mutex` and is never held across an `.await`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tenantry_core::models::document::Document;
use tenantry_core::models::tenant::TenantId;
use tokio::time::Instant;
use tracing::debug;

struct CacheEntry<V> {
    value: V,
    inserted: Instant,
}

/// Hit/miss counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`; zero before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct TtlInner<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Bounded TTL map. Cloning shares the same entries.
pub struct TtlCache<K, V> {
    inner: Arc<TtlInner<K, V>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(TtlInner {
                ttl,
                capacity: capacity.max(1),
                entries: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        // A panic while holding the lock leaves the map consistent enough to
        // keep serving; entries are plain values.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        let fresh = match entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.inner.ttl => Some(entry.value.clone()),
            _ => None,
        };
        if fresh.is_none() {
            entries.remove(key);
        }
        drop(entries);

        let counter = if fresh.is_some() {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        fresh
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.lock();
        if entries.len() >= self.inner.capacity && !entries.contains_key(&key) {
            self.evict(&mut entries);
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Apply `f` to a live entry in place. Returns `false` if there was none.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.inserted.elapsed() < self.inner.ttl => {
                f(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &K) {
        self.lock().remove(key);
    }

    /// Drop every entry whose key matches.
    pub fn remove_where(&self, mut matches: impl FnMut(&K) -> bool) {
        self.lock().retain(|key, _| !matches(key));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Make room for one entry: expired entries first, then the oldest.
    fn evict(&self, entries: &mut HashMap<K, CacheEntry<V>>) {
        let ttl = self.inner.ttl;
        entries.retain(|_, entry| entry.inserted.elapsed() < ttl);
        if entries.len() < self.inner.capacity {
            return;
        }
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            entries.remove(&key);
        }
    }
}

/// Read-through cache of documents keyed by `(tenant, id)`.
///
/// Only documents that passed the ownership check for that tenant are ever
/// inserted, so a hit never leaks another tenant's data.
///
/// Every invalidation bumps an epoch. A reader takes the epoch before it
/// loads and caches the result only if no invalidation happened meanwhile,
/// so a load that raced a write cannot park the old copy in the cache.
#[derive(Clone)]
pub struct ReadCache {
    entries: TtlCache<(TenantId, String), Document>,
    epoch: Arc<Mutex<u64>>,
}

impl ReadCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: TtlCache::new(ttl, capacity),
            epoch: Arc::new(Mutex::new(0)),
        }
    }

    fn lock_epoch(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take before loading a document that may be cached.
    pub fn epoch(&self) -> u64 {
        *self.lock_epoch()
    }

    pub fn get(&self, tenant_id: &TenantId, id: &str) -> Option<Document> {
        self.entries.get(&(tenant_id.clone(), id.to_string()))
    }

    /// Cache `doc` unless something was invalidated since `epoch`.
    /// Returns whether the document was cached.
    pub fn put_if_current(&self, doc: Document, epoch: u64) -> bool {
        let current = self.lock_epoch();
        if *current != epoch {
            debug!(document_id = %doc.id, "Read cache skipped a load that raced a write");
            return false;
        }
        self.entries
            .insert((doc.tenant_id.clone(), doc.id.clone()), doc);
        true
    }

    pub fn invalidate(&self, tenant_id: &TenantId, id: &str) {
        debug!(tenant_id = %tenant_id, document_id = id, "Read cache invalidated");
        let mut epoch = self.lock_epoch();
        *epoch += 1;
        self.entries.remove(&(tenant_id.clone(), id.to_string()));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.stats()
    }
}
