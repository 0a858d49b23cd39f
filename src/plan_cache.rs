//! Per-session cache of compiled plans.
//!
//! Several interchangeable instances may be cached under one key; a caller
//! checks one out with [`PlanCache::get`] and owns it exclusively until it
//! hands it back with [`PlanCache::release`]. Eviction is least recently
//! released across the whole cache.

use crate::remote::Param;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    pub statement: String,
    pub library: String,
    /// Hash of the ambient parameter names and types, never their values.
    pub context_hash: u64,
    pub in_application_transaction: bool,
}

impl PlanCacheKey {
    pub fn new(
        statement: &str,
        library: &str,
        params: &[Param],
        in_application_transaction: bool,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        for param in params {
            param.name.hash(&mut hasher);
            param.value.type_name().hash(&mut hasher);
        }
        Self {
            statement: statement.to_string(),
            library: library.to_string(),
            context_hash: hasher.finish(),
            in_application_transaction,
        }
    }
}

pub trait CachedPlan {
    fn cache_key(&self) -> &PlanCacheKey;
    /// Invalidation generation observed when the plan was compiled.
    fn compile_generation(&self) -> u64;
    fn is_invalid(&self) -> bool;
    fn is_session_scoped(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub discards: u64,
    pub cached: usize,
}

struct Inner<P> {
    capacity: usize,
    next_id: u64,
    /// Entry id -> plan; the LRU order spans every key.
    entries: LruCache<u64, (PlanCacheKey, P)>,
    /// Ids per key, most recently released last.
    buckets: HashMap<PlanCacheKey, Vec<u64>>,
}

impl<P> Inner<P> {
    fn forget(&mut self, key: &PlanCacheKey, id: u64) {
        if let Some(ids) = self.buckets.get_mut(key) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.buckets.remove(key);
            }
        }
    }

    fn evict_to(&mut self, capacity: usize, evicted: &mut Vec<P>) {
        while self.entries.len() > capacity {
            let Some((id, (key, plan))) = self.entries.pop_lru() else {
                break;
            };
            self.forget(&key, id);
            evicted.push(plan);
        }
    }
}

pub struct PlanCache<P> {
    inner: Mutex<Inner<P>>,
    invalidation: Arc<AtomicU64>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    discards: AtomicU64,
}

impl<P: CachedPlan> PlanCache<P> {
    /// `invalidation` is the generation plans are compared against; a plan
    /// compiled under an older value is discarded instead of reused.
    pub fn new(capacity: usize, invalidation: Arc<AtomicU64>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity,
                next_id: 0,
                entries: LruCache::unbounded(),
                buckets: HashMap::new(),
            }),
            invalidation,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().capacity > 1
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks out the most recently released valid instance for `key`.
    pub fn get(&self, key: &PlanCacheKey) -> Option<P> {
        let current = self.invalidation.load(Ordering::SeqCst);
        let mut stale = Vec::new();
        let found = {
            let mut inner = self.inner.lock();
            let mut found = None;
            while let Some(id) = inner.buckets.get_mut(key).and_then(|ids| ids.pop()) {
                if inner.buckets.get(key).is_some_and(|ids| ids.is_empty()) {
                    inner.buckets.remove(key);
                }
                let Some((_, plan)) = inner.entries.pop(&id) else {
                    continue;
                };
                if plan.is_invalid() || plan.compile_generation() < current {
                    stale.push(plan);
                    continue;
                }
                found = Some(plan);
                break;
            }
            found
        };
        if !stale.is_empty() {
            self.discards
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            debug!(statement = %key.statement, discarded = stale.len(), "discarded stale plans");
        }
        drop(stale);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(statement = %key.statement, "plan cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(statement = %key.statement, "plan cache miss");
        }
        found
    }

    /// Caches `plan` under `key`. Returns false (dropping the plan) when the
    /// cache is disabled or the plan is no longer usable.
    pub fn add(&self, key: PlanCacheKey, plan: P) -> bool {
        if plan.is_invalid()
            || plan.is_session_scoped()
            || plan.compile_generation() < self.invalidation.load(Ordering::SeqCst)
        {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut evicted = Vec::new();
        let cached = {
            let mut inner = self.inner.lock();
            if inner.capacity <= 1 {
                evicted.push(plan);
                false
            } else {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.buckets.entry(key.clone()).or_default().push(id);
                inner.entries.put(id, (key, plan));
                let capacity = inner.capacity;
                inner.evict_to(capacity, &mut evicted);
                true
            }
        };
        if cached && !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }
        drop(evicted);
        cached
    }

    /// Hands a checked-out plan back. Returns whether it was kept.
    pub fn release(&self, plan: P) -> bool {
        let key = plan.cache_key().clone();
        self.add(key, plan)
    }

    pub fn clear(&self) {
        let drained: Vec<P> = {
            let mut inner = self.inner.lock();
            inner.buckets.clear();
            let mut drained = Vec::with_capacity(inner.entries.len());
            while let Some((_, (_, plan))) = inner.entries.pop_lru() {
                drained.push(plan);
            }
            drained
        };
        drop(drained);
    }

    /// Changes the capacity, evicting down to it. A capacity of one or less
    /// disables the cache and empties it.
    pub fn resize(&self, capacity: usize) {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.capacity = capacity;
            let keep = if capacity <= 1 { 0 } else { capacity };
            inner.evict_to(keep, &mut evicted);
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        drop(evicted);
    }

    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            cached: self.len(),
        }
    }
}
