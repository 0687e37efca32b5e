//! LRU memory cache
//!
//! One mutex guards the recency list, the key index and the running totals.
//! Operations hold it only while relinking; evicted values are handed to
//! the release policy after the lock is dropped.
//!
//! Limits are enforced three ways:
//! - Count: `set` evicts the tail inside the same critical section
//! - Cost: `set` schedules a trim on the cache's trim queue
//! - All three (cost, count, age): a periodic auto-trim

use crate::lru::{Drained, LinkedMap};
use crate::release::Releaser;
use parking_lot::{Mutex, RwLock};
use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use stowage_common::{
    MemoryCacheConfig, Periodic, ReleasePolicy, Result, SerialQueue, SpinBackoff, TrimPlan,
};
use tracing::debug;

/// Host-level events the cache reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSignal {
    /// The process is low on memory
    MemoryWarning,
    /// The host application moved to the background
    EnteredBackground,
}

type PressureHandler = Arc<dyn Fn(PressureSignal) + Send + Sync>;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of lookups that found a value
    pub hits: AtomicU64,
    /// Number of lookups that found nothing
    pub misses: AtomicU64,
    /// Number of entries removed by limits and trims
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    cost: u64,
    count: u64,
    age: Duration,
}

struct Shared<K, V> {
    map: Mutex<LinkedMap<K, V>>,
    limits: RwLock<Limits>,
    name: RwLock<Option<String>>,
    releaser: Releaser,
    backoff: SpinBackoff,
    stats: CacheStats,
    remove_all_on_memory_warning: AtomicBool,
    remove_all_on_background: AtomicBool,
    pressure_handler: RwLock<Option<PressureHandler>>,
}

impl<K, V> Shared<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
{
    fn label(&self) -> String {
        self.name.read().clone().unwrap_or_else(|| "memory".to_string())
    }

    fn trim_to_cost(&self, limit: u64) {
        self.trim_by(limit, LinkedMap::total_cost);
    }

    fn trim_to_count(&self, limit: u64) {
        self.trim_by(limit, LinkedMap::total_count);
    }

    /// Evict from the tail while `aggregate` exceeds `limit`
    fn trim_by(&self, limit: u64, aggregate: fn(&LinkedMap<K, V>) -> u64) {
        {
            let mut map = self.map.lock();
            let plan = TrimPlan::for_limit(aggregate(&*map), limit);
            match plan {
                TrimPlan::ClearAll => {
                    let drained = map.take_all();
                    drop(map);
                    self.release_drained(drained, true);
                    return;
                }
                TrimPlan::WithinLimit => return,
                TrimPlan::Evict => {}
            }
        }

        let mut evicted = Vec::new();
        loop {
            let mut map = self.backoff.acquire(|| self.map.try_lock());
            if aggregate(&*map) <= limit {
                break;
            }
            match map.remove_tail() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        self.release_evicted(evicted);
    }

    fn trim_to_age(&self, limit: Duration) {
        let now = Instant::now();
        let expired = |map: &LinkedMap<K, V>| {
            map.tail_time()
                .map(|time| now.saturating_duration_since(time))
        };

        {
            let mut map = self.map.lock();
            let plan = TrimPlan::for_age(expired(&*map), limit);
            match plan {
                TrimPlan::ClearAll => {
                    let drained = map.take_all();
                    drop(map);
                    self.release_drained(drained, true);
                    return;
                }
                TrimPlan::WithinLimit => return,
                TrimPlan::Evict => {}
            }
        }

        let mut evicted = Vec::new();
        loop {
            let mut map = self.backoff.acquire(|| self.map.try_lock());
            if !expired(&*map).is_some_and(|age| age > limit) {
                break;
            }
            match map.remove_tail() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        self.release_evicted(evicted);
    }

    fn auto_trim(&self) {
        let limits = *self.limits.read();
        self.trim_to_cost(limits.cost);
        self.trim_to_count(limits.count);
        self.trim_to_age(limits.age);
    }

    fn release_evicted(&self, evicted: Vec<(K, V)>) {
        if evicted.is_empty() {
            return;
        }
        debug!("Memory cache {} evicted {} entries", self.label(), evicted.len());
        self.stats
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        self.releaser.release(evicted);
    }

    fn release_drained(&self, drained: Drained<K, V>, evicted: bool) {
        if drained.is_empty() {
            return;
        }
        if evicted {
            debug!("Memory cache {} evicted all {} entries", self.label(), drained.len());
            self.stats
                .evictions
                .fetch_add(drained.len() as u64, Ordering::Relaxed);
        }
        self.releaser.release(drained);
    }
}

/// Thread-safe LRU cache bounded by cost, count and age
pub struct MemoryCache<K, V> {
    auto_trim: Periodic,
    trim_queue: SerialQueue,
    shared: Arc<Shared<K, V>>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
{
    /// Create a cache with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(&MemoryCacheConfig::default())
    }

    pub fn with_config(config: &MemoryCacheConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            map: Mutex::new(LinkedMap::new()),
            limits: RwLock::new(Limits {
                cost: config.cost_limit(),
                count: config.count_limit(),
                age: config.age_limit(),
            }),
            name: RwLock::new(config.name.clone()),
            releaser: Releaser::new(config.release_policy),
            backoff: SpinBackoff::default(),
            stats: CacheStats::default(),
            remove_all_on_memory_warning: AtomicBool::new(config.remove_all_on_memory_warning),
            remove_all_on_background: AtomicBool::new(config.remove_all_on_background),
            pressure_handler: RwLock::new(None),
        });

        let label = shared.label();
        let trim_queue = SerialQueue::new(format!("{label}-trim"))?;
        let weak: Weak<Shared<K, V>> = Arc::downgrade(&shared);
        let auto_trim = Periodic::start(
            format!("{label}-auto-trim"),
            config.auto_trim_interval(),
            move || {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                shared.auto_trim();
                true
            },
        )?;
        debug!("Created memory cache {}", label);

        Ok(Self {
            auto_trim,
            trim_queue,
            shared,
        })
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.map.lock().find(key).is_some()
    }

    /// Insert or replace a value with zero cost
    pub fn set(&self, key: K, value: V) {
        self.set_with_cost(key, value, 0);
    }

    /// Insert or replace a value and make it most recent
    ///
    /// Going over the count limit evicts the tail immediately; going over
    /// the cost limit schedules a background trim.
    pub fn set_with_cost(&self, key: K, value: V, cost: u64) {
        let now = Instant::now();
        let limits = *self.shared.limits.read();

        let (replaced, evicted, over_cost) = {
            let mut map = self.shared.map.lock();
            let replaced = match map.find(&key) {
                Some(handle) => map.update(handle, value, cost, now),
                None => {
                    map.insert_head(key, value, cost, now);
                    None
                }
            };
            let over_cost = map.total_cost() > limits.cost;
            let evicted = if map.total_count() > limits.count {
                map.remove_tail()
            } else {
                None
            };
            (replaced, evicted, over_cost)
        };

        if over_cost {
            self.schedule(|shared| {
                let limit = shared.limits.read().cost;
                shared.trim_to_cost(limit);
            });
        }
        if let Some(entry) = evicted {
            self.shared.release_evicted(vec![entry]);
        }
        if let Some(value) = replaced {
            self.shared.releaser.release(value);
        }
    }

    /// Remove a key; returns whether it was present
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = {
            let mut map = self.shared.map.lock();
            map.find(key).and_then(|handle| map.remove(handle))
        };
        match removed {
            Some(entry) => {
                self.shared.releaser.release(entry);
                true
            }
            None => false,
        }
    }

    /// Remove everything
    pub fn clear(&self) {
        let drained = self.shared.map.lock().take_all();
        self.shared.release_drained(drained, false);
    }

    /// Evict least-recently-used entries until total cost fits `limit`
    pub fn trim_to_cost(&self, limit: u64) {
        self.shared.trim_to_cost(limit);
    }

    /// Evict least-recently-used entries until the count fits `limit`
    pub fn trim_to_count(&self, limit: u64) {
        self.shared.trim_to_count(limit);
    }

    /// Evict entries not accessed within `limit`
    pub fn trim_to_age(&self, limit: Duration) {
        self.shared.trim_to_age(limit);
    }

    /// Run `trim_to_cost` on the trim queue
    pub fn schedule_trim_to_cost(&self, limit: u64) -> bool {
        self.schedule(move |shared| shared.trim_to_cost(limit))
    }

    /// Run `trim_to_count` on the trim queue
    pub fn schedule_trim_to_count(&self, limit: u64) -> bool {
        self.schedule(move |shared| shared.trim_to_count(limit))
    }

    /// Run `trim_to_age` on the trim queue
    pub fn schedule_trim_to_age(&self, limit: Duration) -> bool {
        self.schedule(move |shared| shared.trim_to_age(limit))
    }

    fn schedule(&self, job: impl FnOnce(&Shared<K, V>) + Send + 'static) -> bool {
        let weak = Arc::downgrade(&self.shared);
        self.trim_queue.dispatch(move || {
            if let Some(shared) = weak.upgrade() {
                job(&*shared);
            }
        })
    }

    /// React to a host pressure signal
    ///
    /// The handler (if any) runs first; the cache is then cleared when the
    /// matching `remove_all_on_*` flag is set.
    pub fn on_pressure_signal(&self, signal: PressureSignal) {
        let handler = self.shared.pressure_handler.read().clone();
        if let Some(handler) = handler {
            handler(signal);
        }

        let flag = match signal {
            PressureSignal::MemoryWarning => &self.shared.remove_all_on_memory_warning,
            PressureSignal::EnteredBackground => &self.shared.remove_all_on_background,
        };
        if flag.load(Ordering::Relaxed) {
            debug!("Memory cache {} cleared on {:?}", self.shared.label(), signal);
            self.clear();
        }
    }

    pub fn set_pressure_handler(&self, handler: impl Fn(PressureSignal) + Send + Sync + 'static) {
        *self.shared.pressure_handler.write() = Some(Arc::new(handler));
    }

    pub fn set_remove_all_on_memory_warning(&self, enabled: bool) {
        self.shared
            .remove_all_on_memory_warning
            .store(enabled, Ordering::Relaxed);
    }

    pub fn remove_all_on_memory_warning(&self) -> bool {
        self.shared.remove_all_on_memory_warning.load(Ordering::Relaxed)
    }

    pub fn set_remove_all_on_background(&self, enabled: bool) {
        self.shared
            .remove_all_on_background
            .store(enabled, Ordering::Relaxed);
    }

    pub fn remove_all_on_background(&self) -> bool {
        self.shared.remove_all_on_background.load(Ordering::Relaxed)
    }

    /// Drop values parked by `ReleasePolicy::Deferred`; returns the batch count
    pub fn drain_deferred(&self) -> usize {
        self.shared.releaser.drain_deferred()
    }

    /// Stop the periodic auto-trim
    pub fn stop_auto_trim(&mut self) {
        self.auto_trim.stop();
    }

    pub fn total_cost(&self) -> u64 {
        self.shared.map.lock().total_cost()
    }

    pub fn total_count(&self) -> u64 {
        self.shared.map.lock().total_count()
    }

    pub fn cost_limit(&self) -> u64 {
        self.shared.limits.read().cost
    }

    pub fn set_cost_limit(&self, limit: u64) {
        self.shared.limits.write().cost = limit;
    }

    pub fn count_limit(&self) -> u64 {
        self.shared.limits.read().count
    }

    pub fn set_count_limit(&self, limit: u64) {
        self.shared.limits.write().count = limit;
    }

    pub fn age_limit(&self) -> Duration {
        self.shared.limits.read().age
    }

    pub fn set_age_limit(&self, limit: Duration) {
        self.shared.limits.write().age = limit;
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.shared.releaser.policy()
    }

    pub fn set_release_policy(&self, policy: ReleasePolicy) {
        self.shared.releaser.set_policy(policy);
    }

    pub fn name(&self) -> Option<String> {
        self.shared.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.shared.name.write() = Some(name.into());
    }

    pub fn stats(&self) -> &CacheStats {
        &self.shared.stats
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        self.shared.map.lock().keys().cloned().collect()
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Look up a value and make it most recent
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let value = {
            let mut map = self.shared.map.lock();
            map.find(key)
                .and_then(|handle| map.touch(handle, now).cloned())
        };
        let counter = if value.is_some() {
            &self.shared.stats.hits
        } else {
            &self.shared.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }
}

impl<K, V> Drop for MemoryCache<K, V> {
    fn drop(&mut self) {
        // Stop the timer before the trim queue drains and the store goes away
        self.auto_trim.stop();
    }
}
