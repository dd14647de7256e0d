//! Native memory cache manager
//!
//! Maps cache keys to [`Allocation`]s with weight and/or idle-expiry bounds.
//! Misses are loaded once per key even under concurrent callers. Every
//! removal closes the allocation on a dedicated [`SerialExecutor`] thread, and
//! a removal caused by size pressure raises the capacity flag and trips the
//! circuit breaker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::RwLock;
use serde::Serialize;

use crate::memory::allocation::{Allocation, AllocationKind};
use crate::memory::breaker::CircuitBreaker;
use crate::memory::context::EntryContext;
use crate::memory::executor::SerialExecutor;
use crate::{Error, Result};

/// Runtime cache bounds
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub weight_limited: bool,
    pub max_weight_kb: u64,
    /// Evict entries not accessed for this long
    pub expiry: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            weight_limited: true,
            max_weight_kb: 4 * 1024 * 1024,
            expiry: None,
        }
    }
}

/// Counters since the manager was created
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub load_success_count: u64,
    pub load_failure_count: u64,
    pub total_load_time: Duration,
    pub eviction_count: u64,
}

/// Per-index usage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexCacheStats {
    pub graph_count: usize,
    pub memory_kb: u64,
    pub memory_percentage: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    load_time_nanos: AtomicU64,
    evictions: AtomicU64,
}

/// State shared between the manager and its eviction listener
struct Shared {
    executor: SerialExecutor,
    shut_down: AtomicBool,
    capacity_reached: AtomicBool,
    breaker: Arc<CircuitBreaker>,
    counters: Counters,
}

struct CacheInstance {
    cache: Cache<String, Arc<Allocation>>,
    settings: CacheSettings,
}

impl CacheInstance {
    fn build(settings: CacheSettings, shared: &Arc<Shared>) -> Arc<Self> {
        let listener_state = shared.clone();
        let mut builder = Cache::builder()
            .eviction_policy(EvictionPolicy::lru())
            .weigher(|_key: &String, allocation: &Arc<Allocation>| -> u32 {
                u32::try_from(allocation.size_kb()).unwrap_or(u32::MAX)
            })
            .eviction_listener(
                move |key: Arc<String>, allocation: Arc<Allocation>, cause: RemovalCause| {
                    on_removal(&listener_state, &key, allocation, cause)
                },
            );

        if settings.weight_limited {
            builder = builder.max_capacity(settings.max_weight_kb);
        }
        if let Some(expiry) = settings.expiry {
            builder = builder.time_to_idle(expiry);
        }

        Arc::new(Self {
            cache: builder.build(),
            settings,
        })
    }

    fn allocations(&self) -> impl Iterator<Item = (Arc<String>, Arc<Allocation>)> + '_ {
        self.cache.iter()
    }

    fn size_kb_where(&self, filter: impl Fn(&Allocation) -> bool) -> u64 {
        self.allocations()
            .filter(|(_, a)| filter(a))
            .map(|(_, a)| a.size_kb())
            .sum()
    }

    /// Invalidate entry by entry so each removal notifies the listener now
    fn clear(&self) {
        let keys: Vec<Arc<String>> = self.allocations().map(|(k, _)| k).collect();
        for key in keys {
            self.cache.invalidate(key.as_str());
        }
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }
}

fn on_removal(shared: &Shared, key: &str, allocation: Arc<Allocation>, cause: RemovalCause) {
    tracing::debug!(%key, ?cause, size_kb = allocation.size_kb(), "Removing native memory entry");

    if cause.was_evicted() {
        shared.counters.evictions.fetch_add(1, Ordering::Relaxed);
    }
    if cause == RemovalCause::Size {
        shared.capacity_reached.store(true, Ordering::Release);
        shared.breaker.trigger();
    }

    shared.executor.execute(move || allocation.close());
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

/// Weight-bounded cache of native memory allocations
pub struct CacheManager {
    instance: RwLock<Arc<CacheInstance>>,
    shared: Arc<Shared>,
}

impl CacheManager {
    pub fn new(settings: CacheSettings, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let shared = Arc::new(Shared {
            executor: SerialExecutor::start("vecmem-eviction")?,
            shut_down: AtomicBool::new(false),
            capacity_reached: AtomicBool::new(false),
            breaker,
            counters: Counters::default(),
        });

        tracing::info!(
            weight_limited = settings.weight_limited,
            max_weight_kb = settings.max_weight_kb,
            expiry = ?settings.expiry,
            "Created native memory cache"
        );

        Ok(Self {
            instance: RwLock::new(CacheInstance::build(settings, &shared)),
            shared,
        })
    }

    fn current(&self) -> Arc<CacheInstance> {
        self.instance.read().clone()
    }

    /// Return the allocation for `context`, loading it on a miss.
    ///
    /// With `can_evict == false` a missing entry that would not fit next to
    /// the current contents is refused with [`Error::CapacityExceeded`]
    /// before any load starts.
    pub fn get(&self, context: &EntryContext, can_evict: bool) -> Result<Arc<Allocation>> {
        if self.is_shut_down() {
            return Err(Error::Rejected("native memory cache is shut down".to_string()));
        }

        let instance = self.current();
        let key = context.key();

        if !can_evict && instance.settings.weight_limited && !instance.cache.contains_key(&key) {
            let entry_kb = context
                .size_kb()
                .map_err(|e| Error::load_failed(&key, e))?;
            let current_kb = instance.size_kb_where(|_| true);
            let max_kb = instance.settings.max_weight_kb;
            if max_kb as i128 - current_kb as i128 - entry_kb as i128 <= 0 {
                return Err(Error::CapacityExceeded {
                    entry_kb,
                    current_kb,
                    max_kb,
                });
            }
        }

        let mut loaded = false;
        let started = Instant::now();
        let result = instance.cache.try_get_with(key.clone(), || {
            loaded = true;
            context.load()
        });

        let counters = &self.shared.counters;
        if !loaded {
            counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
            counters.load_time_nanos.fetch_add(
                u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX),
                Ordering::Relaxed,
            );
            if result.is_ok() {
                counters.load_successes.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.load_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let allocation = result.map_err(|e| {
            tracing::warn!(%key, error = %e, "Failed to load native memory entry");
            Error::load_failed(&key, e)
        })?;

        if loaded {
            // Apply size bounds now so evictions are visible to the caller
            instance.cache.run_pending_tasks();
        }

        if self.is_shut_down() {
            // Raced with shutdown(); nobody may wait on this entry
            if let Some(training) = allocation.as_training_data() {
                training.abandon();
            }
            instance.cache.invalidate(&key);
        } else if !Arc::ptr_eq(&instance, &self.current()) {
            // Loaded into an instance that was retired by rebuild()
            instance.cache.invalidate(&key);
        }

        Ok(allocation)
    }

    /// Remove one entry; its allocation is closed asynchronously
    pub fn invalidate(&self, key: &str) {
        let instance = self.current();
        instance.cache.invalidate(key);
        instance.cache.run_pending_tasks();
    }

    pub fn invalidate_all(&self) {
        self.current().clear();
    }

    /// Replace the cache with a fresh, empty one using `settings`
    pub fn rebuild(&self, settings: CacheSettings) {
        let retired = {
            let mut instance = self.instance.write();
            let fresh = CacheInstance::build(settings, &self.shared);
            std::mem::replace(&mut *instance, fresh)
        };
        retired.clear();
        self.shared.capacity_reached.store(false, Ordering::Release);
        tracing::info!(settings = ?self.settings(), "Rebuilt native memory cache");
    }

    pub fn settings(&self) -> CacheSettings {
        self.current().settings.clone()
    }

    /// Whether a size eviction happened since the flag was last cleared
    pub fn is_cache_capacity_reached(&self) -> bool {
        self.shared.capacity_reached.load(Ordering::Acquire)
    }

    pub fn set_cache_capacity_reached(&self, reached: bool) {
        self.shared.capacity_reached.store(reached, Ordering::Release);
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.shared.breaker
    }

    /// Run pending housekeeping, evicting expired entries
    pub fn run_maintenance(&self) {
        self.current().cache.run_pending_tasks();
    }

    /// Wait until every close scheduled so far has run
    pub fn flush_evictions(&self) {
        self.run_maintenance();
        self.shared.executor.flush();
    }

    /// Refuse further loads, release everything blocked on training data,
    /// close every entry and stop the executor.
    ///
    /// Training data whose population is still running is not waited for;
    /// the population frees it when it completes.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);

        let instance = self.current();
        for (_, allocation) in instance.allocations() {
            if let Some(training) = allocation.as_training_data() {
                training.abandon();
            }
        }
        instance.clear();
        self.shared.executor.shutdown();
        tracing::info!("Native memory cache shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.current().cache.contains_key(key)
    }

    pub fn entry_count(&self) -> usize {
        self.current().allocations().count()
    }

    /// Weight of one cached entry
    pub fn weight_for_key(&self, key: &str) -> Option<u64> {
        self.current().cache.get(key).map(|a| a.size_kb())
    }

    pub fn weight_percentage(&self) -> f64 {
        self.cache_size_percentage()
    }

    pub fn max_cache_size_kb(&self) -> u64 {
        self.current().settings.max_weight_kb
    }

    pub fn cache_size_kb(&self) -> u64 {
        self.current().size_kb_where(|_| true)
    }

    pub fn cache_size_percentage(&self) -> f64 {
        percentage(self.cache_size_kb(), self.max_cache_size_kb())
    }

    pub fn indices_size_kb(&self) -> u64 {
        self.current()
            .size_kb_where(|a| a.kind() == AllocationKind::Index)
    }

    pub fn indices_size_percentage(&self) -> f64 {
        percentage(self.indices_size_kb(), self.max_cache_size_kb())
    }

    pub fn index_size_kb(&self, index_name: &str) -> u64 {
        self.current()
            .size_kb_where(|a| a.index_name() == Some(index_name))
    }

    pub fn index_size_percentage(&self, index_name: &str) -> f64 {
        percentage(self.index_size_kb(index_name), self.max_cache_size_kb())
    }

    /// Training data plus model reservations
    pub fn training_size_kb(&self) -> u64 {
        self.current()
            .size_kb_where(|a| a.kind() != AllocationKind::Index)
    }

    pub fn training_size_percentage(&self) -> f64 {
        percentage(self.training_size_kb(), self.max_cache_size_kb())
    }

    /// Number of loaded graph files belonging to `index_name`
    pub fn index_graph_count(&self, index_name: &str) -> usize {
        self.index_allocations(index_name).len()
    }

    /// Cached allocations belonging to `index_name`
    pub fn index_allocations(&self, index_name: &str) -> Vec<Arc<Allocation>> {
        self.current()
            .allocations()
            .filter(|(_, a)| a.index_name() == Some(index_name))
            .map(|(_, a)| a)
            .collect()
    }

    pub fn indices_cache_stats(&self) -> BTreeMap<String, IndexCacheStats> {
        let instance = self.current();
        let max_kb = instance.settings.max_weight_kb;

        let mut stats: BTreeMap<String, IndexCacheStats> = BTreeMap::new();
        for (_, allocation) in instance.allocations() {
            if let Some(name) = allocation.index_name() {
                let entry = stats.entry(name.to_string()).or_default();
                entry.graph_count += 1;
                entry.memory_kb += allocation.size_kb();
            }
        }
        for entry in stats.values_mut() {
            entry.memory_percentage = percentage(entry.memory_kb, max_kb);
        }
        stats
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.shared.counters;
        CacheStats {
            hit_count: c.hits.load(Ordering::Relaxed),
            miss_count: c.misses.load(Ordering::Relaxed),
            load_success_count: c.load_successes.load(Ordering::Relaxed),
            load_failure_count: c.load_failures.load(Ordering::Relaxed),
            total_load_time: Duration::from_nanos(c.load_time_nanos.load(Ordering::Relaxed)),
            eviction_count: c.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::context::AnonymousEntryContext;

    fn manager(max_weight_kb: u64) -> CacheManager {
        CacheManager::new(
            CacheSettings {
                weight_limited: true,
                max_weight_kb,
                expiry: None,
            },
            Arc::new(CircuitBreaker::new()),
        )
        .unwrap()
    }

    fn reservation(size_kb: u64) -> EntryContext {
        EntryContext::Anonymous(AnonymousEntryContext::new(size_kb))
    }

    #[test]
    fn test_admission_control_without_eviction() {
        let cache = manager(100);
        let existing = reservation(40);
        cache.get(&existing, true).unwrap();

        let big = reservation(70);
        let err = cache.get(&big, false).unwrap_err();
        match err {
            Error::CapacityExceeded {
                entry_kb,
                current_kb,
                max_kb,
            } => {
                assert_eq!((entry_kb, current_kb, max_kb), (70, 40, 100));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!cache.contains(&big.key()));
        assert_eq!(cache.stats().miss_count, 1);

        // Exactly filling the cache is refused too
        assert!(cache.get(&reservation(60), false).is_err());
        cache.get(&reservation(59), false).unwrap();
    }

    #[test]
    fn test_size_eviction_raises_flags() {
        let cache = manager(100);
        let first = reservation(40);
        let first_allocation = cache.get(&first, true).unwrap();
        assert!(!cache.is_cache_capacity_reached());

        let second = reservation(70);
        cache.get(&second, true).unwrap();

        assert!(cache.is_cache_capacity_reached());
        assert!(cache.breaker().is_triggered());
        assert!(!cache.contains(&first.key()));
        assert!(cache.contains(&second.key()));
        assert_eq!(cache.cache_size_kb(), 70);

        cache.flush_evictions();
        assert!(first_allocation.is_closed());
        assert_eq!(cache.stats().eviction_count, 1);
    }

    #[test]
    fn test_cached_entry_is_shared() {
        let cache = manager(100);
        let context = reservation(10);

        let a = cache.get(&context, false).unwrap();
        let b = cache.get(&context, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let stats = cache.stats();
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.load_success_count, 1);
        assert_eq!(cache.weight_for_key(&context.key()), Some(10));
        assert!((cache.weight_percentage() - 10.0).abs() < f64::EPSILON);
        assert_eq!(cache.training_size_kb(), 10);
        assert_eq!(cache.indices_size_kb(), 0);
    }

    #[test]
    fn test_invalidate_closes_allocation() {
        let cache = manager(100);
        let context = reservation(10);
        let allocation = cache.get(&context, true).unwrap();

        cache.invalidate(&context.key());
        assert!(!cache.contains(&context.key()));
        cache.flush_evictions();
        assert!(allocation.is_closed());
        assert!(!cache.is_cache_capacity_reached());
    }

    #[test]
    fn test_rebuild_swaps_in_empty_cache() {
        let cache = manager(100);
        let context = reservation(10);
        let old = cache.get(&context, true).unwrap();
        cache.set_cache_capacity_reached(true);

        cache.rebuild(CacheSettings {
            weight_limited: true,
            max_weight_kb: 200,
            expiry: Some(Duration::from_secs(60)),
        });
        cache.flush_evictions();

        assert!(old.is_closed());
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.max_cache_size_kb(), 200);
        assert!(!cache.is_cache_capacity_reached());

        let fresh = cache.get(&context, true).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[test]
    fn test_expired_entries_are_closed_by_maintenance() {
        let cache = CacheManager::new(
            CacheSettings {
                weight_limited: false,
                max_weight_kb: 100,
                expiry: Some(Duration::from_millis(50)),
            },
            Arc::new(CircuitBreaker::new()),
        )
        .unwrap();

        let context = reservation(10);
        let allocation = cache.get(&context, true).unwrap();

        std::thread::sleep(Duration::from_millis(150));
        cache.flush_evictions();

        assert!(!cache.contains(&context.key()));
        assert!(allocation.is_closed());
        assert!(!cache.is_cache_capacity_reached());
    }

    #[test]
    fn test_unlimited_cache_never_refuses() {
        let cache = CacheManager::new(
            CacheSettings {
                weight_limited: false,
                max_weight_kb: 10,
                expiry: None,
            },
            Arc::new(CircuitBreaker::new()),
        )
        .unwrap();

        cache.get(&reservation(100), false).unwrap();
        cache.get(&reservation(100), false).unwrap();
        assert_eq!(cache.cache_size_kb(), 200);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let cache = manager(100);
        let allocation = cache.get(&reservation(10), true).unwrap();

        cache.shutdown();
        assert!(allocation.is_closed());
        assert_eq!(cache.entry_count(), 0);

        assert!(cache.is_shut_down());
        assert!(matches!(
            cache.get(&reservation(10), true),
            Err(Error::Rejected(_))
        ));
    }
}
