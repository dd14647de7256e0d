//! Circuit breaker for native memory
//!
//! Two flags work together. The cache manager raises the node-level
//! "capacity reached" flag on every size eviction and trips the breaker at
//! the same time. [`BreakerMonitor`] lowers them again once pressure is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::memory::cache::CacheManager;

/// Cluster-level "native memory is full" flag consulted by admission logic
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    triggered: AtomicBool,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::AcqRel) {
            tracing::warn!("Native memory circuit breaker triggered");
        }
    }

    pub fn untrigger(&self) {
        if self.triggered.swap(false, Ordering::AcqRel) {
            tracing::info!("Native memory circuit breaker reset");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }
}

/// Periodic check that clears the breaker flags
pub struct BreakerMonitor {
    cache: Arc<CacheManager>,
    unset_percentage: f64,
}

impl BreakerMonitor {
    /// `unset_percentage` is the cache fill level, relative to the weight
    /// limit, at or below which the capacity flag is cleared
    pub fn new(cache: Arc<CacheManager>, unset_percentage: f64) -> Self {
        Self {
            cache,
            unset_percentage,
        }
    }

    /// Run one check. Only the cluster manager resets the breaker, and only
    /// while this node no longer reports capacity reached.
    pub fn check(&self, is_cluster_manager: bool) {
        if self.cache.is_cache_capacity_reached() {
            let used = self.cache.cache_size_percentage();
            if used <= self.unset_percentage {
                tracing::info!(
                    used_percentage = used,
                    unset_percentage = self.unset_percentage,
                    "Cache usage back under threshold, clearing capacity flag"
                );
                self.cache.set_cache_capacity_reached(false);
            }
        }

        let breaker = self.cache.breaker();
        if is_cluster_manager && breaker.is_triggered() && !self.cache.is_cache_capacity_reached() {
            breaker.untrigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cache::CacheSettings;
    use crate::memory::context::{AnonymousEntryContext, EntryContext};

    fn filled_cache() -> (Arc<CacheManager>, EntryContext) {
        let cache = Arc::new(
            CacheManager::new(
                CacheSettings {
                    weight_limited: true,
                    max_weight_kb: 100,
                    expiry: None,
                },
                Arc::new(CircuitBreaker::new()),
            )
            .unwrap(),
        );
        cache
            .get(&EntryContext::Anonymous(AnonymousEntryContext::new(50)), true)
            .unwrap();
        let big = EntryContext::Anonymous(AnonymousEntryContext::new(90));
        cache.get(&big, true).unwrap();
        assert!(cache.is_cache_capacity_reached());
        assert!(cache.breaker().is_triggered());
        (cache, big)
    }

    #[test]
    fn test_flags_stay_up_while_usage_is_high() {
        let (cache, _big) = filled_cache();
        let monitor = BreakerMonitor::new(cache.clone(), 75.0);

        monitor.check(true);
        assert!(cache.is_cache_capacity_reached());
        assert!(cache.breaker().is_triggered());
    }

    #[test]
    fn test_flags_cleared_after_pressure_drops() {
        let (cache, big) = filled_cache();
        let monitor = BreakerMonitor::new(cache.clone(), 75.0);

        cache.invalidate(&big.key());

        // A data node clears its own flag but leaves the breaker to the manager
        monitor.check(false);
        assert!(!cache.is_cache_capacity_reached());
        assert!(cache.breaker().is_triggered());

        monitor.check(true);
        assert!(!cache.breaker().is_triggered());
    }
}
