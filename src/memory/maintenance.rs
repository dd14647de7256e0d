//! Background maintenance for the native memory cache
//!
//! Runs two periodic tasks: cache housekeeping, so idle entries expire and
//! get freed without being touched, and the circuit breaker check.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time;

use crate::memory::breaker::BreakerMonitor;
use crate::memory::cache::CacheManager;

/// Answers whether the local node currently manages the cluster
pub type ManagerCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub cache_interval: Duration,
    pub breaker_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cache_interval: Duration::from_secs(60),
            breaker_interval: Duration::from_secs(120),
        }
    }
}

/// Owns the periodic tasks; they stop at the next tick after [`MaintenanceManager::stop`]
pub struct MaintenanceManager {
    config: MaintenanceConfig,
    running: Arc<RwLock<bool>>,
}

impl MaintenanceManager {
    pub fn new(config: MaintenanceConfig) -> Self {
        Self {
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Spawn both tasks on the current tokio runtime
    pub async fn start(
        &self,
        cache: Arc<CacheManager>,
        monitor: Arc<BreakerMonitor>,
        is_cluster_manager: ManagerCheck,
    ) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Maintenance tasks already running");
                return;
            }
            *running = true;
        }

        tracing::info!(
            cache_interval = ?self.config.cache_interval,
            breaker_interval = ?self.config.breaker_interval,
            "Starting native memory maintenance"
        );

        Self::spawn_periodic(
            "cache maintenance",
            self.config.cache_interval,
            self.running.clone(),
            move || cache.run_maintenance(),
        );

        Self::spawn_periodic(
            "circuit breaker check",
            self.config.breaker_interval,
            self.running.clone(),
            move || monitor.check(is_cluster_manager()),
        );
    }

    /// Each run of `task` goes to the blocking pool
    fn spawn_periodic(
        name: &'static str,
        period: Duration,
        running: Arc<RwLock<bool>>,
        task: impl Fn() + Send + Sync + 'static,
    ) {
        let task = Arc::new(task);
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                if !*running.read().await {
                    tracing::info!(task = name, "Maintenance task stopped");
                    break;
                }

                tracing::debug!(task = name, "Running maintenance task");
                let task = task.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                    tracing::error!(task = name, error = %e, "Maintenance task failed");
                }
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        tracing::info!("Stopping native memory maintenance");
    }
}

impl Drop for MaintenanceManager {
    fn drop(&mut self) {
        // Cannot await here; tasks see the flag on their next tick
        if let Ok(mut running) = self.running.try_write() {
            *running = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::breaker::CircuitBreaker;
    use crate::memory::cache::CacheSettings;
    use crate::memory::context::{AnonymousEntryContext, EntryContext};

    #[tokio::test]
    async fn test_expired_entries_freed_in_background() {
        let cache = Arc::new(
            CacheManager::new(
                CacheSettings {
                    weight_limited: true,
                    max_weight_kb: 100,
                    expiry: Some(Duration::from_millis(30)),
                },
                Arc::new(CircuitBreaker::new()),
            )
            .unwrap(),
        );
        let allocation = cache
            .get(&EntryContext::Anonymous(AnonymousEntryContext::new(10)), true)
            .unwrap();

        let monitor = Arc::new(BreakerMonitor::new(cache.clone(), 75.0));
        let manager = MaintenanceManager::new(MaintenanceConfig {
            cache_interval: Duration::from_millis(20),
            breaker_interval: Duration::from_millis(20),
        });
        manager.start(cache.clone(), monitor, Arc::new(|| true)).await;
        assert!(manager.is_running().await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !allocation.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(allocation.is_closed());
        assert_eq!(cache.entry_count(), 0);

        manager.stop().await;
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_failed_run_does_not_stop_task() {
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let running = Arc::new(RwLock::new(true));

        let counter = runs.clone();
        MaintenanceManager::spawn_periodic(
            "flaky",
            Duration::from_millis(10),
            running.clone(),
            move || {
                if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            },
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while runs.load(std::sync::atomic::Ordering::SeqCst) < 3 {
            assert!(tokio::time::Instant::now() < deadline, "task stopped after a failed run");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        *running.write().await = false;
    }
}
