//! File watch service
//!
//! Index allocations are backed by files. When the backing file disappears
//! the allocation must be dropped from the cache, so every loaded index
//! registers a delete callback here.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::Result;

/// Invoked once when a watched file is deleted
pub type DeleteCallback = Box<dyn Fn() + Send + Sync>;

/// File watch service boundary
pub trait FileWatcher: Send + Sync {
    /// Start watching `path`; `on_delete` runs at most once
    fn watch(&self, path: &Path, on_delete: DeleteCallback) -> Result<WatchHandle>;
}

/// Registration returned by [`FileWatcher::watch`]. Stopping is idempotent.
pub struct WatchHandle {
    stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl WatchHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Mutex::new(Some(Box::new(stop))),
        }
    }

    /// A handle with nothing to stop
    pub fn noop() -> Self {
        Self {
            stop: Mutex::new(None),
        }
    }

    pub fn stop(&self) {
        let stop = self.stop.lock().take();
        if let Some(stop) = stop {
            stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.lock().is_none()
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct Registration {
    path: PathBuf,
    on_delete: DeleteCallback,
}

#[derive(Default)]
struct Registry {
    registrations: DashMap<u64, Registration>,
    next_id: AtomicU64,
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl Registry {
    fn poll(&self) -> usize {
        let deleted: Vec<u64> = self
            .registrations
            .iter()
            .filter(|r| !r.path.exists())
            .map(|r| *r.key())
            .collect();

        let mut fired = 0;
        for id in deleted {
            // Removal wins against a concurrent stop(), so the callback runs once
            if let Some((_, registration)) = self.registrations.remove(&id) {
                tracing::info!(path = %registration.path.display(), "Watched file deleted");
                (registration.on_delete)();
                fired += 1;
            }
        }
        fired
    }
}

/// Polls registered paths on a background thread
pub struct PollingFileWatcher {
    registry: Arc<Registry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollingFileWatcher {
    /// Start the polling thread
    pub fn start(interval: Duration) -> Result<Self> {
        let registry = Arc::new(Registry::default());

        let worker = {
            let registry = registry.clone();
            std::thread::Builder::new()
                .name("vecmem-file-watcher".to_string())
                .spawn(move || {
                    let mut stopped = registry.stopped.lock();
                    while !*stopped {
                        registry.wakeup.wait_for(&mut stopped, interval);
                        if *stopped {
                            break;
                        }
                        MutexGuard::unlocked(&mut stopped, || {
                            registry.poll();
                        });
                    }
                    tracing::debug!("File watcher stopped");
                })?
        };

        Ok(Self {
            registry,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Run one poll on the calling thread. Returns the number of callbacks fired.
    pub fn poll_once(&self) -> usize {
        self.registry.poll()
    }

    /// Number of active registrations
    pub fn watched(&self) -> usize {
        self.registry.registrations.len()
    }

    pub fn shutdown(&self) {
        *self.registry.stopped.lock() = true;
        self.registry.wakeup.notify_all();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("File watcher thread panicked");
            }
        }
    }
}

impl FileWatcher for PollingFileWatcher {
    fn watch(&self, path: &Path, on_delete: DeleteCallback) -> Result<WatchHandle> {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry.registrations.insert(
            id,
            Registration {
                path: path.to_path_buf(),
                on_delete,
            },
        );

        let registry = Arc::downgrade(&self.registry);
        Ok(WatchHandle::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.registrations.remove(&id);
            }
        }))
    }
}

impl Drop for PollingFileWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
