//! Native memory allocations
//!
//! An allocation owns one native object and knows how to free it. Three
//! kinds exist:
//!
//! - [`IndexAllocation`]: a loaded index file. Plain shared/exclusive lock.
//! - [`TrainingDataAllocation`]: a vector buffer filled asynchronously after
//!   creation. Guarded by a [`GateLock`] so readers block until population
//!   finishes.
//! - [`AnonymousAllocation`]: no native object at all; reserves cache weight.
//!
//! Only the cache manager's eviction path closes allocations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::NativeEngine;
use crate::memory::gate::{GateLock, GateReadGuard, GateWriteGuard, WritePermit};
use crate::memory::shared_state::{SharedState, SharedStateLease};
use crate::types::{EngineKind, NativeHandle};
use crate::watcher::WatchHandle;
use crate::{Error, Result};

/// Kind of an [`Allocation`], used for statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Index,
    TrainingData,
    Anonymous,
}

/// A cached native memory allocation
pub enum Allocation {
    Index(IndexAllocation),
    TrainingData(TrainingDataAllocation),
    Anonymous(AnonymousAllocation),
}

/// Shared lock on an allocation
pub enum ReadGuard<'a> {
    Plain(RwLockReadGuard<'a, ()>),
    Gate(GateReadGuard<'a>),
}

/// Exclusive lock on an allocation
pub enum WriteGuard<'a> {
    Plain(RwLockWriteGuard<'a, ()>),
    Gate(GateWriteGuard<'a>),
}

impl Allocation {
    /// Free the native object. Idempotent.
    pub fn close(&self) {
        match self {
            Allocation::Index(a) => a.close(),
            Allocation::TrainingData(a) => a.close(),
            Allocation::Anonymous(a) => a.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Allocation::Index(a) => a.is_closed(),
            Allocation::TrainingData(a) => a.is_closed(),
            Allocation::Anonymous(a) => a.is_closed(),
        }
    }

    /// Native handle; only meaningful while holding a lock
    pub fn handle(&self) -> Result<NativeHandle> {
        match self {
            Allocation::Index(a) => Ok(a.handle()),
            Allocation::TrainingData(a) => Ok(a.handle()),
            Allocation::Anonymous(_) => Err(Error::invalid_request(
                "anonymous allocations have no native handle",
            )),
        }
    }

    pub fn read_lock(&self) -> Result<ReadGuard<'_>> {
        match self {
            Allocation::Index(a) => Ok(ReadGuard::Plain(a.lock.read())),
            Allocation::TrainingData(a) => Ok(ReadGuard::Gate(a.gate.read()?)),
            Allocation::Anonymous(a) => Ok(ReadGuard::Plain(a.lock.read())),
        }
    }

    pub fn write_lock(&self) -> Result<WriteGuard<'_>> {
        match self {
            Allocation::Index(a) => Ok(WriteGuard::Plain(a.lock.write())),
            Allocation::TrainingData(a) => Ok(WriteGuard::Gate(a.gate.write()?)),
            Allocation::Anonymous(a) => Ok(WriteGuard::Plain(a.lock.write())),
        }
    }

    pub fn size_kb(&self) -> u64 {
        match self {
            Allocation::Index(a) => a.size_kb,
            Allocation::TrainingData(a) => a.size_kb,
            Allocation::Anonymous(a) => a.size_kb,
        }
    }

    pub fn kind(&self) -> AllocationKind {
        match self {
            Allocation::Index(_) => AllocationKind::Index,
            Allocation::TrainingData(_) => AllocationKind::TrainingData,
            Allocation::Anonymous(_) => AllocationKind::Anonymous,
        }
    }

    pub fn as_index(&self) -> Option<&IndexAllocation> {
        match self {
            Allocation::Index(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_training_data(&self) -> Option<&TrainingDataAllocation> {
        match self {
            Allocation::TrainingData(a) => Some(a),
            _ => None,
        }
    }

    /// Logical index name for index allocations
    pub fn index_name(&self) -> Option<&str> {
        self.as_index().map(|a| a.index_name())
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("kind", &self.kind())
            .field("size_kb", &self.size_kb())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A loaded index file
pub struct IndexAllocation {
    handle: NativeHandle,
    size_kb: u64,
    engine: EngineKind,
    index_path: PathBuf,
    index_name: String,
    closed: AtomicBool,
    lock: RwLock<()>,
    watch: WatchHandle,
    shared_state: Mutex<Option<SharedStateLease>>,
    native: Arc<dyn NativeEngine>,
}

/// Everything an [`IndexAllocation`] is built from
pub struct IndexAllocationParts {
    pub handle: NativeHandle,
    pub size_kb: u64,
    pub engine: EngineKind,
    pub index_path: PathBuf,
    pub index_name: String,
    pub watch: WatchHandle,
    pub shared_state: Option<SharedStateLease>,
}

impl IndexAllocation {
    pub fn new(native: Arc<dyn NativeEngine>, parts: IndexAllocationParts) -> Self {
        Self {
            handle: parts.handle,
            size_kb: parts.size_kb,
            engine: parts.engine,
            index_path: parts.index_path,
            index_name: parts.index_name,
            closed: AtomicBool::new(false),
            lock: RwLock::new(()),
            watch: parts.watch,
            shared_state: Mutex::new(parts.shared_state),
            native,
        }
    }

    /// Takes the exclusive lock, so it waits for every reader to finish
    pub fn close(&self) {
        let _write = self.lock.write();
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        self.watch.stop();

        if self.handle != 0 {
            if let Err(e) = self.native.free_index(self.handle, self.engine) {
                tracing::error!(
                    path = %self.index_path.display(),
                    handle = self.handle,
                    error = %e,
                    "Failed to free index"
                );
            }
        }

        let lease = self.shared_state.lock().take();
        if let Some(lease) = lease {
            lease.release();
        }

        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn shared_state(&self) -> Option<SharedState> {
        self.shared_state.lock().as_ref().map(|l| l.state().clone())
    }
}

/// Vector buffer populated once, after creation
pub struct TrainingDataAllocation {
    handle: AtomicU64,
    size_kb: u64,
    closed: AtomicBool,
    gate: Arc<GateLock>,
    population: Mutex<Population>,
    native: Arc<dyn NativeEngine>,
}

#[derive(Default)]
struct Population {
    running: bool,
    /// A close gave up waiting; the population frees the buffer when it ends
    orphaned: bool,
}

impl TrainingDataAllocation {
    pub fn new(native: Arc<dyn NativeEngine>, size_kb: u64) -> Self {
        Self {
            handle: AtomicU64::new(0),
            size_kb,
            closed: AtomicBool::new(false),
            gate: Arc::new(GateLock::new()),
            population: Mutex::new(Population::default()),
            native,
        }
    }

    /// Take the write permit for the population. Readers block until the
    /// permit is handed back through [`TrainingDataAllocation::finish_population`].
    pub fn start_population(&self) -> Result<WritePermit> {
        let permit = self.gate.write_owned()?;
        self.population.lock().running = true;
        Ok(permit)
    }

    /// End the population started by [`TrainingDataAllocation::start_population`].
    ///
    /// The buffer is freed before the permit is released when the population
    /// failed or when a close gave up on it in the meantime.
    pub fn finish_population(&self, permit: WritePermit, succeeded: bool) {
        let orphaned = {
            let mut population = self.population.lock();
            population.running = false;
            population.orphaned
        };
        if !succeeded || orphaned {
            self.free();
        }
        permit.release();
    }

    /// Waits for readers and for the population, then frees the buffer.
    ///
    /// Once the gate has been abandoned a running population is not waited
    /// for; it frees the buffer itself when it finishes.
    pub fn close(&self) {
        if self.gate.write_lock().is_err() {
            {
                let mut population = self.population.lock();
                if population.running {
                    population.orphaned = true;
                    tracing::warn!(size_kb = self.size_kb, "Closing training data before population finished");
                    return;
                }
            }
            // Only readers hold the gate now
            self.gate.write_lock_uninterruptibly();
        }
        self.free();
        self.gate.write_unlock();
    }

    fn free(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let handle = self.handle.load(Ordering::Acquire);
        if handle != 0 {
            if let Err(e) = self.native.free_vectors(handle) {
                tracing::error!(handle, error = %e, "Failed to free training data");
            }
        }

        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle.load(Ordering::Acquire)
    }

    /// Record the buffer handle; only the populating thread calls this
    pub fn set_handle(&self, handle: NativeHandle) {
        let previous = self.handle.swap(handle, Ordering::AcqRel);
        if previous != 0 && previous != handle {
            tracing::warn!(previous, handle, "Training data handle replaced");
        }
    }

    pub fn gate(&self) -> &Arc<GateLock> {
        &self.gate
    }

    /// Fail every current and future wait on this allocation's lock
    pub fn abandon(&self) {
        self.gate.abandon();
    }
}

/// Weight reservation without a native object
pub struct AnonymousAllocation {
    size_kb: u64,
    closed: AtomicBool,
    lock: RwLock<()>,
}

impl AnonymousAllocation {
    pub fn new(size_kb: u64) -> Self {
        Self {
            size_kb,
            closed: AtomicBool::new(false),
            lock: RwLock::new(()),
        }
    }

    pub fn close(&self) {
        let _write = self.lock.write();
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HeapEngine;
    use crate::memory::shared_state::SharedStateManager;
    use crate::types::Parameters;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn load(engine: &Arc<HeapEngine>, dir: &TempDir, name: &str, bytes: &[u8]) -> (PathBuf, NativeHandle) {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        let handle = engine
            .load_index(&path, &Parameters::new(), EngineKind::Faiss)
            .unwrap();
        (path, handle)
    }

    #[test]
    fn test_index_close_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(HeapEngine::new());
        let (path, handle) = load(&engine, &temp_dir, "a.faiss", b"FLAT");

        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let allocation = Allocation::Index(IndexAllocation::new(
            engine.clone(),
            IndexAllocationParts {
                handle,
                size_kb: 4,
                engine: EngineKind::Faiss,
                index_path: path,
                index_name: "products".to_string(),
                watch: WatchHandle::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                shared_state: None,
            },
        ));

        allocation.close();
        allocation.close();

        assert!(allocation.is_closed());
        assert_eq!(engine.free_count(), 1);
        assert!(!engine.is_live(handle));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_index_close_never_frees_null_handle() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(HeapEngine::new());

        let allocation = IndexAllocation::new(
            engine.clone(),
            IndexAllocationParts {
                handle: 0,
                size_kb: 1,
                engine: EngineKind::Nmslib,
                index_path: temp_dir.path().join("missing.hnsw"),
                index_name: "products".to_string(),
                watch: WatchHandle::noop(),
                shared_state: None,
            },
        );
        allocation.close();
        assert!(allocation.is_closed());
        assert_eq!(engine.free_count(), 0);
    }

    #[test]
    fn test_index_close_waits_for_readers() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(HeapEngine::new());
        let (path, handle) = load(&engine, &temp_dir, "a.faiss", b"FLAT");

        let allocation = Arc::new(Allocation::Index(IndexAllocation::new(
            engine.clone(),
            IndexAllocationParts {
                handle,
                size_kb: 4,
                engine: EngineKind::Faiss,
                index_path: path,
                index_name: "products".to_string(),
                watch: WatchHandle::noop(),
                shared_state: None,
            },
        )));

        let guard = allocation.read_lock().unwrap();
        let closer = {
            let allocation = allocation.clone();
            std::thread::spawn(move || allocation.close())
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!allocation.is_closed());
        assert!(engine.is_live(allocation.handle().unwrap()));

        drop(guard);
        closer.join().unwrap();
        assert!(allocation.is_closed());
    }

    #[test]
    fn test_index_close_releases_shared_state() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(HeapEngine::new());
        let manager = Arc::new(SharedStateManager::new(engine.clone()));
        let (path, handle) = load(&engine, &temp_dir, "ivf.faiss", b"IVF_FLAT");

        let lease = SharedStateLease::acquire(&manager, handle, "model-1", EngineKind::Faiss).unwrap();
        let state = lease.state().address();

        let allocation = IndexAllocation::new(
            engine.clone(),
            IndexAllocationParts {
                handle,
                size_kb: 4,
                engine: EngineKind::Faiss,
                index_path: path,
                index_name: "products".to_string(),
                watch: WatchHandle::noop(),
                shared_state: Some(lease),
            },
        );
        assert_eq!(manager.reference_count("model-1"), Some(1));

        allocation.close();
        allocation.close();
        assert!(!engine.is_live(state));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_training_data_close_frees_once() {
        let engine = Arc::new(HeapEngine::new());
        let allocation = TrainingDataAllocation::new(engine.clone(), 8);

        let handle = engine.transfer_vectors(0, &[vec![1.0, 2.0]]).unwrap();
        allocation.set_handle(handle);

        allocation.close();
        allocation.close();
        assert!(allocation.is_closed());
        assert_eq!(engine.free_count(), 1);
    }

    #[test]
    fn test_unpopulated_training_data_close_skips_free() {
        let engine = Arc::new(HeapEngine::new());
        let allocation = TrainingDataAllocation::new(engine.clone(), 8);

        let permit = allocation.start_population().unwrap();
        allocation.finish_population(permit, false);

        assert!(allocation.is_closed());
        assert_eq!(engine.free_count(), 0);
        assert!(!allocation.gate().is_gated());
    }

    #[test]
    fn test_abandoned_close_leaves_free_to_population() {
        let engine = Arc::new(HeapEngine::new());
        let allocation = Arc::new(TrainingDataAllocation::new(engine.clone(), 8));
        let permit = allocation.start_population().unwrap();
        let handle = engine.transfer_vectors(0, &[vec![1.0, 2.0]]).unwrap();
        allocation.set_handle(handle);

        let closer = {
            let allocation = allocation.clone();
            std::thread::spawn(move || allocation.close())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!closer.is_finished());

        allocation.abandon();
        closer.join().unwrap();
        assert!(!allocation.is_closed());
        assert!(engine.is_live(handle));

        allocation.finish_population(permit, true);
        assert!(allocation.is_closed());
        assert!(!engine.is_live(handle));
        assert_eq!(engine.free_count(), 1);
        assert!(!allocation.gate().is_gated());
    }

    #[test]
    fn test_abandoned_close_still_waits_for_readers() {
        let engine = Arc::new(HeapEngine::new());
        let allocation = Arc::new(TrainingDataAllocation::new(engine.clone(), 8));
        let permit = allocation.start_population().unwrap();
        allocation.finish_population(permit, true);

        let guard = allocation.gate().read().unwrap();
        allocation.abandon();

        let closer = {
            let allocation = allocation.clone();
            std::thread::spawn(move || allocation.close())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!allocation.is_closed());

        drop(guard);
        closer.join().unwrap();
        assert!(allocation.is_closed());
    }

    #[test]
    fn test_anonymous_allocation_has_no_handle() {
        let allocation = Allocation::Anonymous(AnonymousAllocation::new(16));
        assert!(matches!(allocation.handle(), Err(Error::InvalidRequest(_))));
        assert_eq!(allocation.size_kb(), 16);

        allocation.close();
        allocation.close();
        assert!(allocation.is_closed());
    }
}
