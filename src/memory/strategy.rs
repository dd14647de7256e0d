//! Load strategies, invoked by the cache on a miss

use std::path::Path;
use std::sync::{Arc, Weak};

use crate::engine::NativeEngine;
use crate::memory::allocation::{
    Allocation, AnonymousAllocation, IndexAllocation, IndexAllocationParts, TrainingDataAllocation,
};
use crate::memory::cache::CacheManager;
use crate::memory::context::{AnonymousEntryContext, IndexEntryContext, TrainingDataEntryContext};
use crate::memory::shared_state::{SharedStateLease, SharedStateManager};
use crate::types::{EngineKind, NativeHandle};
use crate::vectors::{VectorReadRequest, VectorSource};
use crate::watcher::{FileWatcher, WatchHandle};
use crate::{Error, Result};

/// Loads index files into native memory
pub struct IndexLoadStrategy {
    native: Arc<dyn NativeEngine>,
    watcher: Arc<dyn FileWatcher>,
    shared_states: Arc<SharedStateManager>,
    cache: Weak<CacheManager>,
}

impl IndexLoadStrategy {
    /// `cache` receives invalidations when a loaded file is deleted
    pub fn new(
        native: Arc<dyn NativeEngine>,
        watcher: Arc<dyn FileWatcher>,
        shared_states: Arc<SharedStateManager>,
        cache: Weak<CacheManager>,
    ) -> Self {
        Self {
            native,
            watcher,
            shared_states,
            cache,
        }
    }

    pub fn load(&self, context: &IndexEntryContext) -> Result<Arc<Allocation>> {
        let path = context.index_path();
        let engine = EngineKind::from_path(path)?;
        let size_kb = context.size_kb()?;
        let key = context.key();

        let handle = self.native.load_index(path, context.parameters(), engine)?;

        let cache = self.cache.clone();
        let watched_key = key.clone();
        let watch = match self.watcher.watch(
            path,
            Box::new(move || {
                if let Some(cache) = cache.upgrade() {
                    cache.invalidate(&watched_key);
                }
            }),
        ) {
            Ok(watch) => watch,
            Err(e) => {
                self.discard(handle, engine, path, None);
                return Err(e);
            }
        };

        let shared_state = match context.model_id() {
            Some(model_id) if self.native.requires_shared_state(handle, engine) => {
                match self.attach_shared_state(handle, model_id, engine) {
                    Ok(lease) => Some(lease),
                    Err(e) => {
                        self.discard(handle, engine, path, Some(&watch));
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        tracing::debug!(%key, handle, size_kb, %engine, "Loaded index allocation");

        Ok(Arc::new(Allocation::Index(IndexAllocation::new(
            self.native.clone(),
            IndexAllocationParts {
                handle,
                size_kb,
                engine,
                index_path: path.to_path_buf(),
                index_name: context.index_name().to_string(),
                watch,
                shared_state,
            },
        ))))
    }

    fn attach_shared_state(
        &self,
        handle: NativeHandle,
        model_id: &str,
        engine: EngineKind,
    ) -> Result<SharedStateLease> {
        let lease = SharedStateLease::acquire(&self.shared_states, handle, model_id, engine)?;
        if let Err(e) = self
            .native
            .set_shared_state(handle, lease.state().address(), engine)
        {
            lease.release();
            return Err(e);
        }
        Ok(lease)
    }

    /// Undo a partially completed load
    fn discard(
        &self,
        handle: NativeHandle,
        engine: EngineKind,
        path: &Path,
        watch: Option<&WatchHandle>,
    ) {
        if let Some(watch) = watch {
            watch.stop();
        }
        if let Err(e) = self.native.free_index(handle, engine) {
            tracing::error!(path = %path.display(), handle, error = %e, "Failed to free partially loaded index");
        }
    }
}

/// Starts asynchronous population of training data
pub struct TrainingLoadStrategy {
    native: Arc<dyn NativeEngine>,
    vectors: Arc<dyn VectorSource>,
}

impl TrainingLoadStrategy {
    pub fn new(native: Arc<dyn NativeEngine>, vectors: Arc<dyn VectorSource>) -> Self {
        Self { native, vectors }
    }

    /// Returns as soon as the empty allocation exists. Its write lock stays
    /// held until the vector read completes, so readers block until then.
    pub fn load(&self, context: &TrainingDataEntryContext) -> Result<Arc<Allocation>> {
        let allocation = Arc::new(Allocation::TrainingData(TrainingDataAllocation::new(
            self.native.clone(),
            context.size_kb,
        )));
        let permit = training_data(&allocation)?.start_population()?;

        let consumer = {
            let allocation = allocation.clone();
            let native = self.native.clone();
            Box::new(move |batch: Vec<crate::types::Vector>| {
                let training = training_data(&allocation)?;
                let handle = native.transfer_vectors(training.handle(), &batch)?;
                training.set_handle(handle);
                Ok(())
            })
        };

        let key = context.key();
        // The buffer is freed here, under the permit, when the read failed or
        // the allocation was closed while the read was still running
        let on_complete = {
            let allocation = allocation.clone();
            Box::new(move |result: Result<()>| {
                match &result {
                    Ok(()) => tracing::debug!(%key, "Training data populated"),
                    Err(e) => tracing::error!(%key, error = %e, "Failed to populate training data"),
                }
                match allocation.as_training_data() {
                    Some(training) => training.finish_population(permit, result.is_ok()),
                    None => permit.release(),
                }
            })
        };

        self.vectors.read(
            VectorReadRequest {
                index: context.train_index.clone(),
                field: context.train_field.clone(),
                max_count: context.max_vector_count,
                batch_size: context.search_size,
            },
            consumer,
            on_complete,
        );

        Ok(allocation)
    }
}

fn training_data(allocation: &Allocation) -> Result<&TrainingDataAllocation> {
    allocation
        .as_training_data()
        .ok_or_else(|| Error::internal("expected a training data allocation"))
}

/// Creates weight reservations
pub struct AnonymousLoadStrategy;

impl AnonymousLoadStrategy {
    pub fn load(&self, context: &AnonymousEntryContext) -> Result<Arc<Allocation>> {
        Ok(Arc::new(Allocation::Anonymous(AnonymousAllocation::new(
            context.size_kb,
        ))))
    }
}
