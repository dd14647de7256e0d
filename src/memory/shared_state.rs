//! Reference-counted engine state shared by indices built from the same model

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::engine::NativeEngine;
use crate::types::{EngineKind, NativeHandle};
use crate::{Error, Result};

/// Native state shared by every index built from one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedState {
    address: NativeHandle,
    model_id: String,
    engine: EngineKind,
}

impl SharedState {
    pub fn address(&self) -> NativeHandle {
        self.address
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }
}

struct SharedStateEntry {
    state: SharedState,
    references: AtomicI64,
}

/// Hands out shared state per model id and frees it when the last user releases it.
///
/// `acquire` runs under the read lock, so acquisitions for different models
/// proceed concurrently and creation races resolve inside the map's
/// get-or-insert. That insert calls into the engine but never touches the map
/// again. `release` takes the write lock, so state is never handed out while
/// it is being freed.
pub struct SharedStateManager {
    entries: DashMap<String, Arc<SharedStateEntry>>,
    lock: RwLock<()>,
    native: Arc<dyn NativeEngine>,
}

impl SharedStateManager {
    pub fn new(native: Arc<dyn NativeEngine>) -> Self {
        Self {
            entries: DashMap::new(),
            lock: RwLock::new(()),
            native,
        }
    }

    /// Get the shared state for `model_id`, building it from `source` if absent.
    ///
    /// Every successful call must be paired with exactly one [`SharedStateManager::release`].
    pub fn acquire(
        &self,
        source: NativeHandle,
        model_id: &str,
        engine: EngineKind,
    ) -> Result<SharedState> {
        let _read = self.lock.read();

        let entry = self
            .entries
            .entry(model_id.to_string())
            .or_try_insert_with(|| {
                tracing::info!(%model_id, "Loading entry into shared state cache");
                let address = self.native.init_shared_state(source, engine)?;
                Ok::<_, Error>(Arc::new(SharedStateEntry {
                    state: SharedState {
                        address,
                        model_id: model_id.to_string(),
                        engine,
                    },
                    references: AtomicI64::new(0),
                }))
            })?
            .value()
            .clone();

        entry.references.fetch_add(1, Ordering::AcqRel);
        Ok(entry.state.clone())
    }

    /// Drop one reference; the last one frees the native state.
    ///
    /// Releasing a model that is not present is logged and reported as
    /// [`Error::ProtocolViolation`] without touching any state.
    pub fn release(&self, state: &SharedState) -> Result<()> {
        let _write = self.lock.write();

        let entry = match self.entries.get(state.model_id()) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::error!(
                    model_id = %state.model_id(),
                    "Attempting to release shared state that is not present"
                );
                return Err(Error::ProtocolViolation(format!(
                    "shared state for model {} is not present",
                    state.model_id()
                )));
            }
        };

        let remaining = entry.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 {
            tracing::info!(model_id = %state.model_id(), "Evicting entry from shared state cache");
            self.entries.remove(state.model_id());
            if let Err(e) = self
                .native
                .free_shared_state(entry.state.address, entry.state.engine)
            {
                tracing::error!(model_id = %state.model_id(), error = %e, "Failed to free shared state");
            }
        }

        Ok(())
    }

    /// Current reference count for a model, if its state is live
    pub fn reference_count(&self, model_id: &str) -> Option<i64> {
        self.entries
            .get(model_id)
            .map(|e| e.references.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A reference held on behalf of one index allocation
pub struct SharedStateLease {
    state: SharedState,
    manager: Arc<SharedStateManager>,
}

impl SharedStateLease {
    pub fn acquire(
        manager: &Arc<SharedStateManager>,
        source: NativeHandle,
        model_id: &str,
        engine: EngineKind,
    ) -> Result<Self> {
        let state = manager.acquire(source, model_id, engine)?;
        Ok(Self {
            state,
            manager: manager.clone(),
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn release(self) {
        // Violations are already logged by the manager
        let _ = self.manager.release(&self.state);
    }
}
