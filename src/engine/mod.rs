//! Native engine boundary
//!
//! Every operation that touches memory outside the process heap goes through
//! [`NativeEngine`]. Calls are synchronous, may fail, and may be slow, so
//! callers must never invoke them while holding a cache-wide lock.

use std::path::Path;

use crate::types::{EngineKind, NativeHandle, Parameters, Vector};
use crate::Result;

pub mod heap;

pub use heap::HeapEngine;

/// Native engine operations consumed by the memory subsystem
pub trait NativeEngine: Send + Sync {
    /// Load an index file into native memory and return its handle
    fn load_index(
        &self,
        path: &Path,
        parameters: &Parameters,
        engine: EngineKind,
    ) -> Result<NativeHandle>;

    /// Free a loaded index
    fn free_index(&self, handle: NativeHandle, engine: EngineKind) -> Result<()>;

    /// Copy a batch of vectors into native memory.
    ///
    /// A `handle` of 0 allocates a new buffer; otherwise the batch is appended
    /// to the existing buffer. Returns the (possibly new) buffer handle.
    fn transfer_vectors(&self, handle: NativeHandle, vectors: &[Vector]) -> Result<NativeHandle>;

    /// Free a vector buffer created by [`NativeEngine::transfer_vectors`]
    fn free_vectors(&self, handle: NativeHandle) -> Result<()>;

    /// Train a model from the vectors behind `data` and return the serialized model
    fn train(
        &self,
        parameters: &Parameters,
        dimension: usize,
        data: NativeHandle,
        engine: EngineKind,
    ) -> Result<Vec<u8>>;

    /// Whether the loaded index needs engine state shared with other indices of the same model
    fn requires_shared_state(&self, handle: NativeHandle, engine: EngineKind) -> bool;

    /// Build shared state from a loaded index
    fn init_shared_state(&self, handle: NativeHandle, engine: EngineKind) -> Result<NativeHandle>;

    /// Attach shared state to a loaded index
    fn set_shared_state(
        &self,
        handle: NativeHandle,
        state: NativeHandle,
        engine: EngineKind,
    ) -> Result<()>;

    /// Free shared state built by [`NativeEngine::init_shared_state`]
    fn free_shared_state(&self, state: NativeHandle, engine: EngineKind) -> Result<()>;
}
