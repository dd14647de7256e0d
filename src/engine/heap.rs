//! Heap-backed native engine
//!
//! Keeps every "native" object in a handle table on the process heap. Used by
//! single-process deployments and throughout the test suite, where the
//! counters make frees observable.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;

use crate::types::{EngineKind, NativeHandle, Parameters, Vector};
use crate::{Error, Result};

use super::NativeEngine;

/// Index files starting with this magic carry inverted lists whose
/// coarse quantizer is shared between indices of the same model.
const SHARED_STATE_MAGIC: &[u8] = b"IVF";

enum Resident {
    Index {
        engine: EngineKind,
        data: Bytes,
        shared_state: Option<NativeHandle>,
    },
    Vectors(Vec<Vector>),
    SharedState {
        engine: EngineKind,
    },
}

impl Resident {
    fn kind(&self) -> &'static str {
        match self {
            Resident::Index { .. } => "index",
            Resident::Vectors(_) => "vectors",
            Resident::SharedState { .. } => "shared state",
        }
    }
}

/// In-process [`NativeEngine`]
#[derive(Default)]
pub struct HeapEngine {
    next_handle: AtomicU64,
    residents: DashMap<NativeHandle, Resident>,
    loads: AtomicU64,
    frees: AtomicU64,
}

impl HeapEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, resident: Resident) -> NativeHandle {
        // Handles start at 1 so that 0 keeps meaning "unset"
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.residents.insert(handle, resident);
        handle
    }

    fn release(&self, handle: NativeHandle, expected: &'static str) -> Result<()> {
        if handle == 0 {
            return Err(Error::native("attempted to free a null handle"));
        }

        match self.residents.remove_if(&handle, |_, r| r.kind() == expected) {
            Some(_) => {
                self.frees.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::native(format!(
                "no live {} at handle {}",
                expected, handle
            ))),
        }
    }

    /// Number of objects currently resident
    pub fn live_handles(&self) -> usize {
        self.residents.len()
    }

    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.residents.contains_key(&handle)
    }

    /// Number of successful index loads
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of successful frees of any kind
    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::SeqCst)
    }

    /// Number of vectors held behind a vector buffer handle
    pub fn vector_count(&self, handle: NativeHandle) -> Option<usize> {
        self.residents.get(&handle).and_then(|r| match r.value() {
            Resident::Vectors(v) => Some(v.len()),
            _ => None,
        })
    }

    /// Shared state attached to an index, if any
    pub fn attached_shared_state(&self, handle: NativeHandle) -> Option<NativeHandle> {
        self.residents.get(&handle).and_then(|r| match r.value() {
            Resident::Index { shared_state, .. } => *shared_state,
            _ => None,
        })
    }
}

impl NativeEngine for HeapEngine {
    fn load_index(
        &self,
        path: &Path,
        _parameters: &Parameters,
        engine: EngineKind,
    ) -> Result<NativeHandle> {
        let data = Bytes::from(std::fs::read(path)?);
        let handle = self.allocate(Resident::Index {
            engine,
            data,
            shared_state: None,
        });
        self.loads.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%handle, path = %path.display(), %engine, "Loaded index");
        Ok(handle)
    }

    fn free_index(&self, handle: NativeHandle, _engine: EngineKind) -> Result<()> {
        self.release(handle, "index")
    }

    fn transfer_vectors(&self, handle: NativeHandle, vectors: &[Vector]) -> Result<NativeHandle> {
        if handle == 0 {
            return Ok(self.allocate(Resident::Vectors(vectors.to_vec())));
        }

        let mut resident = self
            .residents
            .get_mut(&handle)
            .ok_or_else(|| Error::native(format!("no live vectors at handle {}", handle)))?;
        match resident.value_mut() {
            Resident::Vectors(existing) => {
                existing.extend_from_slice(vectors);
                Ok(handle)
            }
            other => Err(Error::native(format!(
                "handle {} holds {}, not vectors",
                handle,
                other.kind()
            ))),
        }
    }

    fn free_vectors(&self, handle: NativeHandle) -> Result<()> {
        self.release(handle, "vectors")
    }

    fn train(
        &self,
        _parameters: &Parameters,
        dimension: usize,
        data: NativeHandle,
        engine: EngineKind,
    ) -> Result<Vec<u8>> {
        if dimension == 0 {
            return Err(Error::native("dimension must be positive"));
        }

        let resident = self
            .residents
            .get(&data)
            .ok_or_else(|| Error::native(format!("no training data at handle {}", data)))?;
        let vectors = match resident.value() {
            Resident::Vectors(v) => v,
            other => {
                return Err(Error::native(format!(
                    "handle {} holds {}, not vectors",
                    data,
                    other.kind()
                )))
            }
        };

        if vectors.is_empty() {
            return Err(Error::native("no training vectors"));
        }

        let mut mean = vec![0f64; dimension];
        for vector in vectors.iter() {
            if vector.len() != dimension {
                return Err(Error::native(format!(
                    "vector dimension mismatch: expected {}, got {}",
                    dimension,
                    vector.len()
                )));
            }
            for (acc, v) in mean.iter_mut().zip(vector) {
                *acc += *v as f64;
            }
        }

        // [dimension: u32][count: u32][mean: f32 * dimension]
        let mut blob = Vec::with_capacity(8 + dimension * 4);
        blob.extend_from_slice(&(dimension as u32).to_le_bytes());
        blob.extend_from_slice(&(vectors.len() as u32).to_le_bytes());
        for acc in mean {
            blob.extend_from_slice(&((acc / vectors.len() as f64) as f32).to_le_bytes());
        }

        tracing::debug!(%engine, dimension, count = vectors.len(), "Trained model");
        Ok(blob)
    }

    fn requires_shared_state(&self, handle: NativeHandle, engine: EngineKind) -> bool {
        engine == EngineKind::Faiss
            && self
                .residents
                .get(&handle)
                .map(|r| match r.value() {
                    Resident::Index { data, .. } => data.starts_with(SHARED_STATE_MAGIC),
                    _ => false,
                })
                .unwrap_or(false)
    }

    fn init_shared_state(&self, handle: NativeHandle, engine: EngineKind) -> Result<NativeHandle> {
        if !self.requires_shared_state(handle, engine) {
            return Err(Error::native(format!(
                "index at handle {} has no shareable state",
                handle
            )));
        }
        Ok(self.allocate(Resident::SharedState { engine }))
    }

    fn set_shared_state(
        &self,
        handle: NativeHandle,
        state: NativeHandle,
        _engine: EngineKind,
    ) -> Result<()> {
        if !matches!(
            self.residents.get(&state).as_deref(),
            Some(Resident::SharedState { .. })
        ) {
            return Err(Error::native(format!("no shared state at handle {}", state)));
        }

        let mut resident = self
            .residents
            .get_mut(&handle)
            .ok_or_else(|| Error::native(format!("no live index at handle {}", handle)))?;
        match resident.value_mut() {
            Resident::Index { shared_state, .. } => {
                *shared_state = Some(state);
                Ok(())
            }
            other => Err(Error::native(format!(
                "handle {} holds {}, not an index",
                handle,
                other.kind()
            ))),
        }
    }

    fn free_shared_state(&self, state: NativeHandle, engine: EngineKind) -> Result<()> {
        if let Some(r) = self.residents.get(&state) {
            if let Resident::SharedState { engine: owner } = r.value() {
                if *owner != engine {
                    return Err(Error::native(format!(
                        "shared state {} belongs to {}, not {}",
                        state, owner, engine
                    )));
                }
            }
        }
        self.release(state, "shared state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_and_free_index() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("seg.faiss");
        std::fs::write(&path, b"FLAT....").unwrap();

        let engine = HeapEngine::new();
        let handle = engine
            .load_index(&path, &Parameters::new(), EngineKind::Faiss)
            .unwrap();
        assert_ne!(handle, 0);
        assert_eq!(engine.load_count(), 1);
        assert!(!engine.requires_shared_state(handle, EngineKind::Faiss));

        engine.free_index(handle, EngineKind::Faiss).unwrap();
        assert_eq!(engine.free_count(), 1);
        assert!(engine.free_index(handle, EngineKind::Faiss).is_err());
        assert!(engine.free_index(0, EngineKind::Faiss).is_err());
    }

    #[test]
    fn test_transfer_and_train() {
        let engine = HeapEngine::new();
        let handle = engine
            .transfer_vectors(0, &[vec![1.0, 2.0], vec![3.0, 4.0]])
            .unwrap();
        let same = engine.transfer_vectors(handle, &[vec![5.0, 6.0]]).unwrap();
        assert_eq!(handle, same);
        assert_eq!(engine.vector_count(handle), Some(3));

        let blob = engine
            .train(&Parameters::new(), 2, handle, EngineKind::Faiss)
            .unwrap();
        assert_eq!(&blob[0..4], &2u32.to_le_bytes());
        assert_eq!(&blob[4..8], &3u32.to_le_bytes());
        assert_eq!(&blob[8..12], &3.0f32.to_le_bytes());
        assert_eq!(&blob[12..16], &4.0f32.to_le_bytes());

        assert!(engine
            .train(&Parameters::new(), 3, handle, EngineKind::Faiss)
            .is_err());
        engine.free_vectors(handle).unwrap();
        assert!(!engine.is_live(handle));
    }

    #[test]
    fn test_shared_state_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ivf.faiss");
        std::fs::write(&path, b"IVF_PQ....").unwrap();

        let engine = HeapEngine::new();
        let handle = engine
            .load_index(&path, &Parameters::new(), EngineKind::Faiss)
            .unwrap();
        assert!(engine.requires_shared_state(handle, EngineKind::Faiss));
        assert!(!engine.requires_shared_state(handle, EngineKind::Nmslib));

        let state = engine.init_shared_state(handle, EngineKind::Faiss).unwrap();
        engine
            .set_shared_state(handle, state, EngineKind::Faiss)
            .unwrap();
        assert_eq!(engine.attached_shared_state(handle), Some(state));

        assert!(engine.free_shared_state(state, EngineKind::Nmslib).is_err());
        engine.free_shared_state(state, EngineKind::Faiss).unwrap();
        assert!(!engine.is_live(state));
    }
}
