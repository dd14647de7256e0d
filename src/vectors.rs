//! Vector source boundary
//!
//! Training data is pulled from a document store in batches. The source
//! delivers batches asynchronously and reports completion exactly once.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::Vector;
use crate::{Error, Result};

/// Largest batch a single read may request
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Receives one batch of vectors; an error aborts the read
pub type BatchConsumer = Box<dyn FnMut(Vec<Vector>) -> Result<()> + Send>;

/// Invoked exactly once when a read finishes, successfully or not
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Which vectors to read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorReadRequest {
    pub index: String,
    pub field: String,
    pub max_count: usize,
    pub batch_size: usize,
}

impl VectorReadRequest {
    pub fn validate(&self) -> Result<()> {
        if self.max_count == 0 {
            return Err(Error::invalid_request("max vector count must be positive"));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::invalid_request(format!(
                "batch size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        Ok(())
    }
}

/// Vector source boundary
pub trait VectorSource: Send + Sync {
    fn read(
        &self,
        request: VectorReadRequest,
        consumer: BatchConsumer,
        on_complete: CompletionCallback,
    );
}

/// Serves registered `(index, field)` vector sets from memory
#[derive(Default)]
pub struct InMemoryVectorSource {
    sets: DashMap<(String, String), Arc<Vec<Vector>>>,
}

impl InMemoryVectorSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: impl Into<String>, field: impl Into<String>, vectors: Vec<Vector>) {
        self.sets
            .insert((index.into(), field.into()), Arc::new(vectors));
    }

    fn deliver(
        vectors: &[Vector],
        request: &VectorReadRequest,
        consumer: &mut BatchConsumer,
    ) -> Result<()> {
        let limit = request.max_count.min(vectors.len());
        for batch in vectors[..limit].chunks(request.batch_size) {
            consumer(batch.to_vec())?;
        }
        Ok(())
    }
}

impl VectorSource for InMemoryVectorSource {
    fn read(
        &self,
        request: VectorReadRequest,
        mut consumer: BatchConsumer,
        on_complete: CompletionCallback,
    ) {
        if let Err(e) = request.validate() {
            on_complete(Err(e));
            return;
        }

        let vectors = match self
            .sets
            .get(&(request.index.clone(), request.field.clone()))
        {
            Some(set) => set.value().clone(),
            None => {
                on_complete(Err(Error::invalid_request(format!(
                    "no vector field {} in index {}",
                    request.field, request.index
                ))));
                return;
            }
        };

        let on_complete = Arc::new(Mutex::new(Some(on_complete)));
        let spawned = {
            let on_complete = on_complete.clone();
            std::thread::Builder::new()
                .name("vecmem-vector-reader".to_string())
                .spawn(move || {
                    let result = Self::deliver(&vectors, &request, &mut consumer);
                    tracing::debug!(
                        index = %request.index,
                        field = %request.field,
                        ok = result.is_ok(),
                        "Vector read finished"
                    );
                    if let Some(done) = on_complete.lock().take() {
                        done(result);
                    }
                })
        };

        if let Err(e) = spawned {
            if let Some(done) = on_complete.lock().take() {
                done(Err(Error::Io(e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn collect(
        source: &InMemoryVectorSource,
        request: VectorReadRequest,
    ) -> (Vec<usize>, Result<()>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let sink = batches.clone();
        source.read(
            request,
            Box::new(move |batch| {
                sink.lock().push(batch.len());
                Ok(())
            }),
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        let result = rx.recv().unwrap();
        let sizes = batches.lock().clone();
        (sizes, result)
    }

    fn request(max_count: usize, batch_size: usize) -> VectorReadRequest {
        VectorReadRequest {
            index: "train".to_string(),
            field: "vec".to_string(),
            max_count,
            batch_size,
        }
    }

    #[test]
    fn test_batches_respect_max_count() {
        let source = InMemoryVectorSource::new();
        source.insert("train", "vec", vec![vec![0.0; 4]; 25]);

        let (sizes, result) = collect(&source, request(22, 10));
        assert!(result.is_ok());
        assert_eq!(sizes, vec![10, 10, 2]);

        let (sizes, result) = collect(&source, request(100, 10));
        assert!(result.is_ok());
        assert_eq!(sizes.iter().sum::<usize>(), 25);
    }

    #[test]
    fn test_invalid_requests_complete_with_error() {
        let source = InMemoryVectorSource::new();
        source.insert("train", "vec", vec![vec![0.0; 4]; 5]);

        assert!(collect(&source, request(0, 10)).1.is_err());
        assert!(collect(&source, request(5, 0)).1.is_err());
        assert!(collect(&source, request(5, MAX_BATCH_SIZE + 1)).1.is_err());

        let mut missing = request(5, 5);
        missing.field = "other".to_string();
        assert!(collect(&source, missing).1.is_err());
    }

    #[test]
    fn test_consumer_error_aborts_read() {
        let source = InMemoryVectorSource::new();
        source.insert("train", "vec", vec![vec![0.0; 4]; 30]);

        let (tx, rx) = mpsc::channel();
        let mut seen = 0;
        source.read(
            request(30, 10),
            Box::new(move |_| {
                seen += 1;
                if seen == 2 {
                    Err(Error::native("out of memory"))
                } else {
                    Ok(())
                }
            }),
            Box::new(move |result| tx.send(result).unwrap()),
        );
        assert!(matches!(rx.recv().unwrap(), Err(Error::Native(_))));
    }
}
