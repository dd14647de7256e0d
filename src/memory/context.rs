//! Entry contexts: what to load, under which key, at what weight

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::memory::allocation::Allocation;
use crate::memory::strategy::{AnonymousLoadStrategy, IndexLoadStrategy, TrainingLoadStrategy};
use crate::types::Parameters;
use crate::Result;

const TRAINING_KEY_PREFIX: &str = "tdata#";

/// Kilobytes needed for `count` vectors of `dimension` f32 components, rounded up
pub fn estimate_vector_set_size_kb(count: usize, dimension: usize) -> u64 {
    let bytes = (count as u64)
        .saturating_mul(dimension as u64)
        .saturating_mul(std::mem::size_of::<f32>() as u64);
    bytes.div_ceil(1024)
}

/// Describes one cache entry and how to produce it
#[derive(Clone)]
pub enum EntryContext {
    Index(IndexEntryContext),
    TrainingData(TrainingDataEntryContext),
    Anonymous(AnonymousEntryContext),
}

impl EntryContext {
    pub fn key(&self) -> String {
        match self {
            EntryContext::Index(c) => c.key(),
            EntryContext::TrainingData(c) => c.key(),
            EntryContext::Anonymous(c) => c.key.clone(),
        }
    }

    /// Expected weight of the allocation
    pub fn size_kb(&self) -> Result<u64> {
        match self {
            EntryContext::Index(c) => c.size_kb(),
            EntryContext::TrainingData(c) => Ok(c.size_kb),
            EntryContext::Anonymous(c) => Ok(c.size_kb),
        }
    }

    /// Produce the allocation. Called by the cache on a miss only.
    pub fn load(&self) -> Result<Arc<Allocation>> {
        match self {
            EntryContext::Index(c) => c.strategy.load(c),
            EntryContext::TrainingData(c) => c.strategy.load(c),
            EntryContext::Anonymous(c) => AnonymousLoadStrategy.load(c),
        }
    }
}

impl std::fmt::Debug for EntryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EntryContext").field(&self.key()).finish()
    }
}

/// A file-backed index
#[derive(Clone)]
pub struct IndexEntryContext {
    pub(crate) index_path: PathBuf,
    pub(crate) index_name: String,
    pub(crate) parameters: Parameters,
    pub(crate) model_id: Option<String>,
    strategy: Arc<IndexLoadStrategy>,
}

impl IndexEntryContext {
    pub fn new(
        index_path: impl Into<PathBuf>,
        index_name: impl Into<String>,
        parameters: Parameters,
        strategy: Arc<IndexLoadStrategy>,
    ) -> Self {
        Self {
            index_path: index_path.into(),
            index_name: index_name.into(),
            parameters,
            model_id: None,
            strategy,
        }
    }

    /// Index built from a trained model; may need shared state
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// The file path is the key
    pub fn key(&self) -> String {
        self.index_path.to_string_lossy().into_owned()
    }

    /// Size of the backing file
    pub fn size_kb(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.index_path)?.len() / 1024)
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }
}

/// Vectors pulled from a source index for training
#[derive(Clone)]
pub struct TrainingDataEntryContext {
    pub(crate) size_kb: u64,
    pub(crate) train_index: String,
    pub(crate) train_field: String,
    pub(crate) max_vector_count: usize,
    pub(crate) search_size: usize,
    strategy: Arc<TrainingLoadStrategy>,
}

impl TrainingDataEntryContext {
    pub fn new(
        size_kb: u64,
        train_index: impl Into<String>,
        train_field: impl Into<String>,
        max_vector_count: usize,
        search_size: usize,
        strategy: Arc<TrainingLoadStrategy>,
    ) -> Self {
        Self {
            size_kb,
            train_index: train_index.into(),
            train_field: train_field.into(),
            max_vector_count,
            search_size,
            strategy,
        }
    }

    pub fn key(&self) -> String {
        training_data_key(&self.train_index, &self.train_field)
    }

    pub fn train_index(&self) -> &str {
        &self.train_index
    }

    pub fn train_field(&self) -> &str {
        &self.train_field
    }

    pub fn max_vector_count(&self) -> usize {
        self.max_vector_count
    }

    pub fn search_size(&self) -> usize {
        self.search_size
    }
}

/// Cache key for the training vectors of `index`/`field`
pub fn training_data_key(index: &str, field: &str) -> String {
    format!("{}{}:{}", TRAINING_KEY_PREFIX, index, field)
}

/// A weight reservation with a unique key
#[derive(Debug, Clone)]
pub struct AnonymousEntryContext {
    pub(crate) key: String,
    pub(crate) size_kb: u64,
}

impl AnonymousEntryContext {
    pub fn new(size_kb: u64) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            size_kb,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size_kb(&self) -> u64 {
        self.size_kb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_set_size_rounds_up() {
        assert_eq!(estimate_vector_set_size_kb(0, 128), 0);
        assert_eq!(estimate_vector_set_size_kb(1, 1), 1);
        assert_eq!(estimate_vector_set_size_kb(256, 1), 1);
        assert_eq!(estimate_vector_set_size_kb(257, 1), 2);
        assert_eq!(estimate_vector_set_size_kb(1000, 128), 500);
    }

    #[test]
    fn test_keys() {
        assert_eq!(training_data_key("train", "vec"), "tdata#train:vec");

        let a = AnonymousEntryContext::new(10);
        let b = AnonymousEntryContext::new(10);
        assert_ne!(a.key(), b.key());
        assert_eq!(EntryContext::Anonymous(a.clone()).size_kb().unwrap(), 10);
        assert_eq!(EntryContext::Anonymous(a.clone()).key(), a.key());
    }
}
