//! Trained model records
//!
//! A model starts in [`ModelState::Training`] and ends in exactly one of
//! [`ModelState::Created`] (with a serialized payload) or
//! [`ModelState::Failed`] (with an error message).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EngineKind, Parameters};

pub mod store;

pub use store::{FileModelStore, InMemoryModelStore, ModelStore};

/// Lifecycle state of a model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Training,
    Created,
    Failed,
}

impl ModelState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ModelState::Training)
    }
}

/// Everything about a model except its payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    pub engine: EngineKind,
    pub dimension: usize,
    pub state: ModelState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    /// Empty unless the state is `Failed`
    #[serde(default)]
    pub error: String,
    /// Node the training job runs on
    #[serde(default)]
    pub node_assignment: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl ModelMetadata {
    /// Metadata for a model about to be trained
    pub fn training(
        engine: EngineKind,
        dimension: usize,
        description: impl Into<String>,
        parameters: Parameters,
    ) -> Self {
        Self {
            engine,
            dimension,
            state: ModelState::Training,
            timestamp: Utc::now(),
            description: description.into(),
            error: String::new(),
            node_assignment: String::new(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub model_id: String,
    pub metadata: ModelMetadata,
    /// Present only when the state is `Created`
    pub blob: Option<Vec<u8>>,
}

impl Model {
    /// New model with a random id
    pub fn new(metadata: ModelMetadata) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), metadata)
    }

    pub fn with_id(model_id: impl Into<String>, metadata: ModelMetadata) -> Self {
        Self {
            model_id: model_id.into(),
            metadata,
            blob: None,
        }
    }

    pub fn state(&self) -> ModelState {
        self.metadata.state
    }

    pub fn mark_created(&mut self, blob: Vec<u8>) {
        self.metadata.state = ModelState::Created;
        self.metadata.error.clear();
        self.metadata.timestamp = Utc::now();
        self.blob = Some(blob);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.metadata.state = ModelState::Failed;
        self.metadata.error = if error.is_empty() {
            "Training failed with an unknown error".to_string()
        } else {
            error
        };
        self.metadata.timestamp = Utc::now();
        self.blob = None;
    }
}
