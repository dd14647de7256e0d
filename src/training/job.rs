//! A single model training run

use std::sync::Arc;

use crate::engine::NativeEngine;
use crate::memory::{
    AnonymousEntryContext, CacheManager, EntryContext, TrainingDataEntryContext,
};
use crate::model::{Model, ModelMetadata};
use crate::{Error, Result};

const LOAD_DATA_FAILED: &str =
    "Failed to load training data into memory. Check if there is enough memory to perform the request.";
const RESERVE_MODEL_FAILED: &str =
    "Failed to allocate space in native memory for the model. Check if there is enough memory to perform the request.";
const TRAINING_FAILED: &str =
    "Failed to execute training. May be caused by an invalid method definition or not enough memory to perform training.";

/// Trains one model from cached training data.
///
/// The job acquires the training vectors and a weight reservation for the
/// finished model from the cache without evicting anything, waits for the
/// vectors to be populated, runs the engine's trainer, and records the outcome
/// on its model. Both cache entries are invalidated afterwards on every path.
pub struct TrainingJob {
    model: Model,
    cache: Arc<CacheManager>,
    native: Arc<dyn NativeEngine>,
    training_data: EntryContext,
    reservation: EntryContext,
}

impl TrainingJob {
    /// `model_id` defaults to a random UUID
    pub fn new(
        model_id: Option<String>,
        metadata: ModelMetadata,
        cache: Arc<CacheManager>,
        native: Arc<dyn NativeEngine>,
        training_data: TrainingDataEntryContext,
        reservation: AnonymousEntryContext,
    ) -> Self {
        let model = match model_id {
            Some(model_id) => Model::with_id(model_id, metadata),
            None => Model::new(metadata),
        };

        Self {
            model,
            cache,
            native,
            training_data: EntryContext::TrainingData(training_data),
            reservation: EntryContext::Anonymous(reservation),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model.model_id
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub(crate) fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn training_data_key(&self) -> String {
        self.training_data.key()
    }

    /// Run to completion. The model ends up `Created` or `Failed`.
    pub fn run(&mut self) {
        let outcome = self.train();

        self.cache.invalidate(&self.training_data.key());
        self.cache.invalidate(&self.reservation.key());

        match outcome {
            Ok(blob) => {
                tracing::info!(model_id = %self.model.model_id, size = blob.len(), "Model trained");
                self.model.mark_created(blob);
            }
            Err(e) => {
                let message = match e {
                    Error::TrainingFailed(message) => message,
                    other => other.to_string(),
                };
                self.model.mark_failed(message);
            }
        }
    }

    fn train(&self) -> Result<Vec<u8>> {
        let model_id = &self.model.model_id;

        let training_data = self.cache.get(&self.training_data, false).map_err(|e| {
            tracing::error!(%model_id, error = %e, "Failed to get training data for model");
            Error::TrainingFailed(LOAD_DATA_FAILED.to_string())
        })?;

        let reservation = self.cache.get(&self.reservation, false).map_err(|e| {
            tracing::error!(%model_id, error = %e, "Failed to reserve memory for model");
            Error::TrainingFailed(RESERVE_MODEL_FAILED.to_string())
        })?;

        let failed = |e: Error| {
            tracing::error!(%model_id, error = %e, "Failed to run training job for model");
            Error::TrainingFailed(format!("{} {}", TRAINING_FAILED, e))
        };

        // Blocks until the training data has been populated
        let _reservation_guard = reservation.read_lock().map_err(failed)?;
        let _data_guard = training_data.read_lock().map_err(failed)?;

        if training_data.is_closed() {
            return Err(failed(Error::internal(
                "Unable to load training data into memory: allocation is already closed",
            )));
        }
        if reservation.is_closed() {
            return Err(failed(Error::internal(
                "Unable to reserve memory for model: allocation is already closed",
            )));
        }

        let metadata = &self.model.metadata;
        let handle = training_data.handle().map_err(failed)?;
        self.native
            .train(
                &metadata.parameters,
                metadata.dimension,
                handle,
                metadata.engine,
            )
            .map_err(failed)
    }
}
