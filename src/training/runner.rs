//! Single-flight admission for training jobs

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::model::{ModelState, ModelStore};
use crate::training::job::TrainingJob;
use crate::training::pool::TrainingPool;
use crate::{Error, Result};

const QUEUE_REJECTED: &str =
    "Training job execution was rejected. Node's training queue is at capacity.";

/// Concurrent training jobs admitted per node
const MAX_CONCURRENT_JOBS: usize = 1;

/// Holds the admission slot for one job and counts it as in flight
struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
    job_count: Arc<AtomicUsize>,
}

impl AdmissionTicket {
    fn new(permit: OwnedSemaphorePermit, job_count: Arc<AtomicUsize>) -> Self {
        job_count.fetch_add(1, Ordering::AcqRel);
        Self {
            _permit: permit,
            job_count,
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.job_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Admits at most one training job at a time and runs it on the pool.
///
/// The model record is written in `Training` state before the job is queued,
/// and rewritten with the final state when the job ends. Failures after
/// admission are recorded on the model, never returned to the submitter.
pub struct TrainingJobRunner {
    admission: Arc<Semaphore>,
    pool: TrainingPool,
    store: Arc<dyn ModelStore>,
    node_id: String,
    job_count: Arc<AtomicUsize>,
    training_errors: Arc<AtomicU64>,
}

impl TrainingJobRunner {
    pub fn new(
        pool: TrainingPool,
        store: Arc<dyn ModelStore>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)),
            pool,
            store,
            node_id: node_id.into(),
            job_count: Arc::new(AtomicUsize::new(0)),
            training_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Admit and queue `job`, returning its model id.
    ///
    /// Fails with [`Error::NoCapacity`] while another job holds the slot;
    /// nothing is written in that case.
    pub fn submit(&self, mut job: TrainingJob) -> Result<String> {
        let permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.training_errors.fetch_add(1, Ordering::Relaxed);
                return Err(Error::NoCapacity);
            }
        };
        let ticket = AdmissionTicket::new(permit, self.job_count.clone());

        job.model_mut().metadata.node_assignment = self.node_id.clone();
        let model_id = job.model_id().to_string();

        if let Err(e) = self.store.put(job.model()) {
            tracing::error!(%model_id, error = %e, "Failed to persist model before training");
            self.training_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let mut rejected = job.model().clone();
        let store = self.store.clone();
        let training_errors = self.training_errors.clone();
        let task = Box::new(move || {
            let _ticket = ticket;
            job.run();

            if job.model().state() == ModelState::Failed {
                training_errors.fetch_add(1, Ordering::Relaxed);
            }
            if let Err(e) = store.update(job.model()) {
                tracing::error!(model_id = %job.model_id(), error = %e, "Failed to update model after training");
                training_errors.fetch_add(1, Ordering::Relaxed);
            }
        });

        if let Err(e) = self.pool.try_execute(task) {
            tracing::error!(%model_id, error = %e, "Training job rejected");
            self.training_errors.fetch_add(1, Ordering::Relaxed);

            rejected.mark_failed(QUEUE_REJECTED);
            if let Err(e) = self.store.update(&rejected) {
                tracing::error!(%model_id, error = %e, "Failed to update rejected model");
            }
        }

        Ok(model_id)
    }

    /// Admitted jobs not yet finished
    pub fn job_count(&self) -> usize {
        self.job_count.load(Ordering::Acquire)
    }

    pub fn training_errors(&self) -> u64 {
        self.training_errors.load(Ordering::Relaxed)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
