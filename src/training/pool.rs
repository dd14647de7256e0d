//! Bounded worker pool for training jobs

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{Error, Result};

pub type TrainingTask = Box<dyn FnOnce() + Send>;

/// Fixed number of worker threads fed by a bounded queue.
///
/// Submission never blocks: a full queue or a stopped pool rejects the task.
pub struct TrainingPool {
    sender: Mutex<Option<mpsc::Sender<TrainingTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TrainingPool {
    pub fn start(size: usize, queue_depth: usize) -> Result<Self> {
        if size == 0 || queue_depth == 0 {
            return Err(Error::invalid_request(
                "training pool size and queue depth must be positive",
            ));
        }

        let (sender, receiver) = mpsc::channel::<TrainingTask>(queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = receiver.clone();
            let worker = std::thread::Builder::new()
                .name(format!("vecmem-training-{}", i))
                .spawn(move || loop {
                    let task = receiver.lock().blocking_recv();
                    match task {
                        Some(task) => {
                            if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                                tracing::error!("Training task panicked");
                            }
                        }
                        None => break,
                    }
                })?;
            workers.push(worker);
        }

        tracing::info!(size, queue_depth, "Started training pool");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task, or reject it with [`Error::Rejected`]
    pub fn try_execute(&self, task: TrainingTask) -> Result<()> {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Err(Error::Rejected("training pool is shut down".to_string()));
        };

        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::Rejected("training queue is at capacity".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::Rejected("training pool is shut down".to_string()))
            }
        }
    }

    /// Stop accepting tasks, finish queued ones, and join the workers
    pub fn shutdown(&self) {
        self.sender.lock().take();

        let current = std::thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("Training worker panicked");
            }
        }
    }
}

impl Drop for TrainingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
