//! Single-thread executor for native frees
//!
//! Native engines generally require frees to run one at a time, and a free
//! can be slow. Evicted allocations are therefore closed here rather than on
//! the thread that triggered the eviction.

use std::panic::AssertUnwindSafe;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::Result;

type Job = Box<dyn FnOnce() + Send>;

/// Runs submitted jobs serially, in submission order, on one dedicated thread
pub struct SerialExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl SerialExecutor {
    pub fn start(name: &str) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    run_job(job);
                }
                tracing::debug!("Serial executor drained");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a job. After shutdown the job runs inline on the caller.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock().clone();
        let job: Job = Box::new(job);

        let job = match sender {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        tracing::warn!("Serial executor is shut down, running job inline");
        run_job(job);
    }

    /// Block until every job queued before this call has run
    pub fn flush(&self) {
        if std::thread::current().id() == self.worker_id {
            return;
        }

        let (done, wait) = std::sync::mpsc::sync_channel::<()>(1);
        self.execute(move || {
            let _ = done.send(());
        });
        let _ = wait.recv();
    }

    /// Stop accepting jobs, run what is queued, and join the worker
    pub fn shutdown(&self) {
        self.sender.lock().take();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("Serial executor thread panicked");
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_job(job: Job) {
    if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("Job panicked on serial executor");
    }
}
