//! Model training: jobs, admission, worker pool, and crash recovery

pub mod job;
pub mod pool;
pub mod recovery;
pub mod runner;

pub use job::TrainingJob;
pub use pool::TrainingPool;
pub use recovery::{RecoveryReport, TrainingRecoveryListener};
pub use runner::TrainingJobRunner;
