//! vecmem - lifecycle manager for native-memory vector index allocations
//!
//! vecmem keeps large off-heap artifacts (loaded index graphs, training
//! vectors, engine state shared between indices of one model) in a bounded
//! cache and frees them safely under concurrent use:
//! - Weight and idle-expiry bounded cache with single-flight loads
//! - Frees serialized on a dedicated eviction thread
//! - Populate-once allocations whose readers wait for population
//! - Reference-counted shared state per model
//! - Single-flight model training with crash recovery

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod model;
pub mod node;
pub mod training;
pub mod types;
pub mod vectors;
pub mod watcher;

pub use error::{Error, Result};
pub use node::{Collaborators, Node, TrainingRequest};
