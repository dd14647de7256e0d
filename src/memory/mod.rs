//! Native memory lifecycle
//!
//! Allocations live in a weight-bounded [`CacheManager`]. Loads go through
//! [`EntryContext`]s and their strategies; frees run on a single eviction
//! thread. State shared by indices of one model is reference counted by
//! [`SharedStateManager`].

pub mod allocation;
pub mod breaker;
pub mod cache;
pub mod context;
pub mod executor;
pub mod gate;
pub mod maintenance;
pub mod shared_state;
pub mod strategy;

pub use allocation::{Allocation, AllocationKind};
pub use breaker::{BreakerMonitor, CircuitBreaker};
pub use cache::{CacheManager, CacheSettings, CacheStats, IndexCacheStats};
pub use context::{
    AnonymousEntryContext, EntryContext, IndexEntryContext, TrainingDataEntryContext,
};
pub use executor::SerialExecutor;
pub use gate::GateLock;
pub use maintenance::{MaintenanceConfig, MaintenanceManager};
pub use shared_state::{SharedState, SharedStateManager};
pub use strategy::{IndexLoadStrategy, TrainingLoadStrategy};
