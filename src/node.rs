//! Process-wide service container
//!
//! Builds every manager explicitly and exposes the operations other
//! components call. Tests build as many independent nodes as they like.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cluster::{ClusterChangedEvent, ClusterState};
use crate::config::AppConfig;
use crate::engine::NativeEngine;
use crate::memory::context::estimate_vector_set_size_kb;
use crate::memory::{
    Allocation, AnonymousEntryContext, BreakerMonitor, CacheManager, CacheSettings,
    CircuitBreaker, EntryContext, IndexEntryContext, IndexLoadStrategy, MaintenanceManager,
    SharedState, SharedStateManager, TrainingDataEntryContext, TrainingLoadStrategy,
};
use crate::model::{ModelMetadata, ModelStore};
use crate::training::{RecoveryReport, TrainingJob, TrainingJobRunner, TrainingPool, TrainingRecoveryListener};
use crate::types::{EngineKind, NativeHandle, Parameters};
use crate::vectors::VectorSource;
use crate::watcher::FileWatcher;
use crate::{Error, Result};

/// External systems the node depends on
#[derive(Clone)]
pub struct Collaborators {
    pub native: Arc<dyn NativeEngine>,
    pub watcher: Arc<dyn FileWatcher>,
    pub vectors: Arc<dyn VectorSource>,
    pub models: Arc<dyn ModelStore>,
}

/// Everything needed to train one model
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub model_id: Option<String>,
    pub engine: EngineKind,
    pub dimension: usize,
    pub description: String,
    pub parameters: Parameters,
    pub train_index: String,
    pub train_field: String,
    pub max_vector_count: usize,
    pub search_size: usize,
    /// Weight reserved in the cache for the finished model
    pub model_reservation_kb: u64,
}

pub struct Node {
    node_id: String,
    native: Arc<dyn NativeEngine>,
    models: Arc<dyn ModelStore>,
    cache: Arc<CacheManager>,
    shared_states: Arc<SharedStateManager>,
    index_strategy: Arc<IndexLoadStrategy>,
    training_strategy: Arc<TrainingLoadStrategy>,
    runner: TrainingJobRunner,
    recovery: TrainingRecoveryListener,
    monitor: Arc<BreakerMonitor>,
    maintenance: MaintenanceManager,
    cluster: Arc<RwLock<Option<ClusterState>>>,
}

impl Node {
    pub fn new(config: &AppConfig, collaborators: Collaborators) -> Result<Self> {
        let node_id = config.resolve_node_id();
        let Collaborators {
            native,
            watcher,
            vectors,
            models,
        } = collaborators;

        let breaker = Arc::new(CircuitBreaker::new());
        let cache = Arc::new(CacheManager::new(config.cache.settings(), breaker)?);
        let shared_states = Arc::new(SharedStateManager::new(native.clone()));

        let index_strategy = Arc::new(IndexLoadStrategy::new(
            native.clone(),
            watcher,
            shared_states.clone(),
            Arc::downgrade(&cache),
        ));
        let training_strategy = Arc::new(TrainingLoadStrategy::new(native.clone(), vectors));

        let pool = TrainingPool::start(config.training.pool_size, config.training.queue_depth)?;
        let runner = TrainingJobRunner::new(pool, models.clone(), node_id.clone());
        let recovery = TrainingRecoveryListener::new(models.clone());

        let monitor = Arc::new(BreakerMonitor::new(
            cache.clone(),
            config.circuit_breaker.unset_percentage,
        ));

        tracing::info!(%node_id, "Node initialised");

        Ok(Self {
            node_id,
            native,
            models,
            cache,
            shared_states,
            index_strategy,
            training_strategy,
            runner,
            recovery,
            monitor,
            maintenance: MaintenanceManager::new(config.maintenance_config()),
            cluster: Arc::new(RwLock::new(None)),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn shared_states(&self) -> &Arc<SharedStateManager> {
        &self.shared_states
    }

    pub fn models(&self) -> &Arc<dyn ModelStore> {
        &self.models
    }

    pub fn runner(&self) -> &TrainingJobRunner {
        &self.runner
    }

    pub fn monitor(&self) -> &Arc<BreakerMonitor> {
        &self.monitor
    }

    /// Entry for an index file
    pub fn index_entry(
        &self,
        index_path: impl Into<PathBuf>,
        index_name: impl Into<String>,
        parameters: Parameters,
    ) -> EntryContext {
        EntryContext::Index(IndexEntryContext::new(
            index_path,
            index_name,
            parameters,
            self.index_strategy.clone(),
        ))
    }

    /// Entry for an index file built from a trained model
    pub fn model_index_entry(
        &self,
        index_path: impl Into<PathBuf>,
        index_name: impl Into<String>,
        parameters: Parameters,
        model_id: impl Into<String>,
    ) -> EntryContext {
        EntryContext::Index(
            IndexEntryContext::new(index_path, index_name, parameters, self.index_strategy.clone())
                .with_model_id(model_id),
        )
    }

    /// Entry for training vectors of `dimension` components
    pub fn training_data_entry(
        &self,
        train_index: impl Into<String>,
        train_field: impl Into<String>,
        dimension: usize,
        max_vector_count: usize,
        search_size: usize,
    ) -> TrainingDataEntryContext {
        TrainingDataEntryContext::new(
            estimate_vector_set_size_kb(max_vector_count, dimension),
            train_index,
            train_field,
            max_vector_count,
            search_size,
            self.training_strategy.clone(),
        )
    }

    /// Build a job for `request`; submit it with [`Node::submit_training_job`]
    pub fn training_job(&self, request: TrainingRequest) -> TrainingJob {
        let training_data = self.training_data_entry(
            request.train_index,
            request.train_field,
            request.dimension,
            request.max_vector_count,
            request.search_size,
        );
        let metadata = ModelMetadata::training(
            request.engine,
            request.dimension,
            request.description,
            request.parameters,
        );

        TrainingJob::new(
            request.model_id,
            metadata,
            self.cache.clone(),
            self.native.clone(),
            training_data,
            AnonymousEntryContext::new(request.model_reservation_kb),
        )
    }

    pub fn acquire_allocation(
        &self,
        context: &EntryContext,
        can_evict: bool,
    ) -> Result<Arc<Allocation>> {
        self.cache.get(context, can_evict)
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn rebuild_cache(&self, settings: CacheSettings) {
        self.cache.rebuild(settings);
    }

    pub fn acquire_shared_state(
        &self,
        handle: NativeHandle,
        model_id: &str,
        engine: EngineKind,
    ) -> Result<SharedState> {
        self.shared_states.acquire(handle, model_id, engine)
    }

    pub fn release_shared_state(&self, state: &SharedState) -> Result<()> {
        self.shared_states.release(state)
    }

    /// Admit a training job. Refused while the circuit breaker is tripped.
    pub fn submit_training_job(&self, job: TrainingJob) -> Result<String> {
        if self.cache.breaker().is_triggered() {
            return Err(Error::Rejected(
                "Native memory circuit breaker is triggered. Unable to train a model.".to_string(),
            ));
        }
        self.runner.submit(job)
    }

    /// Record a new membership snapshot and recover orphaned training records
    pub fn cluster_changed(&self, state: ClusterState) -> RecoveryReport {
        let event = {
            let mut cluster = self.cluster.write();
            let event = ClusterChangedEvent::between(cluster.as_ref(), &state, &self.node_id);
            *cluster = Some(state);
            event
        };

        let report = self.recovery.cluster_changed(&event);
        if !report.failed.is_empty() || report.errors > 0 {
            tracing::info!(
                recovered = report.failed.len(),
                errors = report.errors,
                "Training recovery finished"
            );
        }
        report
    }

    pub fn is_cluster_manager(&self) -> bool {
        self.cluster
            .read()
            .as_ref()
            .map(|state| state.is_manager(&self.node_id))
            .unwrap_or(false)
    }

    /// Start periodic cache maintenance and breaker checks
    pub async fn start_background(&self) {
        let cluster = self.cluster.clone();
        let node_id = self.node_id.clone();
        let is_manager = Arc::new(move || {
            cluster
                .read()
                .as_ref()
                .map(|state| state.is_manager(&node_id))
                .unwrap_or(false)
        });

        self.maintenance
            .start(self.cache.clone(), self.monitor.clone(), is_manager)
            .await;
    }

    /// Stop background work, release blocked jobs, free everything
    pub async fn shutdown(&self) {
        self.maintenance.stop().await;
        self.cache.shutdown();
        self.runner.shutdown();
        tracing::info!(node_id = %self.node_id, "Node shut down");
    }
}
