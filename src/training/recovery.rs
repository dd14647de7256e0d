//! Fails training records orphaned by node or cluster loss

use std::collections::HashSet;
use std::sync::Arc;

use crate::cluster::ClusterChangedEvent;
use crate::model::{ModelState, ModelStore};

const CLUSTER_CRASHED: &str = "Training failed to complete as cluster crashed";
const NODE_DROPPED: &str = "Training failed to complete as node dropped";

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Models moved from `Training` to `Failed`
    pub failed: Vec<String>,
    /// Models that could not be read or updated
    pub errors: usize,
}

/// Reacts to membership changes on the cluster manager.
///
/// A freshly formed cluster cannot have training in progress, so every
/// `Training` record is failed. When nodes leave, records assigned to them
/// are failed. The scan is best effort: a model that cannot be updated is
/// logged and skipped.
pub struct TrainingRecoveryListener {
    store: Arc<dyn ModelStore>,
}

impl TrainingRecoveryListener {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self { store }
    }

    pub fn cluster_changed(&self, event: &ClusterChangedEvent) -> RecoveryReport {
        if !event.local_node_is_manager() {
            return RecoveryReport::default();
        }

        if event.is_new_cluster() {
            self.fail_training_models(|_| true, CLUSTER_CRASHED)
        } else if event.nodes_removed() {
            let removed: HashSet<&str> =
                event.removed_nodes().iter().map(String::as_str).collect();
            self.fail_training_models(|node| removed.contains(node), NODE_DROPPED)
        } else {
            RecoveryReport::default()
        }
    }

    fn fail_training_models(
        &self,
        assigned_to: impl Fn(&str) -> bool,
        reason: &str,
    ) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let ids = match self.store.list_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Unable to list models for training recovery");
                report.errors += 1;
                return report;
            }
        };

        for model_id in ids {
            let mut model = match self.store.get(&model_id) {
                Ok(model) => model,
                Err(e) => {
                    tracing::error!(%model_id, error = %e, "Unable to read model during training recovery");
                    report.errors += 1;
                    continue;
                }
            };

            if model.state() != ModelState::Training
                || !assigned_to(&model.metadata.node_assignment)
            {
                continue;
            }

            model.mark_failed(reason);
            match self.store.update(&model) {
                Ok(()) => {
                    tracing::warn!(
                        %model_id,
                        node = %model.metadata.node_assignment,
                        reason,
                        "Marked orphaned training model as failed"
                    );
                    report.failed.push(model_id);
                }
                Err(e) => {
                    tracing::error!(%model_id, error = %e, "Unable to update orphaned training model");
                    report.errors += 1;
                }
            }
        }

        report
    }
}
