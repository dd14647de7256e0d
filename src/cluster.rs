//! Cluster membership snapshots
//!
//! The memory subsystem only needs to know which nodes exist, which one
//! manages the cluster, and what changed between two snapshots.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Membership snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Node currently acting as cluster manager, if one is elected
    pub manager_node: Option<String>,

    /// Ids of every node in the cluster
    pub nodes: BTreeSet<String>,
}

impl ClusterState {
    pub fn new(manager_node: Option<String>, nodes: impl IntoIterator<Item = String>) -> Self {
        Self {
            manager_node,
            nodes: nodes.into_iter().collect(),
        }
    }

    /// A cluster consisting of just `node_id`, which manages itself
    pub fn single_node(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            manager_node: Some(node_id.clone()),
            nodes: BTreeSet::from([node_id]),
        }
    }

    pub fn is_manager(&self, node_id: &str) -> bool {
        self.manager_node.as_deref() == Some(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }
}

/// Difference between two snapshots as seen from one node
#[derive(Debug, Clone)]
pub struct ClusterChangedEvent {
    current: ClusterState,
    local_node: String,
    new_cluster: bool,
    removed_nodes: Vec<String>,
}

impl ClusterChangedEvent {
    /// `previous == None` means the local node has never seen this cluster
    /// before, i.e. it was just formed or recovered from a full restart.
    pub fn between(
        previous: Option<&ClusterState>,
        current: &ClusterState,
        local_node: impl Into<String>,
    ) -> Self {
        let removed_nodes = previous
            .map(|previous| previous.nodes.difference(&current.nodes).cloned().collect())
            .unwrap_or_default();

        Self {
            current: current.clone(),
            local_node: local_node.into(),
            new_cluster: previous.is_none(),
            removed_nodes,
        }
    }

    pub fn is_new_cluster(&self) -> bool {
        self.new_cluster
    }

    pub fn local_node_is_manager(&self) -> bool {
        self.current.is_manager(&self.local_node)
    }

    pub fn nodes_removed(&self) -> bool {
        !self.removed_nodes.is_empty()
    }

    pub fn removed_nodes(&self) -> &[String] {
        &self.removed_nodes
    }

    pub fn state(&self) -> &ClusterState {
        &self.current
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }
}
