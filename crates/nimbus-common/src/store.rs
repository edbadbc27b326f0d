//! Cluster persistence
//!
//! The store holds Cluster and ClusterNode rows. Every mutation is atomic per
//! row; there is no compare-and-set, single-writer discipline comes from the
//! job queue and the busy-cluster guard.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;

use crate::types::{Cluster, ClusterNode};
use crate::{Error, Result};

/// CRUD over clusters and their nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Insert a new cluster row
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Fetch a cluster by id
    async fn get_cluster(&self, id: &str) -> Result<Cluster>;

    /// Replace a cluster row; `updated_at` is stamped by the store
    async fn update_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Remove a cluster row along with any remaining node rows
    async fn delete_cluster(&self, id: &str) -> Result<()>;

    /// Every cluster, oldest first
    async fn list_all(&self) -> Result<Vec<Cluster>>;

    /// Clusters owned by a user, oldest first
    async fn list_by_user_id(&self, user_id: &str) -> Result<Vec<Cluster>>;

    /// Insert a node row
    async fn create_node(&self, node: &ClusterNode) -> Result<()>;

    /// Node rows of a cluster in insertion order
    async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<ClusterNode>>;

    /// Replace a node row
    async fn update_node(&self, node: &ClusterNode) -> Result<()>;

    /// Remove a node row
    async fn delete_node(&self, id: &str) -> Result<()>;
}

#[derive(Default)]
struct Rows {
    clusters: HashMap<String, Cluster>,
    // insertion order is the stored order scale-down and upgrade walk
    nodes: Vec<ClusterNode>,
}

/// In-memory `ClusterStore` for tests and sandbox runs; not persisted.
#[derive(Default)]
pub struct MemClusterStore {
    rows: RwLock<Rows>,
}

impl MemClusterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemClusterStore {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut rows = self.rows.write();
        if rows.clusters.contains_key(&cluster.id) {
            return Err(Error::validation_for(&cluster.id, "cluster already exists"));
        }
        rows.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster> {
        self.rows
            .read()
            .clusters
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("cluster", id))
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows
            .clusters
            .get_mut(&cluster.id)
            .ok_or_else(|| Error::not_found("cluster", &cluster.id))?;
        *row = cluster.clone();
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        let mut rows = self.rows.write();
        if rows.clusters.remove(id).is_none() {
            return Err(Error::not_found("cluster", id));
        }
        rows.nodes.retain(|n| n.cluster_id != id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Cluster>> {
        let mut all: Vec<Cluster> = self.rows.read().clusters.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn list_by_user_id(&self, user_id: &str) -> Result<Vec<Cluster>> {
        let mut owned = self.list_all().await?;
        owned.retain(|c| c.user_id == user_id);
        Ok(owned)
    }

    async fn create_node(&self, node: &ClusterNode) -> Result<()> {
        let mut rows = self.rows.write();
        if !rows.clusters.contains_key(&node.cluster_id) {
            return Err(Error::not_found("cluster", &node.cluster_id));
        }
        if rows.nodes.iter().any(|n| n.id == node.id) {
            return Err(Error::validation_for(&node.cluster_id, "node already exists"));
        }
        rows.nodes.push(node.clone());
        Ok(())
    }

    async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<ClusterNode>> {
        Ok(self
            .rows
            .read()
            .nodes
            .iter()
            .filter(|n| n.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn update_node(&self, node: &ClusterNode) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows
            .nodes
            .iter_mut()
            .find(|n| n.id == node.id)
            .ok_or_else(|| Error::not_found("node", &node.id))?;
        *row = node.clone();
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        let mut rows = self.rows.write();
        let before = rows.nodes.len();
        rows.nodes.retain(|n| n.id != id);
        if rows.nodes.len() == before {
            return Err(Error::not_found("node", id));
        }
        Ok(())
    }
}
