//! Common types for nimbus: the cluster data model, errors, collaborator
//! contracts and shared utilities.
//!
//! # Modules
//!
//! - [`types`] - Cluster, ClusterNode, jobs and health reports
//! - [`services`] - Contracts for the external platform services the controller drives
//! - [`store`] - Cluster persistence contract and the in-memory store
//! - [`memory`] - In-memory backends for every collaborator (tests and sandbox runs)
//! - [`retry`] / [`poll`] - Bounded retry and wait helpers
//! - [`redact`] - Wrappers that keep secrets out of logs
//! - [`telemetry`] - Logging initialization

#![deny(missing_docs)]

pub mod error;
pub mod memory;
pub mod poll;
pub mod redact;
pub mod retry;
pub mod services;
pub mod store;
pub mod telemetry;
pub mod types;

pub use error::Error;
pub use redact::{mask_join_secrets, Sensitive};
pub use services::{
    ComputeBackend, LoadBalancerService, ObjectStore, SecretsService, SecurityGroupService,
    TaskQueue,
};
pub use store::{ClusterStore, MemClusterStore};
pub use types::{
    Cluster, ClusterHealth, ClusterJob, ClusterNode, ClusterStatus, JobType, KubeconfigRole,
    NodeRole, NodeStatus,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Queue the controller consumes cluster jobs from
pub const DEFAULT_JOB_QUEUE: &str = "k8s_jobs";

/// Object-store bucket holding etcd snapshots
pub const BACKUP_BUCKET: &str = "k8s-backups";

/// Kubernetes API server port on control-plane nodes and the HA load balancer
pub const API_SERVER_PORT: u16 = 6443;

/// Default login user for the SSH executor
pub const DEFAULT_SSH_USER: &str = "ubuntu";
