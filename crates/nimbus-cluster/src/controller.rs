//! Provisioner context and entry points
//!
//! The [`Provisioner`] exposes one method per lifecycle operation. Each takes a
//! cluster id, re-reads the row, and hands off to the matching module under
//! [`crate::phases`]. Collaborators live in a shared [`Context`] as trait
//! objects so tests can swap in the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::retry::{RetryConfig, DEFAULT_JITTER};
use nimbus_common::{
    ClusterHealth, ClusterStatus, ClusterStore, ComputeBackend, Error, KubeconfigRole,
    LoadBalancerService, ObjectStore, Result, SecretsService, SecurityGroupService, Sensitive,
};
use nimbus_executor::ExecutorResolver;

use crate::phases::{self, DeprovisionReport, ScaleReport};
use crate::reconciler::Healer;

/// Default machine image for nodes
pub const DEFAULT_NODE_IMAGE: &str = "ubuntu-22.04-kubeadm";

/// Timing and sizing knobs for the provisioner
#[derive(Clone, Debug)]
pub struct ProvisionerConfig {
    /// Machine image every node boots from
    pub node_image: String,
    /// Ports opened on every launched instance
    pub node_ports: Vec<u16>,
    /// Upper bound for an instance to receive an address
    pub ip_wait_timeout: Duration,
    /// Spacing of address polls
    pub ip_poll_interval: Duration,
    /// Upper bound for a node to accept commands
    pub node_ready_timeout: Duration,
    /// Upper bound for the API server to report healthy
    pub api_health_timeout: Duration,
    /// Spacing of API health polls
    pub api_health_poll_interval: Duration,
    /// Jitter applied to poll spacing
    pub poll_jitter: f64,
    /// kubeadm join attempts
    pub join_retry: RetryConfig,
    /// CNI manifest apply attempts
    pub cni_retry: RetryConfig,
    /// Load-balancer address polls
    pub lb_address_retry: RetryConfig,
    /// Control-plane nodes in an HA cluster
    pub ha_control_planes: usize,
    /// Largest base64 snapshot sent as a single command; larger ones are chunked
    pub restore_single_line_limit: usize,
    /// Chunk size for larger snapshots
    pub restore_chunk_size: usize,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            node_image: DEFAULT_NODE_IMAGE.to_string(),
            node_ports: vec![22, nimbus_common::API_SERVER_PORT, 10250],
            ip_wait_timeout: Duration::from_secs(5 * 60),
            ip_poll_interval: Duration::from_secs(10),
            node_ready_timeout: Duration::from_secs(5 * 60),
            api_health_timeout: Duration::from_secs(5 * 60),
            api_health_poll_interval: Duration::from_secs(10),
            poll_jitter: DEFAULT_JITTER,
            join_retry: RetryConfig::fixed(3, Duration::from_secs(10)),
            cni_retry: RetryConfig::fixed(3, Duration::from_secs(15)),
            lb_address_retry: RetryConfig::fixed(10, Duration::from_secs(2)),
            ha_control_planes: 3,
            // MAX_ARG_STRLEN is 128 KiB; stay well below it
            restore_single_line_limit: 96 * 1024,
            restore_chunk_size: 64 * 1024,
        }
    }
}

/// Shared collaborators for every lifecycle operation
pub struct Context {
    /// Cluster and node rows
    pub store: Arc<dyn ClusterStore>,
    /// Instances and in-engine exec
    pub compute: Arc<dyn ComputeBackend>,
    /// Virtual firewall
    pub security_groups: Arc<dyn SecurityGroupService>,
    /// API-server load balancers (HA)
    pub load_balancers: Arc<dyn LoadBalancerService>,
    /// etcd snapshot storage
    pub objects: Arc<dyn ObjectStore>,
    /// Encryption authority for kubeconfigs and SSH keys
    pub secrets: Arc<dyn SecretsService>,
    /// Picks the executor for a node
    pub executors: Arc<dyn ExecutorResolver>,
    /// Timing knobs
    pub config: ProvisionerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }
}

/// Builder for [`Context`]; every collaborator is required
#[derive(Default)]
pub struct ContextBuilder {
    store: Option<Arc<dyn ClusterStore>>,
    compute: Option<Arc<dyn ComputeBackend>>,
    security_groups: Option<Arc<dyn SecurityGroupService>>,
    load_balancers: Option<Arc<dyn LoadBalancerService>>,
    objects: Option<Arc<dyn ObjectStore>>,
    secrets: Option<Arc<dyn SecretsService>>,
    executors: Option<Arc<dyn ExecutorResolver>>,
    config: ProvisionerConfig,
}

impl ContextBuilder {
    /// Set the cluster store
    pub fn store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the compute backend
    pub fn compute(mut self, compute: Arc<dyn ComputeBackend>) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Set the security-group service
    pub fn security_groups(mut self, sgs: Arc<dyn SecurityGroupService>) -> Self {
        self.security_groups = Some(sgs);
        self
    }

    /// Set the load-balancer service
    pub fn load_balancers(mut self, lbs: Arc<dyn LoadBalancerService>) -> Self {
        self.load_balancers = Some(lbs);
        self
    }

    /// Set the object store
    pub fn objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Set the secrets service
    pub fn secrets(mut self, secrets: Arc<dyn SecretsService>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Set the executor resolver
    pub fn executors(mut self, executors: Arc<dyn ExecutorResolver>) -> Self {
        self.executors = Some(executors);
        self
    }

    /// Override timing knobs
    pub fn config(mut self, config: ProvisionerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the context, failing if a collaborator is missing
    pub fn build(self) -> Result<Context> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| {
                Error::internal_with_context("context", format!("missing collaborator: {name}"))
            })
        }

        Ok(Context {
            store: required(self.store, "store")?,
            compute: required(self.compute, "compute")?,
            security_groups: required(self.security_groups, "security_groups")?,
            load_balancers: required(self.load_balancers, "load_balancers")?,
            objects: required(self.objects, "objects")?,
            secrets: required(self.secrets, "secrets")?,
            executors: required(self.executors, "executors")?,
            config: self.config,
        })
    }
}

/// Drives clusters through their lifecycle
#[derive(Clone)]
pub struct Provisioner {
    ctx: Arc<Context>,
}

impl Provisioner {
    /// Create a provisioner over a context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Shared collaborators
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Build the cluster from scratch; ends `running` or `failed`
    pub async fn provision(&self, cluster_id: &str) -> Result<()> {
        phases::provision::provision(&self.ctx, cluster_id).await
    }

    /// Tear down nodes, load balancer and security group; the row itself is left to the caller
    pub async fn deprovision(&self, cluster_id: &str) -> Result<DeprovisionReport> {
        phases::deprovision::deprovision(&self.ctx, cluster_id).await
    }

    /// Rolling upgrade to `version`
    pub async fn upgrade(&self, cluster_id: &str, version: &str) -> Result<()> {
        phases::upgrade::upgrade(&self.ctx, cluster_id, version).await
    }

    /// Converge the worker count on `worker_count`
    pub async fn scale(&self, cluster_id: &str) -> Result<ScaleReport> {
        phases::scale::scale(&self.ctx, cluster_id).await
    }

    /// Re-apply networking and converge workers
    pub async fn repair(&self, cluster_id: &str) -> Result<()> {
        phases::repair::repair(&self.ctx, cluster_id).await
    }

    /// API liveness and node readiness
    pub async fn get_health(&self, cluster_id: &str) -> Result<ClusterHealth> {
        phases::health::get_health(&self.ctx, cluster_id).await
    }

    /// Decrypted kubeconfig for a role
    pub async fn get_kubeconfig(&self, cluster_id: &str, role: KubeconfigRole) -> Result<Sensitive> {
        phases::credentials::get_kubeconfig(&self.ctx, cluster_id, role).await
    }

    /// Renew control-plane certificates and re-store the admin kubeconfig
    pub async fn rotate_secrets(&self, cluster_id: &str) -> Result<()> {
        phases::credentials::rotate_secrets(&self.ctx, cluster_id).await
    }

    /// Snapshot etcd to the object store; returns the object key
    pub async fn create_backup(&self, cluster_id: &str) -> Result<String> {
        phases::backup::create_backup(&self.ctx, cluster_id).await
    }

    /// Restore etcd from an object key produced by [`Provisioner::create_backup`]
    pub async fn restore(&self, cluster_id: &str, backup_path: &str) -> Result<()> {
        phases::backup::restore(&self.ctx, cluster_id, backup_path).await
    }

    /// Current lifecycle status
    pub async fn get_status(&self, cluster_id: &str) -> Result<ClusterStatus> {
        Ok(self.ctx.store.get_cluster(cluster_id).await?.status)
    }
}

#[async_trait]
impl Healer for Provisioner {
    async fn health(&self, cluster_id: &str) -> Result<ClusterHealth> {
        self.get_health(cluster_id).await
    }

    async fn repair(&self, cluster_id: &str) -> Result<()> {
        Provisioner::repair(self, cluster_id).await
    }
}
