//! Cluster data model
//!
//! Clusters and their nodes are flat rows keyed by id; a node refers to its
//! cluster by `cluster_id` and is resolved through the store on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Cluster lifecycle status
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Created by an external service, waiting for a provision job
    #[default]
    Pending,
    /// Infrastructure and kubeadm bootstrap in progress
    Provisioning,
    /// Control plane healthy, workers converging
    Running,
    /// Rolling kubeadm upgrade in progress
    Upgrading,
    /// A job failed; Deprovision is the cleanup path
    Failed,
    /// Deprovision in progress; the row is removed at the end
    Deleting,
}

impl ClusterStatus {
    /// Terminal statuses are the only ones a finished job may leave behind
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Running | Self::Failed)
    }

    /// Statuses that require at least one control-plane address
    pub fn requires_control_plane(&self) -> bool {
        matches!(self, Self::Running | Self::Upgrading)
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Upgrading => write!(f, "upgrading"),
            Self::Failed => write!(f, "failed"),
            Self::Deleting => write!(f, "deleting"),
        }
    }
}

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Hosts API server, scheduler, controller-manager and etcd
    ControlPlane,
    /// Runs workloads
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Node lifecycle status
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Instance launched, bootstrap or join not finished
    #[default]
    Provisioning,
    /// Joined the cluster
    Active,
    /// Bootstrap or join failed
    Failed,
}

/// A managed Kubernetes cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Cluster {
    /// Stable identifier
    pub id: String,
    /// Owning user; scopes Secrets and object-store access
    pub user_id: String,
    /// Owning tenant
    pub tenant_id: String,
    /// DNS-safe cluster name, used for resource naming
    pub name: String,
    /// Virtual network the nodes live in
    pub vpc_id: String,
    /// Subnet for node instances (backend default when unset)
    #[serde(default)]
    pub subnet_id: Option<String>,
    /// Target Kubernetes version (e.g. `v1.29.0`)
    pub version: String,
    /// Control-plane addresses; index 0 is the primary
    #[serde(default)]
    pub control_plane_ips: Vec<String>,
    /// Desired worker count
    pub worker_count: u32,
    /// Lifecycle status
    #[serde(default)]
    pub status: ClusterStatus,
    /// Three control-plane nodes behind a TCP load balancer
    #[serde(default)]
    pub ha_enabled: bool,
    /// Address of the API-server load balancer (HA only)
    #[serde(default)]
    pub api_server_lb_address: Option<String>,
    /// Apply a default-deny ingress NetworkPolicy
    #[serde(default)]
    pub network_isolation: bool,
    /// Admin kubeconfig ciphertext (empty until provisioned)
    #[serde(default)]
    pub kubeconfig: String,
    /// SSH private key ciphertext for the SSH executor
    #[serde(default)]
    pub ssh_key: String,
    /// In-flight job, cleared at terminal transitions
    #[serde(default)]
    pub job_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// Create a pending cluster with a fresh id
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        vpc_id: impl Into<String>,
        version: impl Into<String>,
        worker_count: u32,
    ) -> Self {
        let now = Utc::now();
        let user_id = user_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: user_id.clone(),
            user_id,
            name: name.into(),
            vpc_id: vpc_id.into(),
            subnet_id: None,
            version: version.into(),
            control_plane_ips: Vec::new(),
            worker_count,
            status: ClusterStatus::Pending,
            ha_enabled: false,
            api_server_lb_address: None,
            network_isolation: false,
            kubeconfig: String::new(),
            ssh_key: String::new(),
            job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Primary control-plane address
    pub fn primary_ip(&self) -> Option<&str> {
        self.control_plane_ips.first().map(String::as_str)
    }

    /// Primary control-plane address, or a validation error naming the operation
    pub fn require_primary_ip(&self, operation: &str) -> Result<&str> {
        self.primary_ip().ok_or_else(|| {
            Error::validation_for(
                &self.id,
                format!("{operation} requires at least one control-plane IP"),
            )
        })
    }

    /// Name of the cluster security group
    pub fn security_group_name(&self) -> String {
        format!("sg-{}", self.name)
    }

    /// Name of the API-server load balancer (HA)
    pub fn load_balancer_name(&self) -> String {
        format!("lb-k8s-{}", self.name)
    }

    /// Host the API server is reached at: the LB for HA, otherwise the primary
    pub fn api_host(&self) -> Option<&str> {
        self.api_server_lb_address
            .as_deref()
            .filter(|_| self.ha_enabled)
            .or_else(|| self.primary_ip())
    }

    /// Check the structural invariants for the current status
    pub fn check_invariants(&self, control_plane_nodes: usize) -> Result<()> {
        if self.status.requires_control_plane() && self.control_plane_ips.is_empty() {
            return Err(Error::validation_for(
                &self.id,
                format!("status {} requires a control-plane IP", self.status),
            ));
        }
        if self.ha_enabled && self.status == ClusterStatus::Running {
            if control_plane_nodes < 3 {
                return Err(Error::validation_for(
                    &self.id,
                    format!("HA cluster has {control_plane_nodes} control-plane nodes, need 3"),
                ));
            }
            if self.api_server_lb_address.is_none() {
                return Err(Error::validation_for(
                    &self.id,
                    "HA cluster has no API-server load balancer address",
                ));
            }
        }
        if self.status.is_terminal() && self.job_id.is_some() {
            return Err(Error::validation_for(
                &self.id,
                format!("terminal status {} with an in-flight job", self.status),
            ));
        }
        Ok(())
    }
}

/// A node belonging to a cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ClusterNode {
    /// Row identifier
    pub id: String,
    /// Owning cluster
    pub cluster_id: String,
    /// Compute instance backing the node
    pub instance_id: String,
    /// Instance name, also the Kubernetes node name
    pub name: String,
    /// Control plane or worker
    pub role: NodeRole,
    /// Node lifecycle status
    pub status: NodeStatus,
    /// When the node joined the cluster
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

impl ClusterNode {
    /// Create a provisioning node row for a launched instance
    pub fn new(
        cluster_id: impl Into<String>,
        instance_id: impl Into<String>,
        name: impl Into<String>,
        role: NodeRole,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.into(),
            instance_id: instance_id.into(),
            name: name.into(),
            role,
            status: NodeStatus::Provisioning,
            joined_at: None,
        }
    }

    /// Mark the node as joined now
    pub fn mark_active(&mut self) {
        self.status = NodeStatus::Active;
        self.joined_at = Some(Utc::now());
    }

    /// True for worker rows that still count toward the desired worker count
    pub fn is_live_worker(&self) -> bool {
        self.role == NodeRole::Worker && self.status != NodeStatus::Failed
    }
}

/// Kind of work a queued job asks for
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Build the cluster from scratch
    Provision,
    /// Tear the cluster down and remove its row
    Deprovision,
    /// Upgrade to `version`
    Upgrade,
    /// Converge worker count
    Scale,
    /// Re-apply networking and converge workers
    Repair,
    /// Renew certificates and re-store the admin kubeconfig
    RotateSecrets,
    /// Snapshot etcd to the object store
    Backup,
    /// Restore etcd from `backup_path`
    Restore,
    /// Anything else; logged and ignored
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::Upgrade => "upgrade",
            Self::Scale => "scale",
            Self::Repair => "repair",
            Self::RotateSecrets => "rotate_secrets",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Job payload as it appears on the queue
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ClusterJob {
    /// Target cluster
    pub cluster_id: String,
    /// Requesting user
    pub user_id: String,
    /// What to do
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Target version (upgrade)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Object key to restore from (restore)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

impl ClusterJob {
    /// Parse a queue payload
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| Error::serialization_for_kind("ClusterJob", e.to_string()))
    }

    /// Build a job with no optional fields
    pub fn new(cluster_id: impl Into<String>, user_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            user_id: user_id.into(),
            job_type,
            version: None,
            backup_path: None,
        }
    }

    /// Serialize for enqueueing
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Health report for a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterHealth {
    /// Cluster status at the time of the check
    pub status: ClusterStatus,
    /// Whether `kubectl get nodes` succeeded on the primary
    pub api_server: bool,
    /// Nodes registered with the API server
    pub nodes_total: u32,
    /// Nodes reporting Ready
    pub nodes_ready: u32,
    /// Summary of degraded state; empty when fully healthy
    pub message: String,
}

impl ClusterHealth {
    /// API reachable and every node Ready
    pub fn is_healthy(&self) -> bool {
        self.api_server && self.nodes_ready >= self.nodes_total
    }
}

/// Which kubeconfig flavor to hand out
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KubeconfigRole {
    /// Cluster-admin credentials
    Admin,
    /// Read-only credentials
    Viewer,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Cluster {
        Cluster::new("u-1", "dev", "vpc-1", "v1.29.0", 2)
    }

    mod job_payloads {
        use super::*;

        #[test]
        fn parses_provision_without_version() {
            let job = ClusterJob::parse(
                r#"{"cluster_id":"c-1","user_id":"u-1","type":"provision"}"#,
            )
            .unwrap();
            assert_eq!(job.job_type, JobType::Provision);
            assert!(job.version.is_none());
        }

        #[test]
        fn parses_upgrade_with_version() {
            let job = ClusterJob::parse(
                r#"{"cluster_id":"c-1","user_id":"u-1","type":"upgrade","version":"v1.30.0"}"#,
            )
            .unwrap();
            assert_eq!(job.job_type, JobType::Upgrade);
            assert_eq!(job.version.as_deref(), Some("v1.30.0"));
        }

        #[test]
        fn unknown_types_parse_as_unknown() {
            let job = ClusterJob::parse(
                r#"{"cluster_id":"c-1","user_id":"u-1","type":"hibernate"}"#,
            )
            .unwrap();
            assert_eq!(job.job_type, JobType::Unknown);
        }

        #[test]
        fn malformed_payload_is_serialization_error() {
            let err = ClusterJob::parse("{not json").unwrap_err();
            assert!(matches!(err, Error::Serialization { .. }));
            let err = ClusterJob::parse(r#"{"user_id":"u","type":"provision"}"#).unwrap_err();
            assert!(err.to_string().contains("cluster_id"));
        }

        #[test]
        fn payload_uses_type_key_on_the_wire() {
            let mut job = ClusterJob::new("c-1", "u-1", JobType::Restore);
            job.backup_path = Some("c-1/snapshot-1.db".to_string());
            let payload = job.to_payload().unwrap();
            assert!(payload.contains(r#""type":"restore""#));
            assert!(!payload.contains("version"));
            assert_eq!(ClusterJob::parse(&payload).unwrap(), job);
        }
    }

    mod invariants {
        use super::*;

        #[test]
        fn running_requires_control_plane_ip() {
            let mut c = sample();
            c.status = ClusterStatus::Running;
            assert!(c.check_invariants(1).is_err());
            c.control_plane_ips.push("10.0.0.2".to_string());
            assert!(c.check_invariants(1).is_ok());
        }

        #[test]
        fn ha_running_requires_three_nodes_and_lb() {
            let mut c = sample();
            c.ha_enabled = true;
            c.status = ClusterStatus::Running;
            c.control_plane_ips = vec!["a".into(), "b".into(), "c".into()];
            assert!(c.check_invariants(3).is_err());
            c.api_server_lb_address = Some("10.0.9.9".to_string());
            assert!(c.check_invariants(2).is_err());
            assert!(c.check_invariants(3).is_ok());
        }

        #[test]
        fn terminal_status_must_not_hold_a_job() {
            let mut c = sample();
            c.status = ClusterStatus::Failed;
            c.job_id = Some("j".to_string());
            assert!(c.check_invariants(0).is_err());
        }

        #[test]
        fn pending_cluster_has_no_requirements() {
            assert!(sample().check_invariants(0).is_ok());
        }
    }

    #[test]
    fn resource_names_follow_cluster_name() {
        let c = sample();
        assert_eq!(c.security_group_name(), "sg-dev");
        assert_eq!(c.load_balancer_name(), "lb-k8s-dev");
    }

    #[test]
    fn api_host_prefers_lb_for_ha() {
        let mut c = sample();
        c.control_plane_ips = vec!["10.0.0.2".to_string()];
        assert_eq!(c.api_host(), Some("10.0.0.2"));
        c.api_server_lb_address = Some("10.0.9.9".to_string());
        assert_eq!(c.api_host(), Some("10.0.0.2"));
        c.ha_enabled = true;
        assert_eq!(c.api_host(), Some("10.0.9.9"));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ClusterStatus::Provisioning).unwrap(),
            r#""provisioning""#
        );
        assert_eq!(
            serde_json::to_string(&NodeRole::ControlPlane).unwrap(),
            r#""control-plane""#
        );
        assert!(ClusterStatus::Running.is_terminal());
        assert!(!ClusterStatus::Deleting.is_terminal());
    }

    #[test]
    fn live_workers_exclude_failed_rows() {
        let mut n = ClusterNode::new("c", "i", "dev-worker-0", NodeRole::Worker);
        assert!(n.is_live_worker());
        n.status = NodeStatus::Failed;
        assert!(!n.is_live_worker());
        let cp = ClusterNode::new("c", "i", "dev-master-0", NodeRole::ControlPlane);
        assert!(!cp.is_live_worker());
    }

    #[test]
    fn health_is_healthy_only_when_everything_ready() {
        let mut h = ClusterHealth {
            api_server: true,
            nodes_total: 3,
            nodes_ready: 3,
            ..Default::default()
        };
        assert!(h.is_healthy());
        h.nodes_ready = 2;
        assert!(!h.is_healthy());
        h.nodes_ready = 3;
        h.api_server = false;
        assert!(!h.is_healthy());
    }
}
