//! Contracts for the platform services the controller drives
//!
//! Every collaborator is an `async_trait` object held as `Arc<dyn Trait>` so
//! production clients, the in-memory backends in [`crate::memory`] and
//! mockall doubles are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::redact::Sensitive;
use crate::Result;

/// A compute instance as reported by the backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Instance {
    /// Backend identifier
    pub id: String,
    /// Instance name
    pub name: String,
    /// Private address, possibly in CIDR form (`10.0.0.4/24`); unset until allocated
    #[serde(default)]
    pub private_ip: Option<String>,
}

/// Parameters for launching an instance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Instance name
    pub name: String,
    /// Machine image
    pub image: String,
    /// Ports the instance exposes
    pub ports: Vec<u16>,
    /// Virtual network
    pub vpc_id: String,
    /// Subnet, backend default when unset
    pub subnet_id: Option<String>,
    /// Volumes to attach
    pub volumes: Vec<String>,
}

/// Traffic direction for a security rule
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Inbound
    Ingress,
    /// Outbound
    Egress,
}

/// Transport protocol for a security rule
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

/// A directional traffic rule
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct SecurityRule {
    /// Inbound or outbound
    pub direction: Direction,
    /// TCP or UDP
    pub protocol: Protocol,
    /// First port of the range
    pub port_from: u16,
    /// Last port of the range (inclusive)
    pub port_to: u16,
    /// Source or destination CIDR
    pub cidr: String,
    /// Evaluation priority
    pub priority: u32,
}

/// A security group
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SecurityGroup {
    /// Backend identifier
    pub id: String,
    /// Group name
    pub name: String,
    /// Virtual network the group belongs to
    pub vpc_id: String,
}

/// Load-balancing algorithm
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LbAlgorithm {
    /// Rotate across targets
    #[default]
    RoundRobin,
}

/// Parameters for creating an L4 load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateLoadBalancer {
    /// Balancer name
    pub name: String,
    /// Virtual network
    pub vpc_id: String,
    /// Listener port
    pub port: u16,
    /// Balancing algorithm
    pub algorithm: LbAlgorithm,
    /// Repeated creates with the same key return the same balancer
    pub idempotency_key: String,
}

/// An L4 load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Backend identifier
    pub id: String,
    /// Balancer name
    pub name: String,
    /// Virtual network
    pub vpc_id: String,
    /// Listener port
    pub port: u16,
    /// Assigned address; unset until the backend allocates one
    #[serde(default)]
    pub ip: Option<String>,
}

/// Metadata of a stored object
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Upload time
    pub uploaded_at: DateTime<Utc>,
}

/// Compute backend: instances and in-engine exec
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Launch an instance
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<Instance>;

    /// Terminate an instance by id or name
    async fn terminate_instance(&self, id_or_name: &str) -> Result<()>;

    /// Look up an instance by id or name
    async fn get_instance(&self, id_or_name: &str) -> Result<Instance>;

    /// Run argv inside the instance and return stdout
    async fn exec(&self, instance_id: &str, argv: &[String]) -> Result<String>;

    /// Console / boot logs of the instance
    async fn get_instance_logs(&self, instance_id: &str) -> Result<String>;
}

/// Virtual firewall
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecurityGroupService: Send + Sync {
    /// Find a group by name within a VPC
    async fn get_group(&self, vpc_id: &str, name: &str) -> Result<Option<SecurityGroup>>;

    /// Create an empty group
    async fn create_group(&self, vpc_id: &str, name: &str) -> Result<SecurityGroup>;

    /// Add a rule to a group
    async fn add_rule(&self, group_id: &str, rule: &SecurityRule) -> Result<()>;

    /// Apply a group to an instance
    async fn attach_to_instance(&self, group_id: &str, instance_id: &str) -> Result<()>;

    /// Delete a group
    async fn delete_group(&self, group_id: &str) -> Result<()>;
}

/// L4 load balancer service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerService: Send + Sync {
    /// All balancers in a VPC
    async fn list(&self, vpc_id: &str) -> Result<Vec<LoadBalancer>>;

    /// Create a balancer (idempotent on `idempotency_key`)
    async fn create(&self, request: &CreateLoadBalancer) -> Result<LoadBalancer>;

    /// Register an instance as a target
    async fn add_target(&self, lb_id: &str, instance_id: &str, port: u16, weight: u32)
        -> Result<()>;

    /// Look up a balancer
    async fn get(&self, lb_id: &str) -> Result<LoadBalancer>;

    /// Delete a balancer
    async fn delete(&self, lb_id: &str) -> Result<()>;
}

/// Object storage, scoped per user
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object
    async fn upload(&self, user_id: &str, bucket: &str, key: &str, data: Vec<u8>)
        -> Result<ObjectInfo>;

    /// Fetch an object
    async fn download(&self, user_id: &str, bucket: &str, key: &str)
        -> Result<(Vec<u8>, ObjectInfo)>;
}

/// The only encryption authority for kubeconfigs and SSH keys
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretsService: Send + Sync {
    /// Encrypt plaintext for a user
    async fn encrypt(&self, user_id: &str, plaintext: &str) -> Result<String>;

    /// Decrypt ciphertext produced by [`SecretsService::encrypt`] for the same user
    async fn decrypt(&self, user_id: &str, ciphertext: &str) -> Result<Sensitive>;
}

/// Task queue carrying serialized jobs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Pop the next payload, `None` when idle
    async fn dequeue(&self, queue: &str) -> Result<Option<String>>;
}
