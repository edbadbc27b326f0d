//! In-memory backends for every collaborator
//!
//! Used by the test suites and by the sandbox binary. They keep enough state
//! for assertions (launched instances, LB targets, uploaded objects) and are
//! deliberately simple: addresses are allocated lazily on the first lookup so
//! callers exercise their wait loops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::redact::Sensitive;
use crate::services::{
    ComputeBackend, CreateLoadBalancer, Instance, LaunchRequest, LoadBalancer,
    LoadBalancerService, ObjectInfo, ObjectStore, SecretsService, SecurityGroup,
    SecurityGroupService, SecurityRule, TaskQueue,
};
use crate::{Error, Result};

// =============================================================================
// Task queue
// =============================================================================

/// FIFO queues keyed by name
#[derive(Default)]
pub struct MemTaskQueue {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemTaskQueue {
    /// Create an empty queue set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload to a queue
    pub fn push(&self, queue: &str, payload: impl Into<String>) {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.into());
    }

    /// Payloads still waiting in a queue
    pub fn len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    /// True when a queue has nothing waiting
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

#[async_trait]
impl TaskQueue for MemTaskQueue {
    async fn dequeue(&self, queue: &str) -> Result<Option<String>> {
        Ok(self
            .queues
            .lock()
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }
}

// =============================================================================
// Compute
// =============================================================================

/// Handler for in-engine exec calls: `(instance, argv) -> stdout`
pub type ExecHandler = Arc<dyn Fn(&Instance, &[String]) -> Result<String> + Send + Sync>;

/// Instances held in memory
#[derive(Default)]
pub struct MemCompute {
    instances: Mutex<Vec<Instance>>,
    launched: Mutex<Vec<LaunchRequest>>,
    terminated: Mutex<Vec<String>>,
    next_id: AtomicU32,
    next_ip: AtomicU32,
    exec_handler: Option<ExecHandler>,
}

impl MemCompute {
    /// Create a backend whose exec calls succeed with empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Route exec calls through a handler
    pub fn with_exec_handler(mut self, handler: ExecHandler) -> Self {
        self.exec_handler = Some(handler);
        self
    }

    /// Instances that are currently running
    pub fn instances(&self) -> Vec<Instance> {
        self.instances.lock().clone()
    }

    /// Every launch request received, in order
    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.launched.lock().clone()
    }

    /// Ids of terminated instances, in order
    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }

    fn allocate_ip(&self) -> String {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        format!("10.0.{}.{}/24", n / 250, n % 250 + 2)
    }

    fn find<'a>(instances: &'a mut [Instance], id_or_name: &str) -> Option<&'a mut Instance> {
        instances
            .iter_mut()
            .find(|i| i.id == id_or_name || i.name == id_or_name)
    }
}

#[async_trait]
impl ComputeBackend for MemCompute {
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<Instance> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let instance = Instance {
            id: format!("i-{n:06}"),
            name: request.name.clone(),
            private_ip: None,
        };
        self.launched.lock().push(request.clone());
        self.instances.lock().push(instance.clone());
        Ok(instance)
    }

    async fn terminate_instance(&self, id_or_name: &str) -> Result<()> {
        let mut instances = self.instances.lock();
        let pos = instances
            .iter()
            .position(|i| i.id == id_or_name || i.name == id_or_name)
            .ok_or_else(|| Error::not_found("instance", id_or_name))?;
        let removed = instances.remove(pos);
        self.terminated.lock().push(removed.id);
        Ok(())
    }

    async fn get_instance(&self, id_or_name: &str) -> Result<Instance> {
        let mut instances = self.instances.lock();
        let instance = Self::find(&mut instances, id_or_name)
            .ok_or_else(|| Error::not_found("instance", id_or_name))?;
        if instance.private_ip.is_none() {
            instance.private_ip = Some(self.allocate_ip());
        }
        Ok(instance.clone())
    }

    async fn exec(&self, instance_id: &str, argv: &[String]) -> Result<String> {
        let instance = {
            let mut instances = self.instances.lock();
            Self::find(&mut instances, instance_id)
                .map(|i| i.clone())
                .ok_or_else(|| Error::not_found("instance", instance_id))?
        };
        match &self.exec_handler {
            Some(handler) => handler(&instance, argv),
            None => Ok(String::new()),
        }
    }

    async fn get_instance_logs(&self, instance_id: &str) -> Result<String> {
        let instances = self.instances.lock();
        let instance = instances
            .iter()
            .find(|i| i.id == instance_id || i.name == instance_id)
            .ok_or_else(|| Error::not_found("instance", instance_id))?;
        Ok(format!(
            "cloud-init: {} boot finished\nsystemd: reached target multi-user\n",
            instance.name
        ))
    }
}

// =============================================================================
// Security groups
// =============================================================================

struct GroupRecord {
    group: SecurityGroup,
    rules: Vec<SecurityRule>,
    attached: Vec<String>,
}

/// Security groups held in memory. Creating a duplicate name in a VPC fails.
#[derive(Default)]
pub struct MemSecurityGroups {
    groups: Mutex<Vec<GroupRecord>>,
    next_id: AtomicU32,
}

impl MemSecurityGroups {
    /// Create an empty service
    pub fn new() -> Self {
        Self::default()
    }

    /// Every group
    pub fn groups(&self) -> Vec<SecurityGroup> {
        self.groups.lock().iter().map(|r| r.group.clone()).collect()
    }

    /// Rules of a group
    pub fn rules(&self, group_id: &str) -> Vec<SecurityRule> {
        self.groups
            .lock()
            .iter()
            .find(|r| r.group.id == group_id)
            .map(|r| r.rules.clone())
            .unwrap_or_default()
    }

    /// Instances a group is attached to
    pub fn attachments(&self, group_id: &str) -> Vec<String> {
        self.groups
            .lock()
            .iter()
            .find(|r| r.group.id == group_id)
            .map(|r| r.attached.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SecurityGroupService for MemSecurityGroups {
    async fn get_group(&self, vpc_id: &str, name: &str) -> Result<Option<SecurityGroup>> {
        Ok(self
            .groups
            .lock()
            .iter()
            .find(|r| r.group.vpc_id == vpc_id && r.group.name == name)
            .map(|r| r.group.clone()))
    }

    async fn create_group(&self, vpc_id: &str, name: &str) -> Result<SecurityGroup> {
        let mut groups = self.groups.lock();
        if groups
            .iter()
            .any(|r| r.group.vpc_id == vpc_id && r.group.name == name)
        {
            return Err(Error::provider_permanent(
                name,
                "security-group",
                format!("group {name} already exists in {vpc_id}"),
            ));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let group = SecurityGroup {
            id: format!("sg-{n:06}"),
            name: name.to_string(),
            vpc_id: vpc_id.to_string(),
        };
        groups.push(GroupRecord {
            group: group.clone(),
            rules: Vec::new(),
            attached: Vec::new(),
        });
        Ok(group)
    }

    async fn add_rule(&self, group_id: &str, rule: &SecurityRule) -> Result<()> {
        let mut groups = self.groups.lock();
        let record = groups
            .iter_mut()
            .find(|r| r.group.id == group_id)
            .ok_or_else(|| Error::not_found("security group", group_id))?;
        record.rules.push(rule.clone());
        Ok(())
    }

    async fn attach_to_instance(&self, group_id: &str, instance_id: &str) -> Result<()> {
        let mut groups = self.groups.lock();
        let record = groups
            .iter_mut()
            .find(|r| r.group.id == group_id)
            .ok_or_else(|| Error::not_found("security group", group_id))?;
        if !record.attached.iter().any(|i| i == instance_id) {
            record.attached.push(instance_id.to_string());
        }
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        let mut groups = self.groups.lock();
        let before = groups.len();
        groups.retain(|r| r.group.id != group_id);
        if groups.len() == before {
            return Err(Error::not_found("security group", group_id));
        }
        Ok(())
    }
}

// =============================================================================
// Load balancers
// =============================================================================

/// A registered LB target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LbTarget {
    /// Target instance
    pub instance_id: String,
    /// Target port
    pub port: u16,
    /// Weight
    pub weight: u32,
}

struct LbRecord {
    lb: LoadBalancer,
    idempotency_key: String,
    targets: Vec<LbTarget>,
}

/// Load balancers held in memory; the address is assigned on the first `get`
#[derive(Default)]
pub struct MemLoadBalancers {
    balancers: Mutex<Vec<LbRecord>>,
    next_id: AtomicU32,
    created: AtomicU32,
}

impl MemLoadBalancers {
    /// Create an empty service
    pub fn new() -> Self {
        Self::default()
    }

    /// Every balancer
    pub fn balancers(&self) -> Vec<LoadBalancer> {
        self.balancers.lock().iter().map(|r| r.lb.clone()).collect()
    }

    /// Targets registered on a balancer
    pub fn targets(&self, lb_id: &str) -> Vec<LbTarget> {
        self.balancers
            .lock()
            .iter()
            .find(|r| r.lb.id == lb_id)
            .map(|r| r.targets.clone())
            .unwrap_or_default()
    }

    /// Number of balancers actually created (idempotent replays excluded)
    pub fn create_count(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoadBalancerService for MemLoadBalancers {
    async fn list(&self, vpc_id: &str) -> Result<Vec<LoadBalancer>> {
        Ok(self
            .balancers
            .lock()
            .iter()
            .filter(|r| r.lb.vpc_id == vpc_id)
            .map(|r| r.lb.clone())
            .collect())
    }

    async fn create(&self, request: &CreateLoadBalancer) -> Result<LoadBalancer> {
        let mut balancers = self.balancers.lock();
        if let Some(existing) = balancers
            .iter()
            .find(|r| r.idempotency_key == request.idempotency_key)
        {
            return Ok(existing.lb.clone());
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let lb = LoadBalancer {
            id: format!("lb-{n:06}"),
            name: request.name.clone(),
            vpc_id: request.vpc_id.clone(),
            port: request.port,
            ip: None,
        };
        balancers.push(LbRecord {
            lb: lb.clone(),
            idempotency_key: request.idempotency_key.clone(),
            targets: Vec::new(),
        });
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(lb)
    }

    async fn add_target(
        &self,
        lb_id: &str,
        instance_id: &str,
        port: u16,
        weight: u32,
    ) -> Result<()> {
        let mut balancers = self.balancers.lock();
        let record = balancers
            .iter_mut()
            .find(|r| r.lb.id == lb_id)
            .ok_or_else(|| Error::not_found("load balancer", lb_id))?;
        record.targets.push(LbTarget {
            instance_id: instance_id.to_string(),
            port,
            weight,
        });
        Ok(())
    }

    async fn get(&self, lb_id: &str) -> Result<LoadBalancer> {
        let mut balancers = self.balancers.lock();
        let index = balancers.iter().position(|r| r.lb.id == lb_id);
        let record = index
            .and_then(|i| balancers.get_mut(i))
            .ok_or_else(|| Error::not_found("load balancer", lb_id))?;
        if record.lb.ip.is_none() {
            let octet = index.unwrap_or_default() % 250 + 2;
            record.lb.ip = Some(format!("10.0.250.{octet}"));
        }
        Ok(record.lb.clone())
    }

    async fn delete(&self, lb_id: &str) -> Result<()> {
        let mut balancers = self.balancers.lock();
        let before = balancers.len();
        balancers.retain(|r| r.lb.id != lb_id);
        if balancers.len() == before {
            return Err(Error::not_found("load balancer", lb_id));
        }
        Ok(())
    }
}

// =============================================================================
// Object store
// =============================================================================

type ObjectKey = (String, String, String);

/// Objects held in memory, scoped by user id
#[derive(Default)]
pub struct MemObjectStore {
    objects: Mutex<HashMap<ObjectKey, (Vec<u8>, ObjectInfo)>>,
    uploads: Mutex<Vec<(String, String)>>,
    downloads: Mutex<Vec<(String, String)>>,
}

impl MemObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// `(bucket, key)` of every upload, in order
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().clone()
    }

    /// `(bucket, key)` of every download, in order
    pub fn downloads(&self) -> Vec<(String, String)> {
        self.downloads.lock().clone()
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn upload(
        &self,
        user_id: &str,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
    ) -> Result<ObjectInfo> {
        let info = ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: data.len() as u64,
            uploaded_at: Utc::now(),
        };
        self.objects.lock().insert(
            (user_id.to_string(), bucket.to_string(), key.to_string()),
            (data, info.clone()),
        );
        self.uploads
            .lock()
            .push((bucket.to_string(), key.to_string()));
        Ok(info)
    }

    async fn download(
        &self,
        user_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(Vec<u8>, ObjectInfo)> {
        self.downloads
            .lock()
            .push((bucket.to_string(), key.to_string()));
        self.objects
            .lock()
            .get(&(user_id.to_string(), bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("object", format!("{bucket}/{key}")))
    }
}

// =============================================================================
// Secrets
// =============================================================================

/// AES-256-GCM secrets service with a process-local key.
///
/// Ciphertext is `base64(nonce || sealed)`, the user id is bound as AAD so a
/// value encrypted for one user does not decrypt for another.
pub struct LocalSecrets {
    key: LessSafeKey,
}

impl LocalSecrets {
    /// Create a service with a fresh random key
    pub fn new() -> Result<Self> {
        let mut raw = Zeroizing::new([0u8; 32]);
        aws_lc_rs::rand::fill(&mut raw[..])
            .map_err(|_| Error::crypto("failed to generate data key"))?;
        Self::from_key(&raw[..])
    }

    /// Create a service from a 32-byte key
    pub fn from_key(key: &[u8]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| Error::crypto("data key must be 32 bytes"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }
}

#[async_trait]
impl SecretsService for LocalSecrets {
    async fn encrypt(&self, user_id: &str, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        aws_lc_rs::rand::fill(&mut nonce_bytes)
            .map_err(|_| Error::crypto("failed to generate nonce"))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(user_id.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| Error::crypto("seal failed"))?;

        let mut envelope = nonce_bytes.to_vec();
        envelope.extend_from_slice(&in_out);
        Ok(STANDARD.encode(envelope))
    }

    async fn decrypt(&self, user_id: &str, ciphertext: &str) -> Result<Sensitive> {
        let envelope = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| Error::crypto(format!("ciphertext is not base64: {e}")))?;
        if envelope.len() < NONCE_LEN {
            return Err(Error::crypto("ciphertext too short"));
        }
        let (nonce_bytes, sealed) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::crypto("invalid nonce"))?;

        let mut in_out = Zeroizing::new(sealed.to_vec());
        let plain = self
            .key
            .open_in_place(nonce, Aad::from(user_id.as_bytes()), &mut in_out[..])
            .map_err(|_| Error::crypto("authentication failed"))?;
        let text = std::str::from_utf8(plain)
            .map_err(|_| Error::crypto("plaintext is not UTF-8"))?;
        Ok(Sensitive::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_is_fifo_per_name() {
        let q = MemTaskQueue::new();
        q.push("k8s_jobs", "a");
        q.push("k8s_jobs", "b");
        q.push("other", "x");
        assert_eq!(q.dequeue("k8s_jobs").await.unwrap().as_deref(), Some("a"));
        assert_eq!(q.dequeue("k8s_jobs").await.unwrap().as_deref(), Some("b"));
        assert_eq!(q.dequeue("k8s_jobs").await.unwrap(), None);
        assert_eq!(q.len("other"), 1);
    }

    #[tokio::test]
    async fn compute_allocates_ip_on_first_lookup() {
        let compute = MemCompute::new();
        let inst = compute
            .launch_instance(&LaunchRequest {
                name: "dev-master-0".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(inst.private_ip.is_none());

        let got = compute.get_instance("dev-master-0").await.unwrap();
        let ip = got.private_ip.unwrap();
        assert!(ip.ends_with("/24"));
        assert_eq!(
            compute.get_instance(&inst.id).await.unwrap().private_ip.unwrap(),
            ip
        );

        compute.terminate_instance(&inst.id).await.unwrap();
        assert_eq!(compute.terminated(), vec![inst.id.clone()]);
        assert!(compute.get_instance(&inst.id).await.is_err());
    }

    #[tokio::test]
    async fn compute_exec_uses_handler() {
        let compute = MemCompute::new().with_exec_handler(Arc::new(|inst, argv| {
            Ok(format!("{}:{}", inst.name, argv.join(" ")))
        }));
        compute
            .launch_instance(&LaunchRequest {
                name: "n1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let out = compute
            .exec("n1", &["echo".to_string(), "ready".to_string()])
            .await
            .unwrap();
        assert_eq!(out, "n1:echo ready");
    }

    #[tokio::test]
    async fn security_group_names_are_unique_per_vpc() {
        let sgs = MemSecurityGroups::new();
        let g = sgs.create_group("vpc-1", "sg-dev").await.unwrap();
        assert!(sgs.create_group("vpc-1", "sg-dev").await.is_err());
        assert!(sgs.create_group("vpc-2", "sg-dev").await.is_ok());
        assert_eq!(
            sgs.get_group("vpc-1", "sg-dev").await.unwrap().unwrap().id,
            g.id
        );
        sgs.attach_to_instance(&g.id, "i-1").await.unwrap();
        sgs.attach_to_instance(&g.id, "i-1").await.unwrap();
        assert_eq!(sgs.attachments(&g.id), vec!["i-1".to_string()]);
    }

    #[tokio::test]
    async fn load_balancer_create_is_idempotent() {
        let lbs = MemLoadBalancers::new();
        let req = CreateLoadBalancer {
            name: "lb-k8s-prod".into(),
            vpc_id: "vpc-1".into(),
            port: 6443,
            algorithm: Default::default(),
            idempotency_key: "c-1".into(),
        };
        let a = lbs.create(&req).await.unwrap();
        let b = lbs.create(&req).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(lbs.create_count(), 1);
        assert!(a.ip.is_none());
        assert!(lbs.get(&a.id).await.unwrap().ip.is_some());
    }

    #[tokio::test]
    async fn object_store_is_tenant_scoped() {
        let store = MemObjectStore::new();
        store
            .upload("u-1", "k8s-backups", "c/snapshot-1.db", vec![0, 1, 255])
            .await
            .unwrap();
        let (data, info) = store
            .download("u-1", "k8s-backups", "c/snapshot-1.db")
            .await
            .unwrap();
        assert_eq!(data, vec![0, 1, 255]);
        assert_eq!(info.size, 3);
        assert!(store
            .download("u-2", "k8s-backups", "c/snapshot-1.db")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn secrets_round_trip_and_bind_user() {
        let secrets = LocalSecrets::new().unwrap();
        let ct = secrets.encrypt("u-1", "apiVersion: v1").await.unwrap();
        assert!(!ct.contains("apiVersion"));

        let pt = secrets.decrypt("u-1", &ct).await.unwrap();
        assert_eq!(pt.expose(), "apiVersion: v1");

        let err = secrets.decrypt("u-2", &ct).await.unwrap_err();
        assert!(matches!(err, Error::Crypto { .. }));
        assert!(secrets.decrypt("u-1", "not base64!").await.is_err());
    }

    #[tokio::test]
    async fn secrets_use_fresh_nonces() {
        let secrets = LocalSecrets::new().unwrap();
        let a = secrets.encrypt("u", "same").await.unwrap();
        let b = secrets.encrypt("u", "same").await.unwrap();
        assert_ne!(a, b);
    }
}
