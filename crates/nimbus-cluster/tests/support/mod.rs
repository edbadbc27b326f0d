//! Shared harness for the lifecycle scenarios
//!
//! The provisioner runs for real against the in-memory backends. Nodes are
//! played by [`NodeSim`], which answers the commands a kubeadm node would
//! (init output, join commands, admin.conf, `kubectl get nodes`, etcd
//! snapshots) and records everything it was asked to run.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use nimbus_cluster::{Context, Provisioner, ProvisionerConfig};
use nimbus_common::memory::{
    LocalSecrets, MemCompute, MemLoadBalancers, MemObjectStore, MemSecurityGroups,
};
use nimbus_common::retry::RetryConfig;
use nimbus_common::{
    Cluster, ClusterNode, ClusterStore, ComputeBackend, Error, MemClusterStore, Result,
};
use nimbus_executor::{ExecutorResolver, NodeExecutor};
use parking_lot::Mutex;

pub const USER: &str = "u-7f3c";
pub const VPC: &str = "vpc-main";

/// Bytes every simulated etcd snapshot contains
pub fn snapshot_bytes() -> Vec<u8> {
    (0..=255u8).cycle().take(1024).collect()
}

pub const KUBE_PROXY_CONF: &str = "apiVersion: kubeproxy.config.k8s.io/v1alpha1
kind: KubeProxyConfiguration
conntrack:
  maxPerCore: null
  tcpCloseWaitTimeout: 1h0m0s
mode: \"\"
";

#[derive(Default)]
struct SimState {
    calls: Vec<(String, String)>,
    failures: Vec<(Option<String>, String)>,
    api_host: Option<String>,
    api_down: bool,
    joined: Vec<String>,
    kube_proxy_patch: Option<String>,
    files: HashMap<String, Vec<u8>>,
}

/// Simulated kubeadm nodes, keyed by address
#[derive(Clone, Default)]
pub struct NodeSim {
    state: Arc<Mutex<SimState>>,
}

impl NodeSim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail commands containing `pattern` on every node
    pub fn fail(&self, pattern: &str) {
        self.state.lock().failures.push((None, pattern.to_string()));
    }

    /// Fail commands containing `pattern` on the node at `ip`
    pub fn fail_on(&self, ip: &str, pattern: &str) {
        self.state
            .lock()
            .failures
            .push((Some(ip.to_string()), pattern.to_string()));
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Make `kubectl get nodes` fail as if the API server were down
    pub fn set_api_down(&self, down: bool) {
        self.state.lock().api_down = down;
    }

    /// Every `(ip, command)` run so far
    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().calls.clone()
    }

    /// Commands containing `pattern`, with the address they ran on
    pub fn calls_matching(&self, pattern: &str) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter(|(_, cmd)| cmd.contains(pattern))
            .collect()
    }

    /// Number of commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.calls_matching(pattern).len()
    }

    /// The last kube-proxy JSON patch written to a node
    pub fn kube_proxy_patch(&self) -> Option<String> {
        self.state.lock().kube_proxy_patch.clone()
    }

    /// Content written to `path` through `base64 -d`
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    fn handle(&self, ip: &str, command: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.calls.push((ip.to_string(), command.to_string()));

        let injected = state.failures.iter().any(|(on, pattern)| {
            on.as_deref().map_or(true, |on| on == ip) && command.contains(pattern.as_str())
        });
        if injected {
            return Err(Error::executor_with_output(ip, "injected failure", "exit status 1"));
        }
        if state.api_down && command.contains("get nodes") {
            return Err(Error::executor_with_output(
                ip,
                "exit status 1",
                "The connection to the server was refused",
            ));
        }

        if command.contains("kubeadm init") {
            let endpoint = flag_value(command, "--control-plane-endpoint=")
                .map(|ep| ep.trim_end_matches(":6443").to_string());
            state.api_host = Some(endpoint.clone().unwrap_or_else(|| ip.to_string()));
            state.joined.push(ip.to_string());
            let host = state.api_host.clone().unwrap_or_default();
            return Ok(init_output(&host, endpoint.is_some()));
        }
        if command.contains("kubeadm join") {
            state.joined.push(ip.to_string());
            return Ok("This node has joined the cluster".to_string());
        }
        if command.contains("kubeadm token create") {
            let host = state.api_host.clone().unwrap_or_else(|| ip.to_string());
            return Ok(format!(
                "kubeadm join {host}:6443 --token fresh.0123456789abcdef --discovery-token-ca-cert-hash sha256:feedface\n"
            ));
        }
        if command.contains("cat /etc/kubernetes/admin.conf") {
            let host = state.api_host.clone().unwrap_or_else(|| ip.to_string());
            return Ok(admin_conf(&format!("https://{host}:6443")));
        }
        if command.contains("get --raw=/healthz") {
            return Ok("ok".to_string());
        }
        if command.contains("get nodes --no-headers") {
            let lines: Vec<String> = state
                .joined
                .iter()
                .enumerate()
                .map(|(i, ip)| format!("node-{i}   Ready   <none>   1m   v1.29.0   {ip}"))
                .collect();
            return Ok(lines.join("\n"));
        }
        if command.contains("get configmap kube-proxy") {
            return Ok(KUBE_PROXY_CONF.to_string());
        }
        if command.contains("base64 -w 0 /tmp/snapshot-") {
            return Ok(STANDARD.encode(snapshot_bytes()));
        }
        if let Some((content, path)) = echo_write(command) {
            if path == "/tmp/kube-proxy-patch.json" {
                state.kube_proxy_patch = String::from_utf8(content.clone()).ok();
            }
            state.files.insert(path, content);
            return Ok(String::new());
        }
        if let Some((staging, chunk)) = printf_append(command) {
            state
                .files
                .entry(staging)
                .or_default()
                .extend_from_slice(chunk.as_bytes());
            return Ok(String::new());
        }
        if let Some((staging, path)) = staged_decode(command) {
            let encoded = state.files.remove(&staging).unwrap_or_default();
            let decoded = STANDARD
                .decode(encoded)
                .map_err(|e| Error::executor(ip, e.to_string()))?;
            state.files.insert(path, decoded);
            return Ok(String::new());
        }
        Ok(String::new())
    }
}

fn flag_value<'a>(command: &'a str, flag: &str) -> Option<&'a str> {
    command
        .split_whitespace()
        .find_map(|part| part.strip_prefix(flag))
}

/// `echo '<b64>' | base64 -d > <path>`
fn echo_write(command: &str) -> Option<(Vec<u8>, String)> {
    let rest = command.strip_prefix("echo '")?;
    let (encoded, tail) = rest.split_once('\'')?;
    let path = tail.trim().strip_prefix("| base64 -d >")?.trim().to_string();
    Some((STANDARD.decode(encoded).ok()?, path))
}

/// `printf '%s' '<chunk>' >> <staging>`
fn printf_append(command: &str) -> Option<(String, String)> {
    let rest = command.strip_prefix("printf '%s' '")?;
    let (chunk, tail) = rest.split_once('\'')?;
    let staging = tail.trim().strip_prefix(">>")?.trim().to_string();
    Some((staging, chunk.to_string()))
}

/// `base64 -d <staging> > <path> && rm -f <staging>`
fn staged_decode(command: &str) -> Option<(String, String)> {
    let rest = command.strip_prefix("base64 -d ")?;
    let (staging, tail) = rest.split_once(" > ")?;
    let path = tail.split("&&").next()?.trim().to_string();
    Some((staging.trim().to_string(), path))
}

pub fn init_output(host: &str, with_control_plane: bool) -> String {
    let mut out = String::from(
        "Your Kubernetes control-plane has initialized successfully!\n\n\
         To start using your cluster, you need to run the following as a regular user:\n\n",
    );
    if with_control_plane {
        out.push_str(&format!(
            "You can now join any number of control-plane nodes by running the following command on each as root:\n\n  \
             kubeadm join {host}:6443 --token abcdef.0123456789abcdef \\\n\t\
             --discovery-token-ca-cert-hash sha256:deadbeef \\\n\t\
             --control-plane --certificate-key 0a1b2c3d\n\n"
        ));
    }
    out.push_str(&format!(
        "Then you can join any number of worker nodes by running the following on each as root:\n\n\
         kubeadm join {host}:6443 --token abcdef.0123456789abcdef \\\n\t\
         --discovery-token-ca-cert-hash sha256:deadbeef\n\n"
    ));
    out
}

pub fn admin_conf(server: &str) -> String {
    format!(
        "apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTi0tLS0t
    server: {server}
  name: kubernetes
contexts:
- context:
    cluster: kubernetes
    user: kubernetes-admin
  name: kubernetes-admin@kubernetes
current-context: kubernetes-admin@kubernetes
users:
- name: kubernetes-admin
  user:
    client-certificate-data: LS0tLS1DRVJU
    client-key-data: LS0tLS1LRVk=
"
    )
}

struct SimExecutor {
    ip: String,
    sim: NodeSim,
}

#[async_trait]
impl NodeExecutor for SimExecutor {
    async fn run(&self, command: &str) -> Result<String> {
        self.sim.handle(&self.ip, command)
    }

    async fn wait_for_ready(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn target(&self) -> String {
        self.ip.clone()
    }
}

#[async_trait]
impl ExecutorResolver for NodeSim {
    async fn resolve(&self, _cluster: &Cluster, ip: &str) -> Result<Arc<dyn NodeExecutor>> {
        Ok(Arc::new(SimExecutor {
            ip: ip.to_string(),
            sim: self.clone(),
        }))
    }
}

/// Timings shrunk to zero so scenarios run instantly
pub fn fast_config() -> ProvisionerConfig {
    let instant = |attempts| RetryConfig::fixed(attempts, Duration::ZERO).without_jitter();
    ProvisionerConfig {
        ip_wait_timeout: Duration::from_secs(1),
        ip_poll_interval: Duration::ZERO,
        node_ready_timeout: Duration::from_secs(1),
        api_health_timeout: Duration::from_secs(1),
        api_health_poll_interval: Duration::ZERO,
        poll_jitter: 0.0,
        join_retry: instant(3),
        cni_retry: instant(3),
        lb_address_retry: instant(10),
        ..ProvisionerConfig::default()
    }
}

/// Provisioner over in-memory backends and a [`NodeSim`]
pub struct Harness {
    pub store: Arc<MemClusterStore>,
    pub compute: Arc<MemCompute>,
    pub security_groups: Arc<MemSecurityGroups>,
    pub load_balancers: Arc<MemLoadBalancers>,
    pub objects: Arc<MemObjectStore>,
    pub secrets: Arc<LocalSecrets>,
    pub sim: NodeSim,
    pub provisioner: Provisioner,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemClusterStore::new());
        let compute = Arc::new(MemCompute::new());
        let security_groups = Arc::new(MemSecurityGroups::new());
        let load_balancers = Arc::new(MemLoadBalancers::new());
        let objects = Arc::new(MemObjectStore::new());
        let secrets = Arc::new(LocalSecrets::new().expect("secrets key"));
        let sim = NodeSim::new();

        let ctx = Context::builder()
            .store(store.clone())
            .compute(compute.clone())
            .security_groups(security_groups.clone())
            .load_balancers(load_balancers.clone())
            .objects(objects.clone())
            .secrets(secrets.clone())
            .executors(Arc::new(sim.clone()))
            .config(fast_config())
            .build()
            .expect("context");

        Self {
            store,
            compute,
            security_groups,
            load_balancers,
            objects,
            secrets,
            sim,
            provisioner: Provisioner::new(Arc::new(ctx)),
        }
    }

    /// Store a pending cluster and return it
    pub async fn create_cluster(&self, name: &str, workers: u32, ha: bool) -> Cluster {
        let mut cluster = Cluster::new(USER, name, VPC, "v1.29.0", workers);
        cluster.ha_enabled = ha;
        self.store.create_cluster(&cluster).await.expect("create cluster");
        cluster
    }

    /// Store and provision a cluster, asserting success
    pub async fn running_cluster(&self, name: &str, workers: u32, ha: bool) -> Cluster {
        let cluster = self.create_cluster(name, workers, ha).await;
        self.provisioner
            .provision(&cluster.id)
            .await
            .expect("provision");
        self.cluster(&cluster.id).await
    }

    pub async fn cluster(&self, id: &str) -> Cluster {
        self.store.get_cluster(id).await.expect("cluster row")
    }

    pub async fn nodes(&self, id: &str) -> Vec<ClusterNode> {
        self.store.list_nodes(id).await.expect("node rows")
    }

    /// Current address of a node
    pub async fn ip_of(&self, node: &ClusterNode) -> String {
        let instance = self
            .compute
            .get_instance(&node.instance_id)
            .await
            .expect("instance");
        instance
            .private_ip
            .map(|ip| nimbus_executor::strip_cidr(&ip).to_string())
            .expect("address")
    }
}
