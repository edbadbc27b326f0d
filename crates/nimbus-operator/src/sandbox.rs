//! In-process sandbox
//!
//! Wires the provisioner to the in-memory backends of
//! `nimbus_common::memory`. Nodes are simulated by the compute backend's exec
//! handler, so commands still travel through the default executor resolver
//! and the in-engine transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use nimbus_cluster::{BusySet, Context, Provisioner, ProvisionerConfig, Reconciler};
use nimbus_common::memory::{
    ExecHandler, LocalSecrets, MemCompute, MemLoadBalancers, MemObjectStore, MemSecurityGroups,
    MemTaskQueue,
};
use nimbus_common::services::Instance;
use nimbus_common::{
    Cluster, ClusterJob, ClusterStore, Error, JobType, MemClusterStore, Result, API_SERVER_PORT,
};
use nimbus_executor::{strip_cidr, DefaultExecutorResolver, ExecutorConfig, READY_PROBE};
use parking_lot::Mutex;
use tracing::info;

use crate::worker::{JobWorker, WorkerConfig};

/// Owner recorded on clusters the sandbox seeds
pub const SANDBOX_USER: &str = "sandbox";

/// Network the sandbox seeds clusters into
pub const SANDBOX_VPC: &str = "vpc-sandbox";

/// Kubernetes version the sandbox seeds clusters with
pub const SANDBOX_VERSION: &str = "v1.29.0";

const KUBE_PROXY_CONF: &str = "apiVersion: kubeproxy.config.k8s.io/v1alpha1
kind: KubeProxyConfiguration
conntrack:
  maxPerCore: null
mode: \"\"
";

/// Canned kubeadm node behavior, keyed by node address
#[derive(Default)]
pub struct SimulatedNodes {
    api_hosts: Mutex<HashMap<String, String>>,
}

impl SimulatedNodes {
    /// Exec handler for [`MemCompute`]
    pub fn handler(self: Arc<Self>) -> ExecHandler {
        Arc::new(move |instance: &Instance, argv: &[String]| {
            let ip = instance
                .private_ip
                .as_deref()
                .map(strip_cidr)
                .unwrap_or(instance.name.as_str());
            let command = argv.last().map(String::as_str).unwrap_or_default();
            self.respond(ip, command)
        })
    }

    fn respond(&self, ip: &str, command: &str) -> Result<String> {
        if command == READY_PROBE {
            return Ok("ready\n".to_string());
        }
        if command.contains("kubeadm init") {
            let endpoint = command
                .split_whitespace()
                .find_map(|part| part.strip_prefix("--control-plane-endpoint="))
                .map(|ep| ep.trim_end_matches(&format!(":{API_SERVER_PORT}")).to_string());
            let host = endpoint.clone().unwrap_or_else(|| ip.to_string());
            self.api_hosts.lock().insert(ip.to_string(), host.clone());
            return Ok(init_output(&host, endpoint.is_some()));
        }
        if command.contains("kubeadm token create") {
            let host = self.api_host(ip);
            return Ok(format!(
                "kubeadm join {host}:{API_SERVER_PORT} --token sandbx.0123456789abcdef --discovery-token-ca-cert-hash sha256:5a4db0c\n"
            ));
        }
        if command.contains("cat /etc/kubernetes/admin.conf") {
            return Ok(admin_conf(&self.api_host(ip)));
        }
        if command.contains("get --raw=/healthz") {
            return Ok("ok".to_string());
        }
        if command.contains("get nodes --no-headers") {
            return Ok(format!("{ip}   Ready   control-plane   1m   {SANDBOX_VERSION}\n"));
        }
        if command.contains("get configmap kube-proxy") {
            return Ok(KUBE_PROXY_CONF.to_string());
        }
        if command.contains("base64 -w 0 /tmp/snapshot-") {
            return Ok(STANDARD.encode(b"sandbox etcd snapshot"));
        }
        Ok(String::new())
    }

    fn api_host(&self, ip: &str) -> String {
        self.api_hosts
            .lock()
            .get(ip)
            .cloned()
            .unwrap_or_else(|| ip.to_string())
    }
}

fn init_output(host: &str, with_control_plane: bool) -> String {
    let mut out = String::from("Your Kubernetes control-plane has initialized successfully!\n\n");
    if with_control_plane {
        out.push_str(&format!(
            "kubeadm join {host}:{API_SERVER_PORT} --token sandbx.0123456789abcdef \\\n\t\
             --discovery-token-ca-cert-hash sha256:5a4db0c \\\n\t\
             --control-plane --certificate-key 7e11c0de\n\n"
        ));
    }
    out.push_str(&format!(
        "Then you can join any number of worker nodes by running the following on each as root:\n\n\
         kubeadm join {host}:{API_SERVER_PORT} --token sandbx.0123456789abcdef \\\n\t\
         --discovery-token-ca-cert-hash sha256:5a4db0c\n"
    ));
    out
}

fn admin_conf(host: &str) -> String {
    format!(
        "apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: c2FuZGJveC1jYQ==
    server: https://{host}:{API_SERVER_PORT}
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
    client-certificate-data: c2FuZGJveC1jZXJ0
    client-key-data: c2FuZGJveC1rZXk=
"
    )
}

/// Provisioner, queue and guard over in-memory backends
pub struct Sandbox {
    /// Cluster and node rows
    pub store: Arc<MemClusterStore>,
    /// Job queue
    pub queue: Arc<MemTaskQueue>,
    /// Instances
    pub compute: Arc<MemCompute>,
    /// Shared by the worker and the reconciler
    pub busy: BusySet,
    /// Lifecycle engine
    pub provisioner: Provisioner,
}

impl Sandbox {
    /// Build the sandbox with the given timings
    pub fn new(provisioner: ProvisionerConfig, executor: ExecutorConfig) -> Result<Self> {
        let store = Arc::new(MemClusterStore::new());
        let nodes = Arc::new(SimulatedNodes::default());
        let compute = Arc::new(MemCompute::new().with_exec_handler(nodes.handler()));
        let secrets = Arc::new(LocalSecrets::new()?);
        let resolver = DefaultExecutorResolver::new(
            store.clone(),
            compute.clone(),
            secrets.clone(),
            executor,
        );

        let ctx = Context::builder()
            .store(store.clone())
            .compute(compute.clone())
            .security_groups(Arc::new(MemSecurityGroups::new()))
            .load_balancers(Arc::new(MemLoadBalancers::new()))
            .objects(Arc::new(MemObjectStore::new()))
            .secrets(secrets)
            .executors(Arc::new(resolver))
            .config(provisioner)
            .build()?;

        Ok(Self {
            store,
            queue: Arc::new(MemTaskQueue::new()),
            compute,
            busy: BusySet::new(),
            provisioner: Provisioner::new(Arc::new(ctx)),
        })
    }

    /// Job worker over this sandbox
    pub fn worker(&self, config: WorkerConfig) -> JobWorker {
        JobWorker::new(
            self.provisioner.clone(),
            self.queue.clone(),
            self.busy.clone(),
            config,
        )
    }

    /// Reconciler over this sandbox
    pub fn reconciler(&self, interval: Duration) -> Reconciler {
        Reconciler::new(
            Arc::new(self.provisioner.clone()),
            self.store.clone(),
            self.busy.clone(),
        )
        .with_interval(interval)
    }

    /// Enqueue `job_type` for `cluster` on `queue`
    pub fn enqueue(&self, queue: &str, cluster: &Cluster, job_type: JobType) -> Result<()> {
        let payload = ClusterJob::new(&cluster.id, &cluster.user_id, job_type).to_payload()?;
        self.queue.push(queue, payload);
        Ok(())
    }

    /// Seed a pending cluster and enqueue its provision job
    pub async fn seed_demo(&self, queue: &str, name: &str, workers: u32) -> Result<Cluster> {
        if name.trim().is_empty() {
            return Err(Error::validation("demo cluster name must not be empty"));
        }
        let cluster = Cluster::new(SANDBOX_USER, name, SANDBOX_VPC, SANDBOX_VERSION, workers);
        self.store.create_cluster(&cluster).await?;
        self.enqueue(queue, &cluster, JobType::Provision)?;
        info!(cluster = %cluster.id, name = %cluster.name, workers, "seeded demo cluster");
        Ok(cluster)
    }
}
