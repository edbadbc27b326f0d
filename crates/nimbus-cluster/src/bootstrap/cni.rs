//! Networking and add-ons applied after the control plane is up
//!
//! Calico is the only fatal step; the kube-proxy patch, the default-deny
//! policy and kube-state-metrics are best-effort and callers log their
//! failures.

use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use nimbus_common::retry::{retry_with_backoff, RetryConfig};
use nimbus_common::{Error, Result};
use nimbus_executor::NodeExecutor;
use serde_yaml::{Mapping, Value};
use tracing::{info, instrument};

use super::{CALICO_VERSION, KUBECTL};
use crate::transport::write_file_command;

/// kube-state-metrics release applied for observability
pub const KUBE_STATE_METRICS_VERSION: &str = "v2.10.1";

/// Name of the default-deny ingress policy
pub const DEFAULT_DENY_POLICY: &str = "default-deny-ingress";

const KUBE_PROXY_PATCH_PATH: &str = "/tmp/kube-proxy-patch.json";
const NETWORK_POLICY_PATH: &str = "/tmp/default-deny-ingress.yaml";

/// Calico manifest for the pinned release
pub fn calico_manifest_url() -> String {
    format!(
        "https://raw.githubusercontent.com/projectcalico/calico/{CALICO_VERSION}/manifests/calico.yaml"
    )
}

/// Apply the Calico manifest, retrying transient download failures
#[instrument(skip(exec, retry), fields(node = %exec.target()))]
pub async fn install_cni(exec: &dyn NodeExecutor, retry: &RetryConfig) -> Result<()> {
    let cmd = format!("{KUBECTL} apply -f {}", calico_manifest_url());
    retry_with_backoff(retry, "install calico", || exec.run(&cmd)).await?;
    info!(version = CALICO_VERSION, "CNI installed");
    Ok(())
}

/// JSON patch setting `conntrack.maxPerCore: 0` in kube-proxy's `config.conf`.
///
/// Containerized nodes cannot raise `nf_conntrack_max`; with `maxPerCore: 0`
/// kube-proxy leaves it alone.
pub fn kube_proxy_patch(config_conf: &str) -> Result<String> {
    let yaml_err = |e: serde_yaml::Error| Error::serialization_for_kind("kube-proxy config", e.to_string());

    let mut conf: Value = if config_conf.trim().is_empty() {
        Value::Mapping(Mapping::new())
    } else {
        serde_yaml::from_str(config_conf).map_err(yaml_err)?
    };
    let root = conf
        .as_mapping_mut()
        .ok_or_else(|| Error::serialization_for_kind("kube-proxy config", "not a mapping"))?;

    let conntrack = root
        .entry(Value::from("conntrack"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !conntrack.is_mapping() {
        *conntrack = Value::Mapping(Mapping::new());
    }
    if let Some(conntrack) = conntrack.as_mapping_mut() {
        conntrack.insert(Value::from("maxPerCore"), Value::from(0));
    }

    let patched = serde_yaml::to_string(&conf).map_err(yaml_err)?;
    let patch = serde_json::json!([
        { "op": "replace", "path": "/data/config.conf", "value": patched }
    ]);
    Ok(serde_json::to_string(&patch)?)
}

/// Patch kube-proxy's conntrack settings and restart its pods
#[instrument(skip(exec), fields(node = %exec.target()))]
pub async fn patch_kube_proxy(exec: &dyn NodeExecutor) -> Result<()> {
    let current = exec
        .run(&format!(
            "{KUBECTL} -n kube-system get configmap kube-proxy -o jsonpath='{{.data.config\\.conf}}'"
        ))
        .await?;
    let patch = kube_proxy_patch(&current)?;

    exec.run(&write_file_command(KUBE_PROXY_PATCH_PATH, patch.as_bytes()))
        .await?;
    exec.run(&format!(
        "{KUBECTL} -n kube-system patch configmap kube-proxy --type=json --patch-file={KUBE_PROXY_PATCH_PATH}"
    ))
    .await?;
    exec.run(&format!(
        "{KUBECTL} -n kube-system delete pod -l k8s-app=kube-proxy"
    ))
    .await?;
    info!("kube-proxy conntrack patched");
    Ok(())
}

/// Deny all ingress to every pod in a namespace
pub fn default_deny_ingress(namespace: &str) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(DEFAULT_DENY_POLICY.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        }),
    }
}

/// Render a policy as YAML for `kubectl apply`
pub fn policy_yaml(policy: &NetworkPolicy) -> Result<String> {
    serde_yaml::to_string(policy)
        .map_err(|e| Error::serialization_for_kind("NetworkPolicy", e.to_string()))
}

/// Write the default-deny policy to the node and apply it
#[instrument(skip(exec), fields(node = %exec.target()))]
pub async fn apply_default_deny(exec: &dyn NodeExecutor) -> Result<()> {
    let manifest = policy_yaml(&default_deny_ingress("default"))?;
    exec.run(&write_file_command(NETWORK_POLICY_PATH, manifest.as_bytes()))
        .await?;
    exec.run(&format!("{KUBECTL} apply -f {NETWORK_POLICY_PATH}"))
        .await?;
    info!(policy = DEFAULT_DENY_POLICY, "network isolation applied");
    Ok(())
}

/// Apply the standard kube-state-metrics manifests
#[instrument(skip(exec), fields(node = %exec.target()))]
pub async fn install_kube_state_metrics(exec: &dyn NodeExecutor) -> Result<()> {
    exec.run(&format!(
        "{KUBECTL} apply -k 'https://github.com/kubernetes/kube-state-metrics/examples/standard?ref={KUBE_STATE_METRICS_VERSION}'"
    ))
    .await?;
    Ok(())
}
