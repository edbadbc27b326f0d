//! Lifecycle operations.
//!
//! Each operation lives in its own module. The helpers here are shared by
//! every operation that brings nodes up or settles a cluster's status.

pub mod backup;
pub mod credentials;
pub mod deprovision;
pub mod health;
pub mod provision;
pub mod repair;
pub mod scale;
pub mod upgrade;

pub use deprovision::DeprovisionReport;
pub use scale::ScaleReport;

use std::sync::Arc;

use nimbus_common::poll::wait_for;
use nimbus_common::retry::retry_with_backoff;
use nimbus_common::services::{LaunchRequest, SecurityGroup};
use nimbus_common::{
    mask_join_secrets, Cluster, ClusterNode, ClusterStatus, Error, NodeRole, NodeStatus, Result,
};
use nimbus_executor::{strip_cidr, NodeExecutor};
use tracing::{debug, error, info, warn};

use crate::bootstrap::{bootstrap_node, kubeadm};
use crate::controller::Context;
use crate::security;

/// Lines of console output logged when a node fails to come up
const INSTANCE_LOG_TAIL: usize = 20;

/// Set a terminal status, clear the in-flight job and persist
pub(crate) async fn settle(ctx: &Context, cluster: &mut Cluster, status: ClusterStatus) -> Result<()> {
    cluster.status = status;
    cluster.job_id = None;
    ctx.store.update_cluster(cluster).await
}

/// Persist a transitional status
pub(crate) async fn transition(
    ctx: &Context,
    cluster: &mut Cluster,
    status: ClusterStatus,
) -> Result<()> {
    info!(cluster = %cluster.id, from = %cluster.status, to = %status, "status transition");
    cluster.status = status;
    ctx.store.update_cluster(cluster).await
}

/// Move a cluster to `failed` after `cause`; store errors are logged
pub(crate) async fn fail_cluster(ctx: &Context, cluster_id: &str, cause: &Error) {
    error!(cluster = %cluster_id, error = %cause, "cluster operation failed");
    match ctx.store.get_cluster(cluster_id).await {
        Ok(mut cluster) => {
            if let Err(e) = settle(ctx, &mut cluster, ClusterStatus::Failed).await {
                error!(cluster = %cluster_id, error = %e, "failed to record failed status");
            }
        }
        Err(e) => error!(cluster = %cluster_id, error = %e, "failed to load cluster to mark it failed"),
    }
}

/// A node that is up, addressed and bootstrapped
pub(crate) struct ReadyNode {
    pub node: ClusterNode,
    pub ip: String,
    pub exec: Arc<dyn NodeExecutor>,
}

/// Launch an instance and record its node row
pub(crate) async fn launch_node(
    ctx: &Context,
    cluster: &Cluster,
    name: &str,
    role: NodeRole,
    group: Option<&SecurityGroup>,
) -> Result<ClusterNode> {
    let request = LaunchRequest {
        name: name.to_string(),
        image: ctx.config.node_image.clone(),
        ports: ctx.config.node_ports.clone(),
        vpc_id: cluster.vpc_id.clone(),
        subnet_id: cluster.subnet_id.clone(),
        volumes: Vec::new(),
    };
    let instance = ctx
        .compute
        .launch_instance(&request)
        .await
        .map_err(|e| Error::provider_for(&cluster.id, "compute", format!("launch {name}: {e}")))?;

    let node = ClusterNode::new(&cluster.id, &instance.id, name, role);
    ctx.store.create_node(&node).await?;
    security::attach(ctx, group, &instance.id).await;

    info!(cluster = %cluster.id, node = %name, instance = %instance.id, role = %role, "launched node");
    Ok(node)
}

/// Wait for an instance to be assigned an address
pub(crate) async fn wait_for_ip(ctx: &Context, instance_id: &str) -> Result<String> {
    wait_for(
        &format!("address of instance {instance_id}"),
        ctx.config.ip_wait_timeout,
        ctx.config.ip_poll_interval,
        ctx.config.poll_jitter,
        || async move {
            let instance = ctx.compute.get_instance(instance_id).await?;
            Ok(instance
                .private_ip
                .as_deref()
                .map(strip_cidr)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string))
        },
    )
    .await
}

/// Current address of a node's instance
pub(crate) async fn node_ip(ctx: &Context, node: &ClusterNode) -> Result<String> {
    let instance = ctx.compute.get_instance(&node.instance_id).await?;
    instance
        .private_ip
        .as_deref()
        .map(|ip| strip_cidr(ip).to_string())
        .ok_or_else(|| Error::not_found("address of instance", &node.instance_id))
}

async fn prepare(
    ctx: &Context,
    cluster: &Cluster,
    node: &ClusterNode,
) -> Result<(String, Arc<dyn NodeExecutor>)> {
    let ip = wait_for_ip(ctx, &node.instance_id).await?;
    let exec = ctx.executors.resolve(cluster, &ip).await?;
    exec.wait_for_ready(ctx.config.node_ready_timeout).await?;
    bootstrap_node(exec.as_ref()).await?;
    Ok((ip, exec))
}

/// Launch, address and bootstrap a node; a node that fails is abandoned
pub(crate) async fn bring_up_node(
    ctx: &Context,
    cluster: &Cluster,
    name: &str,
    role: NodeRole,
    group: Option<&SecurityGroup>,
) -> Result<ReadyNode> {
    let node = launch_node(ctx, cluster, name, role, group).await?;
    match prepare(ctx, cluster, &node).await {
        Ok((ip, exec)) => Ok(ReadyNode { node, ip, exec }),
        Err(e) => {
            abandon_node(ctx, node, &e).await;
            Err(e)
        }
    }
}

/// Run a join command with retries
pub(crate) async fn join_node(ctx: &Context, ready: &ReadyNode, join: &str) -> Result<()> {
    let cmd = kubeadm::join_invocation(join);
    debug!(node = %ready.node.name, command = %mask_join_secrets(&cmd), "joining node");
    retry_with_backoff(&ctx.config.join_retry, "kubeadm join", || ready.exec.run(&cmd)).await?;
    Ok(())
}

/// Mark a node active and persist
pub(crate) async fn activate(ctx: &Context, node: &mut ClusterNode) -> Result<()> {
    node.mark_active();
    ctx.store.update_node(node).await
}

/// Bring up a worker and join it; a worker that fails is abandoned
pub(crate) async fn add_worker(
    ctx: &Context,
    cluster: &Cluster,
    name: &str,
    group: Option<&SecurityGroup>,
    join: &str,
) -> Result<ClusterNode> {
    let mut ready = bring_up_node(ctx, cluster, name, NodeRole::Worker, group).await?;

    let joined = match join_node(ctx, &ready, join).await {
        Ok(()) => activate(ctx, &mut ready.node).await,
        Err(e) => Err(e),
    };
    match joined {
        Ok(()) => {
            info!(cluster = %cluster.id, node = %name, ip = %ready.ip, "worker joined");
            Ok(ready.node)
        }
        Err(e) => {
            abandon_node(ctx, ready.node, &e).await;
            Err(e)
        }
    }
}

/// Mark a node failed, log its console tail and terminate its instance
pub(crate) async fn abandon_node(ctx: &Context, mut node: ClusterNode, cause: &Error) {
    warn!(node = %node.name, instance = %node.instance_id, error = %cause, "node failed, terminating");
    log_instance_tail(ctx, &node.instance_id).await;

    node.status = NodeStatus::Failed;
    if let Err(e) = ctx.store.update_node(&node).await {
        warn!(node = %node.name, error = %e, "failed to mark node failed");
    }
    if let Err(e) = ctx.compute.terminate_instance(&node.instance_id).await {
        warn!(node = %node.name, instance = %node.instance_id, error = %e, "failed to terminate instance");
    }
}

/// Terminate a node's instance and delete its row; errors are returned for aggregation
pub(crate) async fn remove_node(ctx: &Context, node: &ClusterNode) -> std::result::Result<(), String> {
    let mut problems = Vec::new();
    match ctx.compute.terminate_instance(&node.instance_id).await {
        Ok(()) | Err(Error::NotFound { .. }) => {}
        Err(e) => problems.push(format!("terminate {}: {e}", node.instance_id)),
    }
    if let Err(e) = ctx.store.delete_node(&node.id).await {
        problems.push(format!("delete row {}: {e}", node.id));
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(format!("{}: {}", node.name, problems.join(", ")))
    }
}

async fn log_instance_tail(ctx: &Context, instance_id: &str) {
    match ctx.compute.get_instance_logs(instance_id).await {
        Ok(logs) => {
            let lines: Vec<&str> = logs.lines().collect();
            let tail = lines[lines.len().saturating_sub(INSTANCE_LOG_TAIL)..].join("\n");
            debug!(instance = %instance_id, console = %tail, "instance console tail");
        }
        Err(e) => debug!(instance = %instance_id, error = %e, "no console logs"),
    }
}

/// Resolve the executor for the primary control plane
pub(crate) async fn primary_executor(
    ctx: &Context,
    cluster: &Cluster,
    operation: &str,
) -> Result<Arc<dyn NodeExecutor>> {
    let ip = cluster.require_primary_ip(operation)?;
    ctx.executors.resolve(cluster, ip).await
}
