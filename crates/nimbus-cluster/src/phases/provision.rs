//! Provisioning a cluster from scratch
//!
//! Phases run in order and every phase but the worker pool is fatal:
//!
//! 1. security group
//! 2. control plane (one node, or three behind a load balancer)
//! 3. workers, joined one at a time; a worker that fails is logged and skipped
//! 4. networking and add-ons; only the CNI is fatal
//! 5. commit to `running`
//!
//! A fatal error moves the cluster to `failed`.

use nimbus_common::services::SecurityGroup;
use nimbus_common::{Cluster, ClusterStatus, Error, NodeRole, Result};
use nimbus_executor::NodeExecutor;
use tracing::{info, instrument, warn};

use crate::bootstrap::cni;
use crate::bootstrap::kubeadm::{self, JoinCommands};
use crate::controller::Context;
use crate::ha;
use crate::kubeconfig::store_admin_kubeconfig;
use crate::phases::health::wait_for_api;
use crate::phases::{self, ReadyNode};
use crate::security;

/// Provision a cluster; ends `running` or `failed`
#[instrument(skip(ctx))]
pub async fn provision(ctx: &Context, cluster_id: &str) -> Result<()> {
    let mut cluster = ctx.store.get_cluster(cluster_id).await?;
    phases::transition(ctx, &mut cluster, ClusterStatus::Provisioning).await?;

    match run(ctx, &mut cluster).await {
        Ok(()) => {
            info!(cluster = %cluster.id, ips = ?cluster.control_plane_ips, "cluster running");
            Ok(())
        }
        Err(e) => {
            phases::fail_cluster(ctx, cluster_id, &e).await;
            Err(e)
        }
    }
}

async fn run(ctx: &Context, cluster: &mut Cluster) -> Result<()> {
    let group = security::ensure_security_group(ctx, cluster)
        .await
        .map_err(|e| Error::phase(&cluster.id, "security-group", &e))?;

    let (primary, joins) = control_plane(ctx, cluster, &group)
        .await
        .map_err(|e| Error::phase(&cluster.id, "control-plane", &e))?;

    add_workers(ctx, cluster, &group, &joins.worker).await;

    finalize(ctx, cluster, primary.exec.as_ref())
        .await
        .map_err(|e| Error::phase(&cluster.id, "finalize", &e))?;

    phases::settle(ctx, cluster, ClusterStatus::Running)
        .await
        .map_err(|e| Error::phase(&cluster.id, "commit", &e))
}

async fn control_plane(
    ctx: &Context,
    cluster: &mut Cluster,
    group: &SecurityGroup,
) -> Result<(ReadyNode, JoinCommands)> {
    if cluster.ha_enabled {
        return ha::provision_control_plane(ctx, cluster, Some(group)).await;
    }

    let name = format!("{}-master-0", cluster.name);
    let mut primary =
        phases::bring_up_node(ctx, cluster, &name, NodeRole::ControlPlane, Some(group)).await?;

    let output = primary
        .exec
        .run(&kubeadm::init_command(&cluster.version, &primary.ip, None))
        .await?;
    let joins = kubeadm::parse_join_commands(&output)?;

    cluster.control_plane_ips = vec![primary.ip.clone()];
    ctx.store.update_cluster(cluster).await?;

    wait_for_api(ctx, primary.exec.as_ref()).await?;
    store_admin_kubeconfig(ctx, cluster, primary.exec.as_ref()).await?;
    phases::activate(ctx, &mut primary.node).await?;
    info!(node = %name, ip = %primary.ip, "control plane initialized");
    Ok((primary, joins))
}

async fn add_workers(ctx: &Context, cluster: &Cluster, group: &SecurityGroup, join: &str) {
    for i in 0..cluster.worker_count {
        let name = format!("{}-worker-{i}", cluster.name);
        if let Err(e) = phases::add_worker(ctx, cluster, &name, Some(group), join).await {
            warn!(cluster = %cluster.id, node = %name, error = %e, "worker failed to join, continuing");
        }
    }
}

/// Networking and add-ons on the primary; only the CNI is required
pub(crate) async fn finalize(ctx: &Context, cluster: &Cluster, exec: &dyn NodeExecutor) -> Result<()> {
    cni::install_cni(exec, &ctx.config.cni_retry).await?;

    if let Err(e) = cni::patch_kube_proxy(exec).await {
        warn!(cluster = %cluster.id, error = %e, "kube-proxy patch failed");
    }
    if cluster.network_isolation {
        if let Err(e) = cni::apply_default_deny(exec).await {
            warn!(cluster = %cluster.id, error = %e, "default-deny policy failed");
        }
    }
    if let Err(e) = cni::install_kube_state_metrics(exec).await {
        warn!(cluster = %cluster.id, error = %e, "kube-state-metrics install failed");
    }
    Ok(())
}
