//! Rolling Kubernetes upgrade
//!
//! The primary control plane runs `kubeadm upgrade apply` first; if that
//! fails nothing else is touched and the cluster is marked failed. Secondary
//! control planes then workers follow with `kubeadm upgrade node`, one at a
//! time. Their failures are collected and returned together; the stored
//! version only moves once every node succeeded.

use nimbus_common::{ClusterStatus, Error, NodeRole, NodeStatus, Result};
use tracing::{info, instrument, warn};

use crate::bootstrap::kubeadm::{self, UpgradeTarget};
use crate::controller::Context;
use crate::phases;

/// Upgrade a cluster to `version`
#[instrument(skip(ctx))]
pub async fn upgrade(ctx: &Context, cluster_id: &str, version: &str) -> Result<()> {
    kubeadm::validate_version(version)?;
    let mut cluster = ctx.store.get_cluster(cluster_id).await?;
    let primary_ip = cluster.require_primary_ip("upgrade")?.to_string();
    phases::transition(ctx, &mut cluster, ClusterStatus::Upgrading).await?;

    let primary = match ctx.executors.resolve(&cluster, &primary_ip).await {
        Ok(exec) => exec,
        Err(e) => {
            phases::fail_cluster(ctx, cluster_id, &e).await;
            return Err(e);
        }
    };
    let script = kubeadm::upgrade_script(version, UpgradeTarget::PrimaryControlPlane);
    if let Err(e) = primary.run(&script).await {
        let err = Error::Upgrade {
            cluster: cluster.id.clone(),
            version: version.to_string(),
            failures: vec![format!("{primary_ip}: {e}")],
        };
        phases::fail_cluster(ctx, cluster_id, &err).await;
        return Err(err);
    }
    info!(ip = %primary_ip, version, "primary control plane upgraded");

    let node_script = kubeadm::upgrade_script(version, UpgradeTarget::Node);
    let mut nodes = ctx.store.list_nodes(cluster_id).await?;
    // secondaries first, then workers; stable sort keeps stored order within a role
    nodes.sort_by_key(|n| n.role != NodeRole::ControlPlane);

    let mut failures = Vec::new();
    for node in nodes.iter().filter(|n| n.status != NodeStatus::Failed) {
        let ip = match phases::node_ip(ctx, node).await {
            Ok(ip) => ip,
            Err(e) => {
                failures.push(format!("{}: {e}", node.name));
                continue;
            }
        };
        if ip == primary_ip {
            continue;
        }
        let result = async {
            let exec = ctx.executors.resolve(&cluster, &ip).await?;
            exec.run(&node_script).await
        }
        .await;
        match result {
            Ok(_) => info!(node = %node.name, version, "node upgraded"),
            Err(e) => {
                warn!(node = %node.name, error = %e, "node upgrade failed");
                failures.push(format!("{}: {e}", node.name));
            }
        }
    }

    let mut cluster = ctx.store.get_cluster(cluster_id).await?;
    if failures.is_empty() {
        cluster.version = version.to_string();
    }
    phases::settle(ctx, &mut cluster, ClusterStatus::Running).await?;

    if failures.is_empty() {
        info!(version, "cluster upgraded");
        Ok(())
    } else {
        Err(Error::Upgrade {
            cluster: cluster.id,
            version: version.to_string(),
            failures,
        })
    }
}
