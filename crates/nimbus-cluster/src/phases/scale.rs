//! Converging the worker pool on `worker_count`

use nimbus_common::{Cluster, ClusterNode, NodeRole, Result};
use nimbus_executor::NodeExecutor;
use tracing::{info, instrument, warn};

use crate::bootstrap::kubeadm;
use crate::bootstrap::KUBECTL;
use crate::controller::Context;
use crate::phases;

/// What a scale pass changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScaleReport {
    /// Workers that joined
    pub added: Vec<String>,
    /// Workers drained and removed
    pub removed: Vec<String>,
    /// Workers that failed to come up during this pass
    pub failed: Vec<String>,
    /// Failed worker rows from earlier passes that were cleaned up
    pub cleaned: Vec<String>,
}

impl ScaleReport {
    /// True when the pass changed nothing
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.failed.is_empty()
            && self.cleaned.is_empty()
    }
}

/// Add or remove workers until the live worker count matches `worker_count`
#[instrument(skip(ctx))]
pub async fn scale(ctx: &Context, cluster_id: &str) -> Result<ScaleReport> {
    let cluster = ctx.store.get_cluster(cluster_id).await?;
    let primary = phases::primary_executor(ctx, &cluster, "scale").await?;
    let mut report = ScaleReport::default();

    let (live, failed): (Vec<ClusterNode>, Vec<ClusterNode>) = ctx
        .store
        .list_nodes(cluster_id)
        .await?
        .into_iter()
        .filter(|n| n.role == NodeRole::Worker)
        .partition(ClusterNode::is_live_worker);

    for node in failed {
        match phases::remove_node(ctx, &node).await {
            Ok(()) => report.cleaned.push(node.name),
            Err(e) => warn!(node = %node.name, error = %e, "failed to clean up failed worker"),
        }
    }

    let desired = cluster.worker_count as usize;
    let current = live.len();
    if desired > current {
        scale_up(ctx, &cluster, primary.as_ref(), desired - current, &mut report).await?;
    } else if desired < current {
        for node in live.iter().take(current - desired) {
            drain(primary.as_ref(), &node.name).await;
            match phases::remove_node(ctx, node).await {
                Ok(()) => report.removed.push(node.name.clone()),
                Err(e) => warn!(node = %node.name, error = %e, "failed to remove worker"),
            }
        }
    }

    if !report.is_noop() {
        info!(
            desired,
            added = report.added.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            cleaned = report.cleaned.len(),
            "worker pool scaled"
        );
    }
    Ok(report)
}

async fn scale_up(
    ctx: &Context,
    cluster: &Cluster,
    primary: &dyn NodeExecutor,
    count: usize,
    report: &mut ScaleReport,
) -> Result<()> {
    let output = primary.run(kubeadm::TOKEN_CREATE_COMMAND).await?;
    let join = kubeadm::parse_join_commands(&output)?.worker;
    let group = ctx
        .security_groups
        .get_group(&cluster.vpc_id, &cluster.security_group_name())
        .await?;

    for _ in 0..count {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-worker-{}", cluster.name, &suffix[..8]);
        match phases::add_worker(ctx, cluster, &name, group.as_ref(), &join).await {
            Ok(_) => report.added.push(name),
            Err(e) => {
                warn!(node = %name, error = %e, "worker failed to join");
                report.failed.push(name);
            }
        }
    }
    Ok(())
}

/// Evict workloads and remove the Node object; failures are logged
async fn drain(primary: &dyn NodeExecutor, node_name: &str) {
    let drain = format!(
        "{KUBECTL} drain {node_name} --ignore-daemonsets --delete-emptydir-data --force --timeout=120s"
    );
    if let Err(e) = primary.run(&drain).await {
        warn!(node = %node_name, error = %e, "drain failed, removing anyway");
    }
    if let Err(e) = primary.run(&format!("{KUBECTL} delete node {node_name}")).await {
        warn!(node = %node_name, error = %e, "failed to delete node object");
    }
}
