//! Tearing a cluster down
//!
//! Every resource is attempted even if an earlier one fails; failures are
//! collected into the report. Removing the cluster row is left to the caller.

use nimbus_common::{ClusterStatus, Error, Result};
use tracing::{info, instrument, warn};

use crate::controller::Context;
use crate::phases;

/// Outcome of a teardown
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeprovisionReport {
    /// Node rows removed
    pub nodes_removed: usize,
    /// Resources that could not be removed
    pub errors: Vec<String>,
}

impl DeprovisionReport {
    /// True when every resource was removed
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Terminate instances, delete node rows, the HA balancer and the security group
#[instrument(skip(ctx))]
pub async fn deprovision(ctx: &Context, cluster_id: &str) -> Result<DeprovisionReport> {
    let mut cluster = ctx.store.get_cluster(cluster_id).await?;
    phases::transition(ctx, &mut cluster, ClusterStatus::Deleting).await?;

    let mut report = DeprovisionReport::default();
    for node in ctx.store.list_nodes(cluster_id).await? {
        match phases::remove_node(ctx, &node).await {
            Ok(()) => report.nodes_removed += 1,
            Err(e) => report.errors.push(e),
        }
    }

    if cluster.ha_enabled {
        let name = cluster.load_balancer_name();
        match ctx.load_balancers.list(&cluster.vpc_id).await {
            Ok(balancers) => {
                for lb in balancers.into_iter().filter(|lb| lb.name == name) {
                    if let Err(e) = ctx.load_balancers.delete(&lb.id).await {
                        report.errors.push(format!("load balancer {}: {e}", lb.id));
                    }
                }
            }
            Err(e) => report.errors.push(format!("list load balancers: {e}")),
        }
    }

    let group_name = cluster.security_group_name();
    match ctx.security_groups.get_group(&cluster.vpc_id, &group_name).await {
        Ok(Some(group)) => {
            if let Err(e) = ctx.security_groups.delete_group(&group.id).await {
                report.errors.push(format!("security group {}: {e}", group.id));
            }
        }
        Ok(None) | Err(Error::NotFound { .. }) => {}
        Err(e) => report.errors.push(format!("security group {group_name}: {e}")),
    }

    if report.is_clean() {
        info!(nodes = report.nodes_removed, "cluster resources removed");
    } else {
        warn!(nodes = report.nodes_removed, errors = ?report.errors, "cluster teardown incomplete");
    }
    Ok(report)
}
