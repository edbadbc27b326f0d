//! Repair: re-apply networking and converge workers
//!
//! Every step is idempotent. Only the CNI and the scale pass can fail the
//! repair; the cluster's status is never changed here.

use nimbus_common::Result;
use tracing::{info, instrument, warn};

use crate::bootstrap::cni;
use crate::controller::Context;
use crate::phases::{self, scale};

/// Re-install the CNI, re-patch kube-proxy, re-apply isolation and scale
#[instrument(skip(ctx))]
pub async fn repair(ctx: &Context, cluster_id: &str) -> Result<()> {
    let cluster = ctx.store.get_cluster(cluster_id).await?;
    let primary = phases::primary_executor(ctx, &cluster, "repair").await?;

    cni::install_cni(primary.as_ref(), &ctx.config.cni_retry).await?;
    if let Err(e) = cni::patch_kube_proxy(primary.as_ref()).await {
        warn!(error = %e, "kube-proxy patch failed");
    }
    if cluster.network_isolation {
        if let Err(e) = cni::apply_default_deny(primary.as_ref()).await {
            warn!(error = %e, "default-deny policy failed");
        }
    }

    let report = scale::scale(ctx, cluster_id).await?;
    info!(
        added = report.added.len(),
        removed = report.removed.len(),
        cleaned = report.cleaned.len(),
        "repair complete"
    );
    Ok(())
}
