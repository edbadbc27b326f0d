//! Cluster health
//!
//! Health is read from the primary control plane with `kubectl get nodes`.
//! An unreachable node or API server is reported in the result, not as an
//! error, so the reconciler can act on it.

use nimbus_common::poll::wait_for;
use nimbus_common::{ClusterHealth, Result};
use nimbus_executor::NodeExecutor;
use tracing::{debug, instrument};

use crate::bootstrap::KUBECTL;
use crate::controller::Context;

/// Count `(total, ready)` in `kubectl get nodes --no-headers` output
pub fn count_nodes(output: &str) -> (u32, u32) {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .fold((0, 0), |(total, ready), line| {
            // STATUS is the second column; NotReady must not count
            let is_ready = line
                .split_whitespace()
                .nth(1)
                .is_some_and(|status| status.split(',').any(|s| s == "Ready"));
            (total + 1, ready + u32::from(is_ready))
        })
}

/// API liveness and node readiness for a cluster
#[instrument(skip(ctx))]
pub async fn get_health(ctx: &Context, cluster_id: &str) -> Result<ClusterHealth> {
    let cluster = ctx.store.get_cluster(cluster_id).await?;
    let mut health = ClusterHealth {
        status: cluster.status,
        ..Default::default()
    };

    let Some(ip) = cluster.primary_ip() else {
        health.message = "no control-plane node recorded".to_string();
        return Ok(health);
    };
    let exec = match ctx.executors.resolve(&cluster, ip).await {
        Ok(exec) => exec,
        Err(e) => {
            health.message = format!("control plane unreachable: {e}");
            return Ok(health);
        }
    };

    match exec.run(&format!("{KUBECTL} get nodes --no-headers")).await {
        Ok(output) => {
            let (total, ready) = count_nodes(&output);
            health.api_server = true;
            health.nodes_total = total;
            health.nodes_ready = ready;
            if ready < total {
                health.message = format!("{ready}/{total} nodes ready");
            }
        }
        Err(e) => {
            debug!(error = %e, "kubectl get nodes failed");
            health.message = "API server unreachable".to_string();
        }
    }
    Ok(health)
}

/// Wait until `/healthz` on the node's API server answers `ok`
pub async fn wait_for_api(ctx: &Context, exec: &dyn NodeExecutor) -> Result<()> {
    let cmd = format!("{KUBECTL} get --raw=/healthz");
    wait_for(
        &format!("API server on {}", exec.target()),
        ctx.config.api_health_timeout,
        ctx.config.api_health_poll_interval,
        ctx.config.poll_jitter,
        || {
            let cmd = &cmd;
            async move {
                let out = exec.run(cmd).await?;
                Ok(out.contains("ok").then_some(()))
            }
        },
    )
    .await
}
