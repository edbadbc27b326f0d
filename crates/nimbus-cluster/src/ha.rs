//! Highly available control plane
//!
//! Three control-plane nodes sit behind an L4 load balancer on the API
//! server port. The nodes are launched and bootstrapped concurrently, the
//! first is initialized against the balancer address, and the others join it
//! one at a time with the control-plane join command.

use futures::future::join_all;
use nimbus_common::retry::retry_with_backoff;
use nimbus_common::services::{CreateLoadBalancer, LbAlgorithm, LoadBalancer, SecurityGroup};
use nimbus_common::{Cluster, Error, NodeRole, Result, API_SERVER_PORT};
use tracing::{info, instrument};

use crate::bootstrap::kubeadm::{self, JoinCommands};
use crate::controller::Context;
use crate::kubeconfig::store_admin_kubeconfig;
use crate::phases::health::wait_for_api;
use crate::phases::{self, ReadyNode};

/// Weight every control-plane target is registered with
pub const TARGET_WEIGHT: u32 = 10;

/// Reuse or create the API-server balancer and record its address on the cluster
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.id))]
pub async fn ensure_api_load_balancer(ctx: &Context, cluster: &mut Cluster) -> Result<LoadBalancer> {
    let name = cluster.load_balancer_name();
    let existing = ctx
        .load_balancers
        .list(&cluster.vpc_id)
        .await?
        .into_iter()
        .find(|lb| lb.name == name);

    let lb = match existing {
        Some(lb) => {
            info!(lb = %lb.id, "reusing API load balancer");
            lb
        }
        None => {
            ctx.load_balancers
                .create(&CreateLoadBalancer {
                    name: name.clone(),
                    vpc_id: cluster.vpc_id.clone(),
                    port: API_SERVER_PORT,
                    algorithm: LbAlgorithm::RoundRobin,
                    idempotency_key: cluster.id.clone(),
                })
                .await?
        }
    };

    let lb = match lb.ip {
        Some(_) => lb,
        None => {
            let lb_id = lb.id.clone();
            let cluster_id = cluster.id.clone();
            retry_with_backoff(&ctx.config.lb_address_retry, "load balancer address", || {
                let (lb_id, cluster_id) = (&lb_id, &cluster_id);
                async move {
                    let current = ctx.load_balancers.get(lb_id).await?;
                    match current.ip {
                        Some(_) => Ok(current),
                        None => Err(Error::provider_for(
                            cluster_id,
                            "load-balancer",
                            format!("{lb_id} has no address yet"),
                        )),
                    }
                }
            })
            .await?
        }
    };

    let address = lb
        .ip
        .clone()
        .ok_or_else(|| Error::provider_for(&cluster.id, "load-balancer", "no address assigned"))?;
    cluster.api_server_lb_address = Some(address.clone());
    ctx.store.update_cluster(cluster).await?;
    info!(lb = %lb.id, address = %address, "API load balancer ready");
    Ok(lb)
}

/// Build the HA control plane; returns the primary and the join commands
#[instrument(skip(ctx, cluster, group), fields(cluster = %cluster.id))]
pub async fn provision_control_plane(
    ctx: &Context,
    cluster: &mut Cluster,
    group: Option<&SecurityGroup>,
) -> Result<(ReadyNode, JoinCommands)> {
    let lb = ensure_api_load_balancer(ctx, cluster).await?;
    let endpoint = cluster
        .api_server_lb_address
        .clone()
        .ok_or_else(|| Error::validation_for(&cluster.id, "HA cluster has no load balancer address"))?;

    let names: Vec<String> = (0..ctx.config.ha_control_planes)
        .map(|i| format!("{}-master-{i}", cluster.name))
        .collect();
    let launched = {
        let snapshot: &Cluster = cluster;
        join_all(
            names
                .iter()
                .map(|name| phases::bring_up_node(ctx, snapshot, name, NodeRole::ControlPlane, group)),
        )
        .await
    };
    let mut nodes = launched.into_iter().collect::<Result<Vec<_>>>()?.into_iter();
    let mut primary = nodes
        .next()
        .ok_or_else(|| Error::validation_for(&cluster.id, "HA control plane needs at least one node"))?;

    let init = kubeadm::init_command(&cluster.version, &primary.ip, Some(&endpoint));
    let output = primary.exec.run(&init).await?;
    let joins = kubeadm::parse_join_commands(&output)?;
    let control_plane_join = joins.control_plane.clone().ok_or_else(|| {
        Error::validation_for(&cluster.id, "kubeadm init printed no control-plane join command")
    })?;

    cluster.control_plane_ips = vec![primary.ip.clone()];
    ctx.store.update_cluster(cluster).await?;
    ctx.load_balancers
        .add_target(&lb.id, &primary.node.instance_id, API_SERVER_PORT, TARGET_WEIGHT)
        .await?;

    wait_for_api(ctx, primary.exec.as_ref()).await?;
    store_admin_kubeconfig(ctx, cluster, primary.exec.as_ref()).await?;
    phases::activate(ctx, &mut primary.node).await?;
    info!(node = %primary.node.name, ip = %primary.ip, "primary control plane initialized");

    for mut secondary in nodes {
        let joined = async {
            phases::join_node(ctx, &secondary, &control_plane_join).await?;
            ctx.load_balancers
                .add_target(&lb.id, &secondary.node.instance_id, API_SERVER_PORT, TARGET_WEIGHT)
                .await
        }
        .await;
        if let Err(e) = joined {
            phases::abandon_node(ctx, secondary.node, &e).await;
            return Err(e);
        }

        phases::activate(ctx, &mut secondary.node).await?;
        cluster.control_plane_ips.push(secondary.ip.clone());
        ctx.store.update_cluster(cluster).await?;
        info!(node = %secondary.node.name, ip = %secondary.ip, "control plane joined");
    }

    Ok((primary, joins))
}
