//! Cluster security group

use nimbus_common::services::{Direction, Protocol, SecurityGroup, SecurityRule};
use nimbus_common::{Cluster, Result, API_SERVER_PORT};
use tracing::{info, instrument, warn};

use crate::controller::Context;

/// Priority of every cluster rule
pub const RULE_PRIORITY: u32 = 100;

/// Ingress rules every cluster needs: API server, VXLAN, BGP, kubelet, NodePorts
pub fn cluster_rules() -> Vec<SecurityRule> {
    let ingress = |protocol, port_from, port_to| SecurityRule {
        direction: Direction::Ingress,
        protocol,
        port_from,
        port_to,
        cidr: "0.0.0.0/0".to_string(),
        priority: RULE_PRIORITY,
    };

    vec![
        ingress(Protocol::Tcp, API_SERVER_PORT, API_SERVER_PORT),
        ingress(Protocol::Udp, 4789, 4789),
        ingress(Protocol::Tcp, 179, 179),
        ingress(Protocol::Tcp, 10250, 10250),
        ingress(Protocol::Tcp, 30000, 32767),
        ingress(Protocol::Udp, 30000, 32767),
    ]
}

/// Find `sg-{name}` in the cluster VPC, creating it with [`cluster_rules`] if absent
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.id))]
pub async fn ensure_security_group(ctx: &Context, cluster: &Cluster) -> Result<SecurityGroup> {
    let name = cluster.security_group_name();
    if let Some(existing) = ctx
        .security_groups
        .get_group(&cluster.vpc_id, &name)
        .await?
    {
        info!(group = %existing.id, "reusing security group");
        return Ok(existing);
    }

    let group = ctx
        .security_groups
        .create_group(&cluster.vpc_id, &name)
        .await?;
    for rule in cluster_rules() {
        ctx.security_groups.add_rule(&group.id, &rule).await?;
    }
    info!(group = %group.id, "created security group");
    Ok(group)
}

/// Attach the cluster group to an instance; failures are logged
pub async fn attach(ctx: &Context, group: Option<&SecurityGroup>, instance_id: &str) {
    let Some(group) = group else {
        return;
    };
    if let Err(e) = ctx
        .security_groups
        .attach_to_instance(&group.id, instance_id)
        .await
    {
        warn!(group = %group.id, instance = %instance_id, error = %e, "failed to attach security group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_ingress_rules_open_to_all() {
        let rules = cluster_rules();
        assert_eq!(rules.len(), 6);
        assert!(rules.iter().all(|r| r.direction == Direction::Ingress
            && r.cidr == "0.0.0.0/0"
            && r.priority == 100));

        let ports: Vec<(Protocol, u16, u16)> =
            rules.iter().map(|r| (r.protocol, r.port_from, r.port_to)).collect();
        assert!(ports.contains(&(Protocol::Tcp, 6443, 6443)));
        assert!(ports.contains(&(Protocol::Udp, 4789, 4789)));
        assert!(ports.contains(&(Protocol::Tcp, 179, 179)));
        assert!(ports.contains(&(Protocol::Tcp, 10250, 10250)));
        assert!(ports.contains(&(Protocol::Tcp, 30000, 32767)));
        assert!(ports.contains(&(Protocol::Udp, 30000, 32767)));
    }
}
