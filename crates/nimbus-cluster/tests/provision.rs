//! Provisioning and teardown scenarios

mod support;

use nimbus_cluster::security::ensure_security_group;
use nimbus_common::{
    ClusterStatus, ClusterStore, ComputeBackend, Error, KubeconfigRole, NodeRole, NodeStatus,
    SecretsService,
};
use support::{Harness, USER, VPC};

/// Story: a two-worker cluster comes up on a single control plane
///
/// The cluster moves pending -> provisioning -> running, records the
/// control-plane address, stores an encrypted kubeconfig that points at it
/// and leaves kube-proxy patched for containerized nodes.
#[tokio::test]
async fn story_non_ha_cluster_provisions_with_two_workers() {
    let h = Harness::new();
    let cluster = h.create_cluster("dev", 2, false).await;
    assert_eq!(cluster.status, ClusterStatus::Pending);

    h.provisioner.provision(&cluster.id).await.unwrap();

    let cluster = h.cluster(&cluster.id).await;
    assert_eq!(cluster.status, ClusterStatus::Running);
    assert!(cluster.job_id.is_none());
    cluster.check_invariants(1).unwrap();

    let nodes = h.nodes(&cluster.id).await;
    let masters: Vec<_> = nodes.iter().filter(|n| n.role == NodeRole::ControlPlane).collect();
    let workers: Vec<_> = nodes.iter().filter(|n| n.role == NodeRole::Worker).collect();
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].name, "dev-master-0");
    assert_eq!(workers.len(), 2);
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Active));

    let master_ip = h.ip_of(masters[0]).await;
    assert_eq!(cluster.control_plane_ips, vec![master_ip.clone()]);

    // stored ciphertext, plaintext only through the secrets service
    assert!(!cluster.kubeconfig.is_empty());
    assert!(!cluster.kubeconfig.contains("server:"));
    let raw = h.secrets.decrypt(USER, &cluster.kubeconfig).await.unwrap();
    assert!(raw.contains(&format!("server: https://{master_ip}:6443")));
    let served = h
        .provisioner
        .get_kubeconfig(&cluster.id, KubeconfigRole::Admin)
        .await
        .unwrap();
    assert_eq!(served.expose(), raw.expose());

    // calico applied once, no retries
    assert_eq!(h.sim.count("calico.yaml"), 1);
    let patch = h.sim.kube_proxy_patch().expect("kube-proxy patched");
    assert!(patch.contains("maxPerCore: 0"));
    assert_eq!(h.sim.count("delete pod -l k8s-app=kube-proxy"), 1);

    // isolation is off by default
    assert_eq!(h.sim.count("default-deny-ingress"), 0);

    // init ran on the master, joins on the workers
    let inits = h.sim.calls_matching("kubeadm init");
    assert_eq!(inits.len(), 1);
    assert_eq!(inits[0].0, master_ip);
    assert!(inits[0].1.contains("--kubernetes-version=v1.29.0"));
    assert!(!inits[0].1.contains("--control-plane-endpoint"));
    assert_eq!(h.sim.count("kubeadm join"), 2);

    // every node was bootstrapped and attached to the cluster group
    assert_eq!(h.sim.count("br_netfilter"), 3);
    let group = &h.security_groups.groups()[0];
    assert_eq!(group.name, "sg-dev");
    assert_eq!(h.security_groups.attachments(&group.id).len(), 3);
}

/// Story: an HA cluster fronts three control planes with a load balancer
#[tokio::test]
async fn story_ha_cluster_registers_three_targets() {
    let h = Harness::new();
    let cluster = h.create_cluster("prod", 0, true).await;

    h.provisioner.provision(&cluster.id).await.unwrap();

    let cluster = h.cluster(&cluster.id).await;
    assert_eq!(cluster.status, ClusterStatus::Running);
    assert_eq!(cluster.control_plane_ips.len(), 3);
    cluster.check_invariants(3).unwrap();

    let balancers = h.load_balancers.balancers();
    assert_eq!(balancers.len(), 1);
    let lb = &balancers[0];
    assert_eq!(lb.name, "lb-k8s-prod");
    assert_eq!(lb.port, 6443);
    assert_eq!(cluster.api_server_lb_address, lb.ip);

    let targets = h.load_balancers.targets(&lb.id);
    assert_eq!(targets.len(), 3);
    assert!(targets.iter().all(|t| t.port == 6443 && t.weight == 10));

    let lb_ip = lb.ip.clone().unwrap();
    let inits = h.sim.calls_matching("kubeadm init");
    assert_eq!(inits.len(), 1);
    assert!(inits[0]
        .1
        .contains(&format!("--control-plane-endpoint={lb_ip}:6443 --upload-certs")));

    // both secondaries join with the certificate-key variant
    let joins = h.sim.calls_matching("kubeadm join");
    assert_eq!(joins.len(), 2);
    assert!(joins
        .iter()
        .all(|(_, cmd)| cmd.contains("--control-plane --certificate-key")));

    let raw = h.secrets.decrypt(USER, &cluster.kubeconfig).await.unwrap();
    assert!(raw.contains(&format!("server: https://{lb_ip}:6443")));
}

/// Story: a failing kubeadm init fails the cluster and clears the job
#[tokio::test]
async fn story_init_failure_marks_cluster_failed() {
    let h = Harness::new();
    let mut cluster = h.create_cluster("broken", 1, false).await;
    cluster.job_id = Some("job-1".to_string());
    h.store.update_cluster(&cluster).await.unwrap();
    h.sim.fail("kubeadm init");

    let err = h.provisioner.provision(&cluster.id).await.unwrap_err();
    assert!(err.to_string().contains("control-plane"));

    let cluster = h.cluster(&cluster.id).await;
    assert_eq!(cluster.status, ClusterStatus::Failed);
    assert!(cluster.job_id.is_none());
    // no workers were attempted
    assert_eq!(h.sim.count("kubeadm join"), 0);
}

/// Story: a worker that cannot join does not fail the cluster
#[tokio::test]
async fn story_failed_worker_is_recorded_and_terminated() {
    let h = Harness::new();
    h.sim.fail("kubeadm join");
    let cluster = h.running_cluster("dev", 1, false).await;

    assert_eq!(cluster.status, ClusterStatus::Running);
    let nodes = h.nodes(&cluster.id).await;
    let worker = nodes.iter().find(|n| n.role == NodeRole::Worker).unwrap();
    assert_eq!(worker.status, NodeStatus::Failed);
    assert_eq!(h.compute.terminated(), vec![worker.instance_id.clone()]);
    // the join was retried before giving up
    assert_eq!(h.sim.count("kubeadm join"), 3);
}

/// Story: CNI failure is fatal even after the control plane is up
#[tokio::test]
async fn story_cni_failure_is_fatal() {
    let h = Harness::new();
    h.sim.fail("calico.yaml");
    let cluster = h.create_cluster("dev", 0, false).await;

    let err = h.provisioner.provision(&cluster.id).await.unwrap_err();
    assert!(err.to_string().contains("finalize"));
    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Failed);
    assert_eq!(h.sim.count("calico.yaml"), 3);
}

/// Story: optional add-ons failing only produce warnings
#[tokio::test]
async fn story_add_on_failures_are_not_fatal() {
    let h = Harness::new();
    h.sim.fail("kube-state-metrics");
    h.sim.fail("get configmap kube-proxy");
    let cluster = h.running_cluster("dev", 0, false).await;
    assert_eq!(cluster.status, ClusterStatus::Running);
}

#[tokio::test]
async fn network_isolation_applies_default_deny() {
    let h = Harness::new();
    let mut cluster = h.create_cluster("secure", 0, false).await;
    cluster.network_isolation = true;
    h.store.update_cluster(&cluster).await.unwrap();

    h.provisioner.provision(&cluster.id).await.unwrap();

    let manifest = h
        .sim
        .file("/tmp/default-deny-ingress.yaml")
        .expect("policy written");
    let manifest = String::from_utf8(manifest).unwrap();
    assert!(manifest.contains("kind: NetworkPolicy"));
    assert!(manifest.contains("default-deny-ingress"));
    assert_eq!(h.sim.count("apply -f /tmp/default-deny-ingress.yaml"), 1);
}

#[tokio::test]
async fn security_group_is_created_once() {
    let h = Harness::new();
    let cluster = h.create_cluster("dev", 0, false).await;
    let ctx = h.provisioner.context();

    let first = ensure_security_group(ctx, &cluster).await.unwrap();
    let second = ensure_security_group(ctx, &cluster).await.unwrap();

    assert_eq!(first.id, second.id);
    let groups = h.security_groups.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].vpc_id, VPC);
    assert_eq!(h.security_groups.rules(&first.id).len(), 6);
}

/// Story: provision then deprovision leaves nothing behind
#[tokio::test]
async fn story_deprovision_removes_everything() {
    let h = Harness::new();
    let cluster = h.running_cluster("prod", 1, true).await;
    assert_eq!(h.compute.instances().len(), 4);

    let report = h.provisioner.deprovision(&cluster.id).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.nodes_removed, 4);

    assert!(h.nodes(&cluster.id).await.is_empty());
    assert!(h.compute.instances().is_empty());
    assert!(h.security_groups.groups().is_empty());
    assert!(h.load_balancers.balancers().is_empty());
    assert_eq!(h.cluster(&cluster.id).await.status, ClusterStatus::Deleting);

    // the row itself is removed by the job worker
    h.store.delete_cluster(&cluster.id).await.unwrap();
    assert!(h.store.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn deprovision_tolerates_already_terminated_instances() {
    let h = Harness::new();
    let cluster = h.running_cluster("dev", 1, false).await;
    let nodes = h.nodes(&cluster.id).await;
    h.compute.terminate_instance(&nodes[1].instance_id).await.unwrap();

    let report = h.provisioner.deprovision(&cluster.id).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.nodes_removed, 2);
}

#[tokio::test]
async fn viewer_kubeconfig_is_not_implemented() {
    let h = Harness::new();
    let cluster = h.running_cluster("dev", 0, false).await;
    let err = h
        .provisioner
        .get_kubeconfig(&cluster.id, KubeconfigRole::Viewer)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented { .. }));
}
