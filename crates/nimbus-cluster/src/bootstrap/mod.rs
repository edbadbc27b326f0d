//! Scripts run on nodes
//!
//! - [`node_bootstrap_script`] prepares a fresh instance for kubeadm
//! - [`kubeadm`] builds init, join and upgrade commands and parses their output
//! - [`cni`] installs networking and the cluster add-ons

pub mod cni;
pub mod kubeadm;

use nimbus_common::Result;
use nimbus_executor::NodeExecutor;
use tracing::{debug, instrument};

/// Admin kubeconfig written by kubeadm init
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

/// kubectl bound to the admin kubeconfig on a control-plane node
pub const KUBECTL: &str = "sudo kubectl --kubeconfig=/etc/kubernetes/admin.conf";

/// Calico release installed as the CNI
pub const CALICO_VERSION: &str = "v3.27.0";

/// Pod network handed to kubeadm; matches Calico's default pool
pub const POD_NETWORK_CIDR: &str = "192.168.0.0/16";

/// Seconds to wait for systemd to finish booting
const INIT_WAIT_SECS: u32 = 60;

/// Seconds to wait for kubelet to report active
const KUBELET_WAIT_SECS: u32 = 15;

/// Stale kubeadm artifacts removed before init or join
const STALE_ARTIFACTS: &[&str] = &[
    "/etc/kubernetes/pki",
    "/etc/kubernetes/admin.conf",
    "/etc/kubernetes/super-admin.conf",
    "/etc/kubernetes/kubelet.conf",
    "/etc/kubernetes/bootstrap-kubelet.conf",
    "/etc/kubernetes/controller-manager.conf",
    "/etc/kubernetes/scheduler.conf",
];

/// Calico images pulled ahead of the CNI install
pub fn cni_images() -> Vec<String> {
    ["cni", "node", "kube-controllers"]
        .iter()
        .map(|component| format!("docker.io/calico/{component}:{CALICO_VERSION}"))
        .collect()
}

/// Shell script preparing a node for kubeadm.
///
/// Order matters: the kernel settings must be in place before the runtime
/// and kubelet restart, and stale certificates must be gone before kubelet
/// comes back up.
pub fn node_bootstrap_script() -> String {
    let stale = STALE_ARTIFACTS.join(" ");
    let images = cni_images().join(" ");

    format!(
        r#"set -e

# init system
for i in $(seq 1 {INIT_WAIT_SECS}); do
  state=$(systemctl is-system-running 2>/dev/null || true)
  if [ "$state" = "running" ] || [ "$state" = "degraded" ]; then
    break
  fi
  sleep 1
done

# kernel
sudo modprobe br_netfilter || true
cat <<'EOF' | sudo tee /etc/sysctl.d/99-kubernetes.conf >/dev/null
net.bridge.bridge-nf-call-iptables = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward = 1
kernel.panic_on_oops = 1
kernel.panic = 10
EOF
sudo sysctl --system >/dev/null

# container runtime
sudo systemctl enable --now containerd
sudo systemctl is-active --quiet containerd

# stale kubeadm state
sudo rm -rf {stale}

# kubelet
echo 'KUBELET_EXTRA_ARGS=--fail-swap-on=false' | sudo tee /etc/default/kubelet >/dev/null
sudo systemctl daemon-reload
sudo systemctl restart kubelet || true
for i in $(seq 1 {KUBELET_WAIT_SECS}); do
  if systemctl is-active --quiet kubelet; then
    break
  fi
  sleep 1
done

# cni images
for image in {images}; do
  sudo crictl pull "$image" >/dev/null 2>&1 || true
done
"#
    )
}

/// Run the bootstrap script on a node
#[instrument(skip(exec), fields(node = %exec.target()))]
pub async fn bootstrap_node(exec: &dyn NodeExecutor) -> Result<()> {
    exec.run(&node_bootstrap_script()).await?;
    debug!("node bootstrapped");
    Ok(())
}
