//! kubeadm command construction and output parsing

use nimbus_common::{Error, Result, API_SERVER_PORT};

use super::POD_NETWORK_CIDR;

/// Join commands printed by `kubeadm init` or `kubeadm token create`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinCommands {
    /// Worker join (no `--control-plane`)
    pub worker: String,
    /// Control-plane join with `--control-plane --certificate-key`, HA only
    pub control_plane: Option<String>,
}

/// Build the `kubeadm init` command.
///
/// `control_plane_endpoint` is the HA load-balancer address; with it the
/// control-plane certificates are uploaded so secondaries can join.
pub fn init_command(version: &str, advertise_ip: &str, control_plane_endpoint: Option<&str>) -> String {
    let mut cmd = format!(
        "sudo kubeadm init --kubernetes-version={version} --pod-network-cidr={POD_NETWORK_CIDR} \
         --apiserver-cert-extra-sans={advertise_ip} --ignore-preflight-errors=all"
    );
    if let Some(endpoint) = control_plane_endpoint {
        cmd.push_str(&format!(
            " --control-plane-endpoint={endpoint}:{API_SERVER_PORT} --upload-certs"
        ));
    }
    cmd
}

/// Ask the API for a fresh worker join command valid for one hour
pub const TOKEN_CREATE_COMMAND: &str = "sudo kubeadm token create --print-join-command --ttl=1h";

/// Prefix a join command for execution on the node
pub fn join_invocation(join: &str) -> String {
    format!("sudo {join} --ignore-preflight-errors=all")
}

/// Extract the join commands from kubeadm output.
///
/// A command starts on the line containing `kubeadm join` and runs over
/// backslash continuations until a blank line. The block containing
/// `--control-plane` is the control-plane join, the first other block is the
/// worker join; their order in the output does not matter.
pub fn parse_join_commands(output: &str) -> Result<JoinCommands> {
    let mut worker = None;
    let mut control_plane = None;

    for block in join_blocks(output) {
        if block.contains("--control-plane") {
            control_plane.get_or_insert(block);
        } else {
            worker.get_or_insert(block);
        }
    }

    let worker = match (worker, &control_plane) {
        (Some(w), _) => w,
        // the worker form is the control-plane form without its two flags
        (None, Some(cp)) => strip_control_plane_flags(cp),
        (None, None) => {
            return Err(Error::validation(
                "kubeadm output does not contain a join command",
            ))
        }
    };

    Ok(JoinCommands {
        worker,
        control_plane,
    })
}

fn join_blocks(output: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<String>> = None;

    for line in output.lines() {
        let trimmed = line.trim();

        if let Some(parts) = current.as_mut() {
            if trimmed.is_empty() {
                blocks.push(parts.join(" "));
                current = None;
                continue;
            }
            parts.push(trimmed.trim_end_matches('\\').trim().to_string());
            continue;
        }

        if let Some(start) = trimmed.find("kubeadm join") {
            let first = trimmed[start..].trim_end_matches('\\').trim().to_string();
            current = Some(vec![first]);
        }
    }
    if let Some(parts) = current {
        blocks.push(parts.join(" "));
    }

    blocks
        .into_iter()
        .map(|b| b.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

fn strip_control_plane_flags(cmd: &str) -> String {
    let mut out = Vec::new();
    let mut words = cmd.split_whitespace();
    while let Some(word) = words.next() {
        match word {
            "--control-plane" => {}
            "--certificate-key" => {
                words.next();
            }
            w if w.starts_with("--certificate-key=") => {}
            w => out.push(w),
        }
    }
    out.join(" ")
}

/// Validate a `vMAJOR.MINOR.PATCH` version string
pub fn validate_version(version: &str) -> Result<()> {
    let parts: Vec<&str> = version
        .strip_prefix('v')
        .map(|v| v.split('.').collect())
        .unwrap_or_default();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit())) {
        return Err(Error::validation(format!(
            "version '{version}' is not of the form vMAJOR.MINOR.PATCH"
        )));
    }
    Ok(())
}

/// Debian package version for a Kubernetes version: `v1.30.0` becomes `1.30.0-1.1`
pub fn package_version(version: &str) -> String {
    format!("{}-1.1", version.trim_start_matches('v'))
}

/// Package repository channel: `v1.30.0` becomes `v1.30`
pub fn minor_channel(version: &str) -> String {
    let mut parts = version.splitn(3, '.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{major}.{minor}"),
        _ => version.to_string(),
    }
}

/// Which kubeadm upgrade a node runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeTarget {
    /// The primary control plane: `kubeadm upgrade apply`
    PrimaryControlPlane,
    /// Secondary control planes and workers: `kubeadm upgrade node`
    Node,
}

/// Upgrade script for one node
pub fn upgrade_script(version: &str, target: UpgradeTarget) -> String {
    let pkg = package_version(version);
    let channel = minor_channel(version);
    let upgrade = match target {
        UpgradeTarget::PrimaryControlPlane => format!("sudo kubeadm upgrade apply {version} -y"),
        UpgradeTarget::Node => "sudo kubeadm upgrade node".to_string(),
    };

    format!(
        r#"set -e
sudo sed -i 's#/v1\.[0-9]*/deb/#/{channel}/deb/#' /etc/apt/sources.list.d/kubernetes.list
sudo apt-mark unhold kubeadm
sudo apt-get update
sudo apt-get install -y kubeadm={pkg}
sudo apt-mark hold kubeadm
{upgrade}
sudo apt-mark unhold kubelet kubectl
sudo apt-get install -y kubelet={pkg} kubectl={pkg}
sudo apt-mark hold kubelet kubectl
sudo systemctl daemon-reload
sudo systemctl restart kubelet
"#
    )
}
