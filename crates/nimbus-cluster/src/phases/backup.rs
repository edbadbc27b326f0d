//! etcd snapshots to and from the object store
//!
//! Both directions run on the primary control plane and move the snapshot as
//! base64 text through the executor.

use chrono::Utc;
use nimbus_common::{Error, Result, BACKUP_BUCKET};
use nimbus_executor::NodeExecutor;
use tracing::{debug, info, instrument, warn};

use crate::controller::Context;
use crate::phases;
use crate::transport::{self, RESTORE_PATH, RESTORE_STAGING_PATH};

/// etcdctl against the local member with the server certificate triplet
pub const ETCDCTL: &str = "sudo ETCDCTL_API=3 etcdctl --endpoints=https://127.0.0.1:2379 \
--cacert=/etc/kubernetes/pki/etcd/ca.crt \
--cert=/etc/kubernetes/pki/etcd/server.crt \
--key=/etc/kubernetes/pki/etcd/server.key";

/// Snapshot etcd and upload it; returns the object key
#[instrument(skip(ctx))]
pub async fn create_backup(ctx: &Context, cluster_id: &str) -> Result<String> {
    let cluster = ctx.store.get_cluster(cluster_id).await?;
    let primary = phases::primary_executor(ctx, &cluster, "backup").await?;

    let timestamp = Utc::now().timestamp();
    let snapshot = transport::snapshot_path(timestamp);
    primary
        .run(&format!("{ETCDCTL} snapshot save {snapshot}"))
        .await?;

    let encoded = primary.run(&transport::read_file_command(&snapshot)).await;
    if let Err(e) = primary.run(&format!("sudo rm -f {snapshot}")).await {
        warn!(path = %snapshot, error = %e, "failed to remove snapshot from node");
    }
    let data = transport::decode_output(&encoded?)?;

    let key = transport::object_key(&cluster.id, timestamp);
    let size = data.len();
    ctx.objects
        .upload(&cluster.user_id, BACKUP_BUCKET, &key, data)
        .await?;
    info!(bucket = BACKUP_BUCKET, key = %key, bytes = size, "etcd snapshot uploaded");
    Ok(key)
}

/// Reject keys outside the cluster's own `{cluster_id}/` prefix
pub fn validate_backup_path(cluster_id: &str, path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(Error::validation_for(cluster_id, "backup path is empty"));
    }
    if path.starts_with('/') || path.split('/').any(|segment| segment == "..") {
        return Err(Error::validation_for(
            cluster_id,
            format!("backup path {path} must be a relative object key"),
        ));
    }
    if !path.starts_with(&format!("{cluster_id}/")) {
        return Err(Error::validation_for(
            cluster_id,
            format!("backup path {path} belongs to another cluster"),
        ));
    }
    Ok(())
}

/// Script swapping `/var/lib/etcd` for the snapshot at [`RESTORE_PATH`].
///
/// A failing step puts the previous data directory and the etcd manifest back
/// and starts kubelet again.
pub fn restore_script(timestamp: i64) -> String {
    format!(
        r#"set -e
rollback_on_error() {{
  status=$?
  [ "$status" -eq 0 ] && return
  set +e
  if [ -d /var/lib/etcd.bak-{timestamp} ]; then
    sudo rm -rf /var/lib/etcd
    sudo mv /var/lib/etcd.bak-{timestamp} /var/lib/etcd
  fi
  if [ -f /etc/kubernetes/manifests-restore/etcd.yaml ]; then
    sudo mv /etc/kubernetes/manifests-restore/etcd.yaml /etc/kubernetes/manifests/etcd.yaml
  fi
  sudo systemctl start kubelet
  exit "$status"
}}
trap rollback_on_error EXIT
sudo systemctl stop kubelet
sudo mkdir -p /etc/kubernetes/manifests-restore
sudo mv /etc/kubernetes/manifests/etcd.yaml /etc/kubernetes/manifests-restore/etcd.yaml
sudo crictl ps --name etcd -q | xargs -r sudo crictl stop || true
sudo mv /var/lib/etcd /var/lib/etcd.bak-{timestamp}
{ETCDCTL} snapshot restore {RESTORE_PATH} --data-dir=/var/lib/etcd --name=$(hostname) \
--initial-cluster=$(hostname)=https://127.0.0.1:2380 \
--initial-advertise-peer-urls=https://127.0.0.1:2380
sudo chown -R root:root /var/lib/etcd
sudo mv /etc/kubernetes/manifests-restore/etcd.yaml /etc/kubernetes/manifests/etcd.yaml
sudo systemctl start kubelet
sudo rm -f {RESTORE_PATH}
"#
    )
}

/// Download a snapshot and restore etcd on the primary control plane
#[instrument(skip(ctx))]
pub async fn restore(ctx: &Context, cluster_id: &str, backup_path: &str) -> Result<()> {
    validate_backup_path(cluster_id, backup_path)?;
    let cluster = ctx.store.get_cluster(cluster_id).await?;
    let primary = phases::primary_executor(ctx, &cluster, "restore").await?;

    let (data, object) = ctx
        .objects
        .download(&cluster.user_id, BACKUP_BUCKET, backup_path)
        .await?;
    debug!(key = %object.key, bytes = data.len(), "snapshot downloaded");

    let commands = transport::write_file_commands(
        RESTORE_PATH,
        RESTORE_STAGING_PATH,
        &data,
        ctx.config.restore_single_line_limit,
        ctx.config.restore_chunk_size,
    );
    if let Err(e) = apply_snapshot(primary.as_ref(), &commands).await {
        let cleanup = format!("sudo rm -f {RESTORE_PATH} {RESTORE_STAGING_PATH}");
        if let Err(rm) = primary.run(&cleanup).await {
            warn!(error = %rm, "failed to remove restore files from node");
        }
        return Err(e);
    }
    info!(key = %backup_path, target = %primary.target(), "etcd restored");
    Ok(())
}

async fn apply_snapshot(exec: &dyn NodeExecutor, commands: &[String]) -> Result<()> {
    for cmd in commands {
        exec.run(cmd).await?;
    }
    exec.run(&restore_script(Utc::now().timestamp())).await?;
    Ok(())
}
