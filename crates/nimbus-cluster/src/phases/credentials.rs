//! Kubeconfig access and certificate rotation

use nimbus_common::{Error, KubeconfigRole, Result, Sensitive};
use tracing::{info, instrument};

use crate::controller::Context;
use crate::kubeconfig::store_admin_kubeconfig;
use crate::phases;

/// Decrypted kubeconfig for `role`
#[instrument(skip(ctx))]
pub async fn get_kubeconfig(ctx: &Context, cluster_id: &str, role: KubeconfigRole) -> Result<Sensitive> {
    let cluster = ctx.store.get_cluster(cluster_id).await?;
    match role {
        KubeconfigRole::Admin => {
            if cluster.kubeconfig.is_empty() {
                return Err(Error::not_found("kubeconfig", cluster_id));
            }
            ctx.secrets.decrypt(&cluster.user_id, &cluster.kubeconfig).await
        }
        KubeconfigRole::Viewer => Err(Error::not_implemented("viewer kubeconfig")),
    }
}

/// Renew every control-plane certificate and re-store the admin kubeconfig
#[instrument(skip(ctx))]
pub async fn rotate_secrets(ctx: &Context, cluster_id: &str) -> Result<()> {
    let mut cluster = ctx.store.get_cluster(cluster_id).await?;
    let primary = phases::primary_executor(ctx, &cluster, "rotate secrets").await?;

    primary.run("sudo kubeadm certs renew all").await?;
    store_admin_kubeconfig(ctx, &mut cluster, primary.as_ref()).await?;
    info!("certificates renewed");
    Ok(())
}
