//! Admin kubeconfig handling
//!
//! The kubeconfig is read from the primary control plane, checked, encrypted
//! through the Secrets service and stored as ciphertext. Plaintext only lives
//! inside [`Sensitive`] values for the duration of one call.

use kube::config::Kubeconfig;
use nimbus_common::{Cluster, Error, Result, Sensitive, API_SERVER_PORT};
use nimbus_executor::NodeExecutor;
use tracing::{debug, instrument};

use crate::bootstrap::ADMIN_CONF;
use crate::controller::Context;

/// Check that a kubeconfig points at `expected_host` and carries CA data
pub fn validate_kubeconfig(raw: &str, expected_host: &str) -> Result<()> {
    let config = Kubeconfig::from_yaml(raw)
        .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))?;

    let cluster = config
        .clusters
        .first()
        .and_then(|named| named.cluster.as_ref())
        .ok_or_else(|| Error::validation("kubeconfig has no cluster entry"))?;

    let server = cluster
        .server
        .as_deref()
        .ok_or_else(|| Error::validation("kubeconfig cluster has no server"))?;
    let expected = format!("https://{expected_host}:{API_SERVER_PORT}");
    if server != expected {
        return Err(Error::validation(format!(
            "kubeconfig server {server} does not match {expected}"
        )));
    }

    if cluster.certificate_authority_data.is_none() && cluster.certificate_authority.is_none() {
        return Err(Error::validation("kubeconfig carries no certificate authority"));
    }
    if config.auth_infos.is_empty() {
        return Err(Error::validation("kubeconfig has no credentials"));
    }
    Ok(())
}

/// Read the admin kubeconfig from a control-plane node
pub async fn read_admin_kubeconfig(exec: &dyn NodeExecutor) -> Result<Sensitive> {
    let raw = Sensitive::new(exec.run(&format!("sudo cat {ADMIN_CONF}")).await?);
    if raw.trim().is_empty() {
        return Err(Error::executor(exec.target(), format!("{ADMIN_CONF} is empty")));
    }
    Ok(raw)
}

/// Read, validate, encrypt and persist the admin kubeconfig
#[instrument(skip(ctx, cluster, exec), fields(cluster = %cluster.id))]
pub async fn store_admin_kubeconfig(
    ctx: &Context,
    cluster: &mut Cluster,
    exec: &dyn NodeExecutor,
) -> Result<()> {
    let raw = read_admin_kubeconfig(exec).await?;
    let host = cluster
        .api_host()
        .ok_or_else(|| Error::validation_for(&cluster.id, "no API endpoint recorded"))?
        .to_string();
    validate_kubeconfig(raw.expose(), &host)?;

    cluster.kubeconfig = ctx.secrets.encrypt(&cluster.user_id, raw.expose()).await?;
    ctx.store.update_cluster(cluster).await?;
    debug!("admin kubeconfig stored");
    Ok(())
}
