//! Periodic health reconciliation
//!
//! Every tick (and once at startup) the reconciler checks each `running`
//! cluster that has no job in flight and repairs the unhealthy ones. Errors
//! are logged per cluster; a pass never aborts early and the next tick
//! retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use nimbus_common::{ClusterHealth, ClusterStatus, ClusterStore, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::guard::BusySet;

/// Default spacing between passes
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Health check and repair, as the reconciler needs them
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Healer: Send + Sync {
    /// Current health of a cluster
    async fn health(&self, cluster_id: &str) -> Result<ClusterHealth>;

    /// Repair a cluster
    async fn repair(&self, cluster_id: &str) -> Result<()>;
}

/// Outcome of one reconcile pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Clusters whose health was checked
    pub checked: usize,
    /// Clusters repaired successfully
    pub repaired: usize,
    /// Running clusters skipped because work was in flight
    pub skipped: usize,
    /// Clusters whose check or repair failed
    pub errors: usize,
}

/// Repairs running clusters that report unhealthy
pub struct Reconciler {
    healer: Arc<dyn Healer>,
    store: Arc<dyn ClusterStore>,
    busy: BusySet,
    interval: Duration,
}

impl Reconciler {
    /// Create a reconciler running every [`DEFAULT_RECONCILE_INTERVAL`]
    pub fn new(healer: Arc<dyn Healer>, store: Arc<dyn ClusterStore>, busy: BusySet) -> Self {
        Self {
            healer,
            store,
            busy,
            interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    /// Override the spacing between passes
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run passes until `shutdown` is cancelled; the first pass is immediate
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_secs = self.interval.as_secs(), "reconciler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.reconcile_once().await;
                    debug!(?report, "reconcile pass finished");
                }
            }
        }
    }

    /// Check every eligible cluster once
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let clusters = match self.store.list_all().await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "failed to list clusters");
                report.errors += 1;
                return report;
            }
        };

        for cluster in clusters {
            if cluster.status != ClusterStatus::Running {
                continue;
            }
            if cluster.job_id.is_some() {
                report.skipped += 1;
                continue;
            }
            let Some(_guard) = self.busy.try_acquire(&cluster.id) else {
                report.skipped += 1;
                continue;
            };

            report.checked += 1;
            let health = match self.healer.health(&cluster.id).await {
                Ok(health) => health,
                Err(e) => {
                    warn!(cluster = %cluster.id, error = %e, "health check failed");
                    report.errors += 1;
                    continue;
                }
            };
            if health.is_healthy() {
                continue;
            }

            info!(
                cluster = %cluster.id,
                api_server = health.api_server,
                nodes_ready = health.nodes_ready,
                nodes_total = health.nodes_total,
                message = %health.message,
                "cluster unhealthy, repairing"
            );
            match self.healer.repair(&cluster.id).await {
                Ok(()) => report.repaired += 1,
                Err(e) => {
                    warn!(cluster = %cluster.id, error = %e, "repair failed");
                    report.errors += 1;
                }
            }
        }
        report
    }
}
