//! Job-queue worker
//!
//! Pops serialized jobs from the task queue and runs each on its own task,
//! at most `max_concurrent_jobs` at a time. Jobs on the same cluster are
//! serialized through the shared [`BusySet`]; a job waiting for its cluster
//! gives its slot back until the cluster is free. Shutdown stops the dequeue
//! loop only; jobs already dispatched run to completion.
//!
//! Around every job the worker stamps a fresh `job_id` on the cluster and,
//! once the handler returns, leaves the cluster `running`, `failed` or
//! removed, with `job_id` cleared.

use std::sync::Arc;
use std::time::Duration;

use nimbus_cluster::{BusyGuard, BusySet, Provisioner};
use nimbus_common::{ClusterJob, ClusterStatus, ClusterStore, Error, JobType, Result, TaskQueue};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// Queue the worker reads by default
pub const DEFAULT_QUEUE: &str = "k8s_jobs";

/// Worker settings
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Queue name
    pub queue: String,
    /// Jobs in flight at once
    pub max_concurrent_jobs: usize,
    /// Pause after an empty or failed dequeue
    pub poll_backoff: Duration,
    /// Upper bound for provision jobs
    pub provision_timeout: Duration,
    /// Upper bound for every other job
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_concurrent_jobs: 10,
            poll_backoff: Duration::from_secs(1),
            provision_timeout: Duration::from_secs(30 * 60),
            job_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl WorkerConfig {
    fn timeout_for(&self, job_type: &JobType) -> Duration {
        match job_type {
            JobType::Provision => self.provision_timeout,
            _ => self.job_timeout,
        }
    }
}

/// Consumes lifecycle jobs from the task queue
#[derive(Clone)]
pub struct JobWorker {
    provisioner: Provisioner,
    store: Arc<dyn ClusterStore>,
    queue: Arc<dyn TaskQueue>,
    busy: BusySet,
    permits: Arc<Semaphore>,
    slots: usize,
    tasks: TaskTracker,
    config: WorkerConfig,
}

impl JobWorker {
    /// Create a worker; the cluster store is taken from the provisioner
    pub fn new(
        provisioner: Provisioner,
        queue: Arc<dyn TaskQueue>,
        busy: BusySet,
        config: WorkerConfig,
    ) -> Self {
        let slots = config.max_concurrent_jobs.clamp(1, 1024);
        Self {
            store: provisioner.context().store.clone(),
            provisioner,
            queue,
            busy,
            permits: Arc::new(Semaphore::new(slots)),
            slots,
            tasks: TaskTracker::new(),
            config,
        }
    }

    /// Dequeue and dispatch jobs until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            queue = %self.config.queue,
            max_concurrent_jobs = self.slots,
            "job worker started"
        );

        loop {
            // hold a slot before popping so a dequeued job always has one
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dequeued = tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.queue.dequeue(&self.config.queue) => dequeued,
            };

            match dequeued {
                Ok(Some(payload)) => {
                    if let Some(job) = accept(&payload) {
                        self.dispatch(job, permit);
                    }
                }
                Ok(None) => {
                    drop(permit);
                    if !self.pause(&shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(queue = %self.config.queue, error = %e, "dequeue failed");
                    if !self.pause(&shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("job worker stopped");
    }

    /// Wait until every dispatched job has finished
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Process one job to completion, holding the cluster's busy guard
    pub async fn handle(&self, job: ClusterJob) -> Result<()> {
        self.process(job, None).await
    }

    #[instrument(skip(self, job, slot), fields(cluster = %job.cluster_id, job_type = %job.job_type))]
    async fn process(&self, job: ClusterJob, slot: Option<OwnedSemaphorePermit>) -> Result<()> {
        let (_guard, _slot) = self.claim(&job.cluster_id, slot).await?;

        let job_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.stamp(&job.cluster_id, &job_id).await {
            warn!(error = %e, "cannot start job");
            return Err(e);
        }
        info!(job_id = %job_id, "job started");

        let limit = self.config.timeout_for(&job.job_type);
        let (result, timed_out) = match tokio::time::timeout(limit, self.execute(&job)).await {
            Ok(result) => (result, false),
            Err(_) => (
                Err(Error::timeout(
                    format!("{} job on cluster {}", job.job_type, job.cluster_id),
                    limit,
                )),
                true,
            ),
        };

        self.finish(&job, &result, timed_out).await;
        match &result {
            Ok(()) => info!(job_id = %job_id, "job finished"),
            Err(e) => warn!(job_id = %job_id, error = %e, "job failed"),
        }
        result
    }

    fn dispatch(&self, job: ClusterJob, slot: OwnedSemaphorePermit) {
        let worker = self.clone();
        self.tasks.spawn(async move {
            // outcome is logged and persisted by process
            let _ = worker.process(job, Some(slot)).await;
        });
    }

    /// Claim the cluster and a job slot. A slot is never held while waiting
    /// for a busy cluster, so other clusters keep moving.
    async fn claim(
        &self,
        cluster_id: &str,
        slot: Option<OwnedSemaphorePermit>,
    ) -> Result<(BusyGuard, OwnedSemaphorePermit)> {
        if let Some(guard) = self.busy.try_acquire(cluster_id) {
            let slot = match slot {
                Some(slot) => slot,
                None => self.slot().await?,
            };
            return Ok((guard, slot));
        }

        drop(slot);
        debug!("cluster busy, waiting");
        let guard = self.busy.acquire(cluster_id).await;
        let slot = self.slot().await?;
        Ok((guard, slot))
    }

    async fn slot(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("job slots closed"))
    }

    async fn execute(&self, job: &ClusterJob) -> Result<()> {
        let id = job.cluster_id.as_str();
        match job.job_type {
            JobType::Provision => self.provisioner.provision(id).await,
            JobType::Deprovision => {
                let report = self.provisioner.deprovision(id).await?;
                if !report.is_clean() {
                    warn!(
                        nodes_removed = report.nodes_removed,
                        errors = ?report.errors,
                        "teardown left errors behind"
                    );
                }
                self.store.delete_cluster(id).await
            }
            JobType::Upgrade => {
                let version = job
                    .version
                    .as_deref()
                    .ok_or_else(|| Error::validation_for(id, "upgrade job carries no version"))?;
                self.provisioner.upgrade(id, version).await
            }
            JobType::Scale => {
                let report = self.provisioner.scale(id).await?;
                debug!(?report, "scale finished");
                Ok(())
            }
            JobType::Repair => self.provisioner.repair(id).await,
            JobType::RotateSecrets => self.provisioner.rotate_secrets(id).await,
            JobType::Backup => {
                let key = self.provisioner.create_backup(id).await?;
                info!(key = %key, "backup stored");
                Ok(())
            }
            JobType::Restore => {
                let path = job
                    .backup_path
                    .as_deref()
                    .ok_or_else(|| Error::validation_for(id, "restore job carries no backup path"))?;
                self.provisioner.restore(id, path).await
            }
            JobType::Unknown => Ok(()),
        }
    }

    async fn stamp(&self, cluster_id: &str, job_id: &str) -> Result<()> {
        let mut cluster = self.store.get_cluster(cluster_id).await?;
        cluster.job_id = Some(job_id.to_string());
        self.store.update_cluster(&cluster).await
    }

    async fn finish(&self, job: &ClusterJob, result: &Result<()>, timed_out: bool) {
        let mut cluster = match self.store.get_cluster(&job.cluster_id).await {
            Ok(cluster) => cluster,
            Err(Error::NotFound { .. }) => return,
            Err(e) => {
                warn!(error = %e, "cannot load cluster to settle job");
                return;
            }
        };

        let status = match result {
            _ if timed_out => ClusterStatus::Failed,
            _ if cluster.status.is_terminal() => cluster.status,
            Ok(()) => ClusterStatus::Running,
            Err(_) => ClusterStatus::Failed,
        };
        if status != cluster.status {
            info!(from = %cluster.status, to = %status, "settling cluster after job");
        }
        cluster.status = status;
        cluster.job_id = None;
        if let Err(e) = self.store.update_cluster(&cluster).await {
            warn!(error = %e, "failed to persist job outcome");
        }
    }

    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.poll_backoff) => true,
        }
    }
}

/// Parse a payload, dropping anything that cannot be acted on
fn accept(payload: &str) -> Option<ClusterJob> {
    let job = match ClusterJob::parse(payload) {
        Ok(job) => job,
        Err(e) => {
            warn!(error = %e, bytes = payload.len(), "dropping malformed job payload");
            return None;
        }
    };
    if job.job_type == JobType::Unknown {
        warn!(cluster = %job.cluster_id, "ignoring job of unknown type");
        return None;
    }
    Some(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_drops_malformed_and_unknown() {
        assert!(accept("{not json").is_none());
        assert!(accept(r#"{"user_id":"u-1","type":"provision"}"#).is_none());
        assert!(accept(r#"{"cluster_id":"c-1","user_id":"u-1","type":"defragment"}"#).is_none());

        let job = accept(r#"{"cluster_id":"c-1","user_id":"u-1","type":"upgrade","version":"v1.30.1"}"#)
            .unwrap();
        assert_eq!(job.job_type, JobType::Upgrade);
        assert_eq!(job.version.as_deref(), Some("v1.30.1"));
    }

    #[test]
    fn provision_uses_its_own_timeout() {
        let config = WorkerConfig {
            provision_timeout: Duration::from_secs(10),
            job_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        };
        assert_eq!(config.timeout_for(&JobType::Provision), Duration::from_secs(10));
        assert_eq!(config.timeout_for(&JobType::Backup), Duration::from_secs(5));
        assert_eq!(config.timeout_for(&JobType::Deprovision), Duration::from_secs(5));
    }
}
