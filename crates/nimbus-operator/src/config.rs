//! Process configuration
//!
//! Every flag falls back to a `NIMBUS_*` environment variable.

use std::time::Duration;

use clap::Parser;
use nimbus_cluster::ProvisionerConfig;
use nimbus_common::telemetry::LogFormat;
use nimbus_executor::ExecutorConfig;

use crate::worker::WorkerConfig;

/// nimbus - Kubernetes cluster lifecycle controller
#[derive(Parser, Debug, Clone)]
#[command(name = "nimbus-operator", version, about, long_about = None)]
pub struct Config {
    /// Queue the worker consumes jobs from
    #[arg(long, env = "NIMBUS_QUEUE", default_value = "k8s_jobs")]
    pub queue: String,

    /// Jobs processed at the same time
    #[arg(long, env = "NIMBUS_MAX_CONCURRENT_JOBS", default_value_t = 10)]
    pub max_concurrent_jobs: usize,

    /// Pause after an empty or failed dequeue, in milliseconds
    #[arg(long, env = "NIMBUS_QUEUE_POLL_BACKOFF_MS", default_value_t = 1000)]
    pub queue_poll_backoff_ms: u64,

    /// Spacing between reconcile passes, in seconds
    #[arg(long, env = "NIMBUS_RECONCILE_INTERVAL_SECS", default_value_t = 300)]
    pub reconcile_interval_secs: u64,

    /// Upper bound for a provision job, in seconds
    #[arg(long, env = "NIMBUS_PROVISION_TIMEOUT_SECS", default_value_t = 1800)]
    pub provision_timeout_secs: u64,

    /// Upper bound for every other job, in seconds
    #[arg(long, env = "NIMBUS_JOB_TIMEOUT_SECS", default_value_t = 1800)]
    pub job_timeout_secs: u64,

    /// Machine image nodes boot from
    #[arg(long, env = "NIMBUS_NODE_IMAGE", default_value = "ubuntu-22.04-kubeadm")]
    pub node_image: String,

    /// Login user for the SSH fallback
    #[arg(long, env = "NIMBUS_SSH_USER", default_value = "ubuntu")]
    pub ssh_user: String,

    /// Log output: text or json
    #[arg(long, env = "NIMBUS_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Seed a sandbox cluster with this name and enqueue its provision job
    #[arg(long)]
    pub demo_cluster: Option<String>,
}

impl Config {
    /// Worker settings
    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            queue: self.queue.clone(),
            max_concurrent_jobs: self.max_concurrent_jobs.max(1),
            poll_backoff: Duration::from_millis(self.queue_poll_backoff_ms),
            provision_timeout: Duration::from_secs(self.provision_timeout_secs),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
        }
    }

    /// Provisioner settings; timings keep their defaults
    pub fn provisioner(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            node_image: self.node_image.clone(),
            ..ProvisionerConfig::default()
        }
    }

    /// Executor settings; timings keep their defaults
    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            ssh_user: self.ssh_user.clone(),
            ..ExecutorConfig::default()
        }
    }

    /// Spacing between reconcile passes
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::try_parse_from(["nimbus-operator"]).unwrap();
        assert_eq!(config.queue, "k8s_jobs");
        assert_eq!(config.max_concurrent_jobs, 10);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.demo_cluster.is_none());

        let worker = config.worker();
        assert_eq!(worker.poll_backoff, Duration::from_secs(1));
        assert_eq!(worker.provision_timeout, Duration::from_secs(1800));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(300));
        assert_eq!(config.provisioner().node_image, "ubuntu-22.04-kubeadm");
        assert_eq!(config.executor().ssh_user, "ubuntu");
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "nimbus-operator",
            "--queue",
            "jobs-eu",
            "--max-concurrent-jobs",
            "0",
            "--log-format",
            "json",
            "--demo-cluster",
            "dev",
        ])
        .unwrap();
        assert_eq!(config.queue, "jobs-eu");
        assert_eq!(config.worker().max_concurrent_jobs, 1);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.demo_cluster.as_deref(), Some("dev"));
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Config::try_parse_from(["nimbus-operator", "--log-format", "xml"]).is_err());
    }
}
