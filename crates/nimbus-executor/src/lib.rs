//! Remote command execution on cluster nodes
//!
//! A [`NodeExecutor`] runs one shell command on one node and returns its
//! stdout. Two transports exist: in-engine exec through the compute backend
//! ([`ServiceExecutor`]) and SSH ([`SshExecutor`]). The [`ExecutorResolver`]
//! is the only place that decides which one a node gets.
//!
//! Executors never log command output; it may contain kubeconfigs or join
//! tokens.

#![deny(missing_docs)]

pub mod mock;
pub mod resolver;
pub mod service;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use nimbus_common::{Error, Result};
use tracing::debug;

pub use mock::{MockExecutor, MockExecutorResolver};
pub use resolver::{strip_cidr, DefaultExecutorResolver, ExecutorResolver};
pub use service::ServiceExecutor;
pub use ssh::SshExecutor;

/// Command used to probe readiness
pub const READY_PROBE: &str = "echo ready";

/// Timing for executors
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Upper bound for a single remote command
    pub command_timeout: Duration,
    /// SSH TCP dial plus handshake
    pub ssh_connect_timeout: Duration,
    /// Readiness probe spacing for in-engine exec
    pub service_ready_tick: Duration,
    /// Readiness probe spacing for SSH
    pub ssh_ready_tick: Duration,
    /// Login user for SSH
    pub ssh_user: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(15 * 60),
            ssh_connect_timeout: Duration::from_secs(10),
            service_ready_tick: Duration::from_millis(500),
            ssh_ready_tick: Duration::from_secs(2),
            ssh_user: nimbus_common::DEFAULT_SSH_USER.to_string(),
        }
    }
}

/// Runs shell commands on one node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run a command through `/bin/sh -c` and return stdout
    async fn run(&self, command: &str) -> Result<String>;

    /// Probe the node until it answers or `timeout` expires
    async fn wait_for_ready(&self, timeout: Duration) -> Result<()>;

    /// Address or instance the executor talks to, for logs and errors
    fn target(&self) -> String;
}

/// Probe `executor` with [`READY_PROBE`] every `tick` until it answers.
pub(crate) async fn probe_until_ready<E>(executor: &E, timeout: Duration, tick: Duration) -> Result<()>
where
    E: NodeExecutor + ?Sized,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        match executor.run(READY_PROBE).await {
            Ok(out) if out.contains("ready") => return Ok(()),
            Ok(_) => debug!(target = %executor.target(), "readiness probe returned unexpected output"),
            Err(e) => debug!(target = %executor.target(), error = %e, "node not ready yet"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::timeout(
                format!("node {} to accept commands", executor.target()),
                timeout,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn probe_succeeds_once_node_answers() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut exec = MockNodeExecutor::new();
        exec.expect_target().returning(|| "10.0.0.2".to_string());
        exec.expect_run().returning(move |cmd| {
            assert_eq!(cmd, READY_PROBE);
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::executor("10.0.0.2", "connection refused"))
            } else {
                Ok("ready\n".to_string())
            }
        });

        probe_until_ready(&exec, Duration::from_secs(30), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_times_out() {
        let mut exec = MockNodeExecutor::new();
        exec.expect_target().returning(|| "10.0.0.2".to_string());
        exec.expect_run()
            .returning(|_| Err(Error::executor("10.0.0.2", "connection refused")));

        let err = probe_until_ready(&exec, Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("10.0.0.2"));
    }

    #[test]
    fn default_config_matches_documented_timings() {
        let c = ExecutorConfig::default();
        assert_eq!(c.ssh_connect_timeout, Duration::from_secs(10));
        assert_eq!(c.service_ready_tick, Duration::from_millis(500));
        assert_eq!(c.ssh_ready_tick, Duration::from_secs(2));
        assert_eq!(c.ssh_user, "ubuntu");
    }
}
