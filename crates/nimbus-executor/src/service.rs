//! In-engine exec through the compute backend

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::{ComputeBackend, Error, Result};

use crate::{probe_until_ready, ExecutorConfig, NodeExecutor};

/// Runs commands with the compute backend's `exec` on a known instance.
///
/// Preferred whenever the node is a container-backed instance the engine can
/// reach directly; no SSH key is needed.
pub struct ServiceExecutor {
    compute: Arc<dyn ComputeBackend>,
    instance_id: String,
    config: ExecutorConfig,
}

impl ServiceExecutor {
    /// Create an executor for an instance
    pub fn new(
        compute: Arc<dyn ComputeBackend>,
        instance_id: impl Into<String>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            compute,
            instance_id: instance_id.into(),
            config,
        }
    }

    /// Instance commands run on
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[async_trait]
impl NodeExecutor for ServiceExecutor {
    async fn run(&self, command: &str) -> Result<String> {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()];

        match tokio::time::timeout(
            self.config.command_timeout,
            self.compute.exec(&self.instance_id, &argv),
        )
        .await
        {
            Ok(Ok(stdout)) => Ok(stdout),
            Ok(Err(e @ Error::Executor { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::executor(&self.instance_id, e.to_string())),
            Err(_) => Err(Error::timeout(
                format!("command on {}", self.instance_id),
                self.config.command_timeout,
            )),
        }
    }

    async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        probe_until_ready(self, timeout, self.config.service_ready_tick).await
    }

    fn target(&self) -> String {
        self.instance_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::memory::MemCompute;
    use nimbus_common::services::LaunchRequest;

    async fn launched(compute: &MemCompute) -> String {
        compute
            .launch_instance(&LaunchRequest {
                name: "dev-master-0".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn wraps_command_in_shell() {
        let compute = MemCompute::new()
            .with_exec_handler(Arc::new(|_, argv| Ok(argv.join("|"))));
        let id = launched(&compute).await;
        let exec = ServiceExecutor::new(Arc::new(compute), id, ExecutorConfig::default());

        let out = exec.run("kubectl get nodes").await.unwrap();
        assert_eq!(out, "/bin/sh|-c|kubectl get nodes");
    }

    #[tokio::test]
    async fn backend_failures_become_executor_errors() {
        let compute = MemCompute::new();
        let exec = ServiceExecutor::new(Arc::new(compute), "i-missing", ExecutorConfig::default());

        let err = exec.run("true").await.unwrap_err();
        assert!(matches!(err, Error::Executor { .. }));
        assert!(err.to_string().contains("i-missing"));
    }

    #[tokio::test]
    async fn executor_errors_keep_their_output() {
        let compute = MemCompute::new().with_exec_handler(Arc::new(|inst, _| {
            Err(Error::executor_with_output(&inst.id, "exit status 1", "boom"))
        }));
        let id = launched(&compute).await;
        let exec = ServiceExecutor::new(Arc::new(compute), id, ExecutorConfig::default());

        let err = exec.run("false").await.unwrap_err();
        assert_eq!(err.output(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_when_echo_answers() {
        let compute = MemCompute::new().with_exec_handler(Arc::new(|_, _| Ok("ready\n".into())));
        let id = launched(&compute).await;
        let exec = ServiceExecutor::new(Arc::new(compute), id, ExecutorConfig::default());
        exec.wait_for_ready(Duration::from_secs(5)).await.unwrap();
    }
}
