//! Scripted executor for tests and dry runs
//!
//! Every command succeeds with empty output unless a canned response matches
//! it by substring. Calls are recorded so callers can assert on what ran
//! where.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::{Cluster, Error, Result};
use parking_lot::Mutex;

use crate::{ExecutorResolver, NodeExecutor};

#[derive(Clone, Debug)]
enum Reply {
    Output(String),
    Failure(String),
}

#[derive(Clone, Debug)]
struct Canned {
    pattern: String,
    reply: Reply,
}

/// A command recorded by the mock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    /// Node the command was addressed to
    pub target: String,
    /// The command text
    pub command: String,
}

/// Canned responses shared by every executor a [`MockExecutorResolver`] hands out
#[derive(Clone, Debug, Default)]
struct Script {
    canned: Arc<Vec<Canned>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl Script {
    fn reply(&self, target: &str, command: &str) -> Result<String> {
        self.calls.lock().push(RecordedCall {
            target: target.to_string(),
            command: command.to_string(),
        });
        match self.canned.iter().find(|c| command.contains(&c.pattern)) {
            Some(Canned {
                reply: Reply::Output(out),
                ..
            }) => Ok(out.clone()),
            Some(Canned {
                reply: Reply::Failure(msg),
                ..
            }) => Err(Error::executor_with_output(target, msg.clone(), msg.clone())),
            None => Ok(String::new()),
        }
    }
}

/// Executor that never leaves the process
#[derive(Clone, Debug)]
pub struct MockExecutor {
    target: String,
    script: Script,
}

impl MockExecutor {
    /// A no-op executor: every command succeeds with empty output
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            script: Script::default(),
        }
    }

    /// Reply with `output` to commands containing `pattern`
    pub fn respond(mut self, pattern: impl Into<String>, output: impl Into<String>) -> Self {
        push_canned(&mut self.script, pattern.into(), Reply::Output(output.into()));
        self
    }

    /// Fail commands containing `pattern`
    pub fn fail(mut self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        push_canned(&mut self.script, pattern.into(), Reply::Failure(message.into()));
        self
    }

    /// Commands run so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.calls.lock().clone()
    }
}

fn push_canned(script: &mut Script, pattern: String, reply: Reply) {
    let mut canned = script.canned.as_ref().clone();
    canned.push(Canned { pattern, reply });
    script.canned = Arc::new(canned);
}

#[async_trait]
impl NodeExecutor for MockExecutor {
    async fn run(&self, command: &str) -> Result<String> {
        self.script.reply(&self.target, command)
    }

    async fn wait_for_ready(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

/// Resolver handing out [`MockExecutor`]s that share one script and call log
#[derive(Clone, Debug, Default)]
pub struct MockExecutorResolver {
    script: Script,
}

impl MockExecutorResolver {
    /// A resolver whose executors succeed with empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `output` to commands containing `pattern`, on every node
    pub fn respond(mut self, pattern: impl Into<String>, output: impl Into<String>) -> Self {
        push_canned(&mut self.script, pattern.into(), Reply::Output(output.into()));
        self
    }

    /// Fail commands containing `pattern`, on every node
    pub fn fail(mut self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        push_canned(&mut self.script, pattern.into(), Reply::Failure(message.into()));
        self
    }

    /// Every command run through any executor handed out, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.calls.lock().clone()
    }
}

#[async_trait]
impl ExecutorResolver for MockExecutorResolver {
    async fn resolve(&self, _cluster: &Cluster, ip: &str) -> Result<Arc<dyn NodeExecutor>> {
        Ok(Arc::new(MockExecutor {
            target: ip.to_string(),
            script: self.script.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_is_noop_success() {
        let exec = MockExecutor::new("10.0.0.2");
        assert_eq!(exec.run("kubeadm reset -f").await.unwrap(), "");
        exec.wait_for_ready(Duration::from_secs(1)).await.unwrap();
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn first_matching_pattern_wins() {
        let exec = MockExecutor::new("10.0.0.2")
            .fail("kubeadm upgrade node", "upgrade failed")
            .respond("kubeadm", "generic");

        assert_eq!(exec.run("kubeadm version").await.unwrap(), "generic");
        let err = exec.run("sudo kubeadm upgrade node").await.unwrap_err();
        assert_eq!(err.output(), Some("upgrade failed"));
    }

    #[tokio::test]
    async fn resolver_shares_call_log_across_nodes() {
        let resolver = MockExecutorResolver::new().respond("get nodes", "n1 Ready");
        let cluster = Cluster::new("u", "dev", "vpc", "v1.29.0", 0);

        let a = resolver.resolve(&cluster, "10.0.0.2").await.unwrap();
        let b = resolver.resolve(&cluster, "10.0.0.3").await.unwrap();
        a.run("kubectl get nodes").await.unwrap();
        b.run("echo hi").await.unwrap();

        let calls = resolver.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].target, "10.0.0.2");
        assert_eq!(calls[1].target, "10.0.0.3");
        assert_eq!(b.target(), "10.0.0.3");
    }
}
