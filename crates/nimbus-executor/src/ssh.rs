//! SSH transport
//!
//! One connection per command: dial `<ip>:22`, authenticate with the
//! cluster's private key, exec, collect stdout and stderr separately, close.
//! Host keys are not verified; nodes are ephemeral and there is no host CA.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::{Error, Result, Sensitive};
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tracing::{debug, instrument};

use crate::{probe_until_ready, ExecutorConfig, NodeExecutor};

/// SSH port on every node
pub const SSH_PORT: u16 = 22;

/// Bytes of stderr carried in the error message
const STDERR_EXCERPT_LEN: usize = 512;

/// Accepts any host key
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Output of one remote command
#[derive(Debug, Default)]
struct CommandOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
}

impl CommandOutput {
    fn combined(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }
}

/// Tail of stderr, trimmed to a char boundary
fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT_LEN {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_EXCERPT_LEN;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Runs commands over SSH with key authentication
pub struct SshExecutor {
    host: String,
    user: String,
    private_key: Sensitive,
    config: ExecutorConfig,
}

impl SshExecutor {
    /// Create an executor for `host` using a PEM/OpenSSH private key
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        private_key: Sensitive,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            private_key,
            config,
        }
    }

    async fn exec_once(&self, command: &str) -> Result<CommandOutput> {
        let key_pair = russh_keys::decode_secret_key(self.private_key.expose(), None)
            .map_err(|e| Error::executor(&self.host, format!("invalid SSH private key: {e}")))?;

        let config = Arc::new(client::Config::default());
        let mut session = tokio::time::timeout(
            self.config.ssh_connect_timeout,
            client::connect(config, (self.host.as_str(), SSH_PORT), AcceptAnyHostKey),
        )
        .await
        .map_err(|_| {
            Error::timeout(format!("ssh dial {}:{SSH_PORT}", self.host), self.config.ssh_connect_timeout)
        })?
        .map_err(|e| Error::executor(&self.host, format!("ssh connect failed: {e}")))?;

        let authenticated = session
            .authenticate_publickey(&self.user, Arc::new(key_pair))
            .await
            .map_err(|e| Error::executor(&self.host, format!("ssh auth failed: {e}")))?;
        if !authenticated {
            return Err(Error::executor(
                &self.host,
                format!("ssh key rejected for user {}", self.user),
            ));
        }

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| Error::executor(&self.host, format!("ssh session failed: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::executor(&self.host, format!("ssh exec failed: {e}")))?;

        let mut output = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                // ext 1 is SSH_EXTENDED_DATA_STDERR
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                _ => {}
            }
        }

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(host = %self.host, error = %e, "ssh disconnect failed");
        }

        Ok(output)
    }
}

#[async_trait]
impl NodeExecutor for SshExecutor {
    #[instrument(skip(self, command), fields(host = %self.host))]
    async fn run(&self, command: &str) -> Result<String> {
        let output = tokio::time::timeout(self.config.command_timeout, self.exec_once(command))
            .await
            .map_err(|_| {
                Error::timeout(format!("command on {}", self.host), self.config.command_timeout)
            })??;

        match output.exit_status {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(status) => Err(Error::executor_with_output(
                &self.host,
                format!(
                    "command exited with status {status}: {}",
                    stderr_excerpt(&output.stderr)
                ),
                output.combined(),
            )),
            None => Err(Error::executor_with_output(
                &self.host,
                "channel closed without an exit status",
                output.combined(),
            )),
        }
    }

    async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        probe_until_ready(self, timeout, self.config.ssh_ready_tick).await
    }

    fn target(&self) -> String {
        self.host.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_stderr_is_kept_whole() {
        assert_eq!(stderr_excerpt(b"  error: no such file \n"), "error: no such file");
    }

    #[test]
    fn long_stderr_keeps_the_tail() {
        let mut stderr = vec![b'x'; 2000];
        stderr.extend_from_slice(b"FATAL: preflight failed");
        let excerpt = stderr_excerpt(&stderr);
        assert!(excerpt.starts_with("..."));
        assert!(excerpt.ends_with("FATAL: preflight failed"));
        assert!(excerpt.len() <= STDERR_EXCERPT_LEN + 3);
    }

    #[test]
    fn combined_output_is_stdout_then_stderr() {
        let out = CommandOutput {
            stdout: b"partial\n".to_vec(),
            stderr: b"boom\n".to_vec(),
            exit_status: Some(1),
        };
        assert_eq!(out.combined(), "partial\nboom\n");
    }

    #[tokio::test]
    async fn invalid_key_fails_before_dialing() {
        let exec = SshExecutor::new(
            "192.0.2.1",
            "ubuntu",
            Sensitive::new("not a key"),
            ExecutorConfig::default(),
        );
        let err = exec.run("true").await.unwrap_err();
        assert!(matches!(err, Error::Executor { .. }));
        assert!(err.to_string().contains("invalid SSH private key"));
        assert_eq!(exec.target(), "192.0.2.1");
    }
}
