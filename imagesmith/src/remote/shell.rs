//! Single commands run inside the guest.

use super::ssh::{ChannelTarget, SshClient};
use super::RemoteError;
use crate::config::ConnectionCredentials;
use async_trait::async_trait;
use std::time::Duration;

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Exit code; `None` if the session died without one.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Runs one command in the guest over its command channel.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` and waits at most `timeout`.
    async fn execute(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellOutput, RemoteError>;
}

/// [`RemoteShell`] over `ssh`.
#[derive(Debug, Clone)]
pub struct SshShell {
    client: SshClient,
}

impl SshShell {
    /// Creates a shell whose connections time out after `connect_timeout`.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            client: SshClient::new(connect_timeout),
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn execute(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellOutput, RemoteError> {
        let program = self.client.program(credentials).to_string();
        let session = self.client.command(target, credentials, command).output();

        let output = match tokio::time::timeout(timeout, session).await {
            Err(_) => {
                return Err(RemoteError::TimedOut {
                    program,
                    after: timeout,
                    output: String::new(),
                })
            }
            Ok(Err(e)) => {
                return Err(RemoteError::Spawn {
                    program,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ShellOutput {
            exit_code: output.status.code(),
            output: text,
        })
    }
}
