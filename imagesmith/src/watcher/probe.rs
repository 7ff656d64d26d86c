//! One look at the guest's command channel.

use crate::config::ConnectionCredentials;
use crate::remote::{ChannelTarget, SshClient};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::trace;

/// sshpass exit code for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// Client messages meaning the guest did not answer at all.
const NOT_ANSWERING: &[&str] = &[
    "Connection refused",
    "No route to host",
    "Connection timed out",
    "Network is unreachable",
    "Host is unreachable",
];

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Nothing answered: refused, no route, timed out or no address yet.
    Unreachable(String),
    /// The port accepted a connection but no session could be opened.
    Listening(String),
    /// A session was opened.
    Reachable,
    /// The channel rejected the credentials.
    AuthRejected(String),
}

impl ProbeOutcome {
    /// Returns true once the port has opened.
    #[must_use]
    pub fn port_open(&self) -> bool {
        matches!(self, Self::Listening(_) | Self::Reachable)
    }

    /// The reason text, if any.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Unreachable(r) | Self::Listening(r) | Self::AuthRejected(r) => r,
            Self::Reachable => "reachable",
        }
    }
}

/// The probe itself could not run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// The client program is missing or could not be spawned.
    #[error("cannot run {program}: {reason}")]
    Spawn {
        /// Program name.
        program: String,
        /// Why.
        reason: String,
    },
}

/// Looks at the command channel once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelProbe: Send + Sync {
    /// Probes `target` with `credentials`.
    async fn probe(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
    ) -> Result<ProbeOutcome, ProbeError>;
}

/// Probes with a TCP connect followed by a no-op `ssh` session.
#[derive(Debug, Clone)]
pub struct SshProbe {
    client: SshClient,
}

impl SshProbe {
    /// Creates a probe whose connections time out after `connect_timeout`.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            client: SshClient::new(connect_timeout),
        }
    }

    /// Uses a preconfigured client.
    #[must_use]
    pub fn with_client(client: SshClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelProbe for SshProbe {
    async fn probe(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
    ) -> Result<ProbeOutcome, ProbeError> {
        let connect_timeout = self.client.connect_timeout();
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        match tokio::time::timeout(connect_timeout, connect).await {
            Err(_) => {
                return Ok(ProbeOutcome::Unreachable(format!(
                    "connect timed out after {}s",
                    connect_timeout.as_secs()
                )))
            }
            Ok(Err(e)) => return Ok(ProbeOutcome::Unreachable(e.to_string())),
            Ok(Ok(stream)) => drop(stream),
        }

        let program = self.client.program(credentials).to_string();
        let session = self.client.command(target, credentials, "true").output();
        let output = match tokio::time::timeout(connect_timeout * 3, session).await {
            Err(_) => return Ok(ProbeOutcome::Listening("session handshake timed out".into())),
            Ok(Err(e)) => {
                return Err(ProbeError::Spawn {
                    program,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!(target = %target, code = ?output.status.code(), "Session probe finished");
        Ok(classify(output.status.code(), &stderr))
    }
}

/// Classifies the result of a no-op session.
pub(crate) fn classify(code: Option<i32>, stderr: &str) -> ProbeOutcome {
    if code == Some(0) {
        return ProbeOutcome::Reachable;
    }
    let last_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("session failed")
        .to_string();

    if code == Some(SSHPASS_BAD_PASSWORD)
        || stderr.contains("Permission denied")
        || stderr.contains("Too many authentication failures")
    {
        ProbeOutcome::AuthRejected(last_line)
    } else if NOT_ANSWERING.iter().any(|m| stderr.contains(m)) {
        ProbeOutcome::Unreachable(last_line)
    } else {
        ProbeOutcome::Listening(last_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(Some(0), ""), ProbeOutcome::Reachable);
        assert_eq!(
            classify(
                Some(255),
                "Warning: Permanently added '10.0.0.7'\nroot@10.0.0.7: Permission denied (publickey,password).\n"
            ),
            ProbeOutcome::AuthRejected("root@10.0.0.7: Permission denied (publickey,password).".into())
        );
        assert!(matches!(classify(Some(5), ""), ProbeOutcome::AuthRejected(_)));
        assert_eq!(
            classify(Some(255), "kex_exchange_identification: read: Connection reset by peer\n"),
            ProbeOutcome::Listening("kex_exchange_identification: read: Connection reset by peer".into())
        );
        assert_eq!(
            classify(Some(255), "ssh: connect to host 10.0.0.7 port 22: Connection refused\n"),
            ProbeOutcome::Unreachable("ssh: connect to host 10.0.0.7 port 22: Connection refused".into())
        );
        assert!(matches!(
            classify(Some(255), "ssh: connect to host 10.0.0.7 port 22: No route to host\n"),
            ProbeOutcome::Unreachable(_)
        ));
        assert!(!classify(Some(255), "ssh: connect to host 10.0.0.7 port 22: Connection timed out").port_open());
        assert_eq!(
            classify(None, ""),
            ProbeOutcome::Listening("session failed".into())
        );
    }

    #[tokio::test]
    async fn test_refused_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = SshProbe::new(Duration::from_secs(2));
        let outcome = probe
            .probe(
                &ChannelTarget::new("127.0.0.1", port),
                &ConnectionCredentials::password("root", "pw"),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ProbeOutcome::Unreachable(_)));
        assert!(!outcome.port_open());
    }
}
