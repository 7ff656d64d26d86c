//! Running the external configuration program against the guest.
//!
//! The program is opaque: the executor supervises it, streams its output
//! and reports its exit status. It never interprets what the program says.

mod executor;
mod shell;
mod ssh;

pub use executor::{RemoteExecutor, RemoteRun, DEFAULT_OUTPUT_LIMIT};
pub use shell::{RemoteShell, ShellOutput, SshShell};
pub use ssh::{ChannelTarget, SshClient, HOST_KEY_OPTIONS};

use crate::errors::BuildError;
use crate::utils::duration::deserialize_opt_duration;
use crate::watcher::ProbeError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The `provisioner` block: which program to run and how.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionerSpec {
    /// Program to run on the build host.
    pub command: String,
    /// Arguments; `{{ .Host }}`, `{{ .Port }}` and `{{ .User }}` are substituted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Upper bound on the run.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,
}

impl ProvisionerSpec {
    /// A spec running `command` with `args`.
    #[must_use]
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Bounds the run.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// env values often carry vault tokens; only the keys are printed.
impl fmt::Debug for ProvisionerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerSpec")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Errors from remote execution.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The channel could not be confirmed.
    #[error("channel {target} unreachable: {reason}")]
    Unreachable {
        /// `host:port`.
        target: String,
        /// Last reason.
        reason: String,
    },

    /// The channel rejected the credentials.
    #[error("{target}: {reason}")]
    AuthRejected {
        /// `user@host:port`.
        target: String,
        /// What the channel said.
        reason: String,
    },

    /// The probe could not run.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// The program could not be started.
    #[error("cannot start {program}: {reason}")]
    Spawn {
        /// Program.
        program: String,
        /// Why.
        reason: String,
    },

    /// The program exceeded its timeout and was killed.
    #[error("{program} killed after {}s", .after.as_secs())]
    TimedOut {
        /// Program.
        program: String,
        /// The timeout.
        after: Duration,
        /// Output captured so far.
        output: String,
    },

    /// Cancellation was observed; the program was killed.
    #[error("remote execution cancelled")]
    Cancelled,
}

impl RemoteError {
    /// Returns true for a channel that is not up yet.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

impl From<RemoteError> for BuildError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::AuthRejected { target, reason } => Self::Authentication { target, reason },
            RemoteError::Cancelled => Self::Cancelled("during remote provisioning".into()),
            RemoteError::TimedOut {
                program,
                after,
                output,
            } => Self::RemoteExecution {
                program,
                exit_code: None,
                output: format!("{output}\n[killed after {}s]", after.as_secs()),
            },
            RemoteError::Spawn { program, reason } => Self::RemoteExecution {
                program,
                exit_code: None,
                output: reason,
            },
            other @ (RemoteError::Unreachable { .. } | RemoteError::Probe(_)) => {
                Self::RemoteExecution {
                    program: "ssh".into(),
                    exit_code: None,
                    output: other.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_deserialize() {
        let spec: ProvisionerSpec = serde_json::from_value(json!({
            "command": "ansible-playbook",
            "args": ["-i", "{{ .Host }},", "cis.yml"],
            "env": {"ANSIBLE_VAULT_PASSWORD": "v4ult"},
            "timeout": "2h"
        }))
        .unwrap();
        assert_eq!(spec.timeout, Some(Duration::from_secs(7200)));
        assert_eq!(spec.args.len(), 3);

        let debug = format!("{spec:?}");
        assert!(debug.contains("ANSIBLE_VAULT_PASSWORD"));
        assert!(!debug.contains("v4ult"));
    }

    #[test]
    fn test_error_mapping() {
        let err: BuildError = RemoteError::TimedOut {
            program: "ansible-playbook".into(),
            after: Duration::from_secs(60),
            output: "TASK [cis : 1.1.1]".into(),
        }
        .into();
        assert_eq!(err.kind(), "RemoteExecutionError");
        assert!(matches!(
            BuildError::from(RemoteError::AuthRejected {
                target: "root@h:22".into(),
                reason: "denied".into()
            }),
            BuildError::Authentication { .. }
        ));
    }
}
