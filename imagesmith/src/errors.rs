//! Error types for the imagesmith build orchestrator.
//!
//! `BuildError` is the taxonomy every terminal failure is reported with.
//! Cleanup problems are reported separately as `TeardownError` and never
//! replace the error that ended the build.

use crate::core::{BuildState, StateRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Exit code for a successful build.
pub const EXIT_OK: i32 = 0;

/// The main error type for build operations.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// Missing or invalid inputs, detected before any resource exists.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Creating the artifact server or the guest failed.
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// The command channel never became reachable within `ssh_timeout`.
    #[error(
        "Timed out waiting for the command channel after {}s (ssh_timeout {}s): {last_reason}",
        .elapsed.as_secs(),
        .timeout.as_secs()
    )]
    BootTimeout {
        /// The configured budget.
        timeout: Duration,
        /// Wall time spent waiting when the budget ran out.
        elapsed: Duration,
        /// The last reason the probe gave for "not yet".
        last_reason: String,
    },

    /// The channel answered but rejected the credentials.
    #[error("Authentication rejected by {target}: {reason}")]
    Authentication {
        /// `user@host:port` of the rejected session.
        target: String,
        /// What the channel said.
        reason: String,
    },

    /// The external provisioner exited unsuccessfully.
    #[error("Remote provisioner {program} exited with {}", .exit_code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    RemoteExecution {
        /// Program name.
        program: String,
        /// Exit code, `None` if killed by a signal or timed out.
        exit_code: Option<i32>,
        /// Tail of the combined, redacted output.
        output: String,
    },

    /// The guest never powered off.
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// Converting the guest or recording the artifact failed.
    #[error("Finalize error: {0}")]
    Finalize(String),

    /// External cancellation was observed.
    #[error("Build cancelled: {0}")]
    Cancelled(String),

    /// An invariant of the orchestrator itself was broken.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Short name of the taxonomy entry, used in events and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Provisioning(_) => "ProvisioningError",
            Self::BootTimeout { .. } => "BootTimeoutError",
            Self::Authentication { .. } => "AuthenticationError",
            Self::RemoteExecution { .. } => "RemoteExecutionError",
            Self::Shutdown(_) => "ShutdownError",
            Self::Finalize(_) => "FinalizeError",
            Self::Cancelled(_) => "Cancelled",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Internal(_) => 1,
            Self::Configuration(_) => 2,
            Self::Provisioning(_) => 3,
            Self::BootTimeout { .. } => 4,
            Self::Authentication { .. } => 5,
            Self::RemoteExecution { .. } => 6,
            Self::Shutdown(_) => 7,
            Self::Finalize(_) => 8,
            Self::Cancelled(_) => 130,
        }
    }

    /// Returns true for a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Creates a configuration error from a message.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::new(message))
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("exit_code".to_string(), serde_json::json!(self.exit_code()));
        match self {
            Self::Configuration(err) => {
                if let Some(ref field) = err.field {
                    map.insert("field".to_string(), serde_json::json!(field));
                }
            }
            Self::BootTimeout { timeout, elapsed, .. } => {
                map.insert("timeout_secs".to_string(), serde_json::json!(timeout.as_secs_f64()));
                map.insert("elapsed_secs".to_string(), serde_json::json!(elapsed.as_secs_f64()));
            }
            Self::RemoteExecution { exit_code, .. } => {
                map.insert("remote_exit_code".to_string(), serde_json::json!(exit_code));
            }
            _ => {}
        }
        map
    }
}

/// Error raised when build inputs are missing or invalid.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The template field involved, if known.
    pub field: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Sets the field involved.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// A cleanup step that did not complete.
///
/// Always logged as a warning; never the reported outcome of a build.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Teardown of {resource} failed: {reason}")]
pub struct TeardownError {
    /// Resource name (e.g. "guest", "artifact-server").
    pub resource: String,
    /// Why it failed.
    pub reason: String,
}

impl TeardownError {
    /// Creates a new teardown error.
    #[must_use]
    pub fn new(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

/// What cleanup did on the way out of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Resources released successfully, in release order.
    pub released: Vec<String>,
    /// Cleanup failures, logged as warnings.
    pub failures: Vec<TeardownError>,
}

impl TeardownReport {
    /// Returns true if every registered resource was released.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns true if nothing needed releasing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.released.is_empty() && self.failures.is_empty()
    }
}

/// Terminal failure of one build, attributed to the state that produced it.
#[derive(Debug, Clone, Error)]
#[error("build {build_id} failed in {state}: {error}")]
pub struct BuildFailure {
    /// The build that failed.
    pub build_id: Uuid,
    /// The state in which the error occurred.
    pub state: BuildState,
    /// The original error.
    #[source]
    pub error: BuildError,
    /// States visited before failing.
    pub history: Vec<StateRecord>,
    /// What cleanup did afterwards.
    pub teardown: TeardownReport,
}

impl BuildFailure {
    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            BuildError::configuration("x"),
            BuildError::Provisioning("x".into()),
            BuildError::BootTimeout {
                timeout: Duration::from_secs(1),
                elapsed: Duration::from_secs(1),
                last_reason: "refused".into(),
            },
            BuildError::Authentication {
                target: "t".into(),
                reason: "r".into(),
            },
            BuildError::RemoteExecution {
                program: "p".into(),
                exit_code: Some(2),
                output: String::new(),
            },
            BuildError::Shutdown("x".into()),
            BuildError::Finalize("x".into()),
            BuildError::Cancelled("x".into()),
            BuildError::Internal("x".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(BuildError::exit_code).collect();
        assert!(codes.iter().all(|c| *c != EXIT_OK));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_configuration_error_display_and_field() {
        let err: BuildError = ConfigurationError::new("bootstrap document not found")
            .with_field("source.bootstrap_document")
            .into();
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(err.to_string().contains("bootstrap document not found"));
        assert_eq!(
            err.to_dict().get("field"),
            Some(&serde_json::json!("source.bootstrap_document"))
        );
    }

    #[test]
    fn test_remote_execution_display() {
        let err = BuildError::RemoteExecution {
            program: "ansible-playbook".into(),
            exit_code: Some(2),
            output: "fatal: [guest]".into(),
        };
        assert_eq!(err.to_string(), "Remote provisioner ansible-playbook exited with code 2");

        let killed = BuildError::RemoteExecution {
            program: "ansible-playbook".into(),
            exit_code: None,
            output: String::new(),
        };
        assert!(killed.to_string().ends_with("a signal"));
    }

    #[test]
    fn test_teardown_report_flags() {
        let mut report = TeardownReport::default();
        assert!(report.is_noop());
        assert!(report.is_clean());

        report.failures.push(TeardownError::new("guest", "already gone"));
        assert!(!report.is_noop());
        assert!(!report.is_clean());
    }
}
