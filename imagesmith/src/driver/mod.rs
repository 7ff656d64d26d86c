//! The guest lifecycle driver capability.
//!
//! The coordinator only ever talks to a [`GuestDriver`]. Back-ends differ
//! in how they create, type into, power off, convert and destroy a guest;
//! the state machine does not.
//!
//! [`ExecDriver`] delegates every call to an external plugin program, which
//! keeps this crate independent of any particular hypervisor API.
//! [`RetryingDriver`] adds backoff for transient failures of the idempotent
//! operations.

mod exec;
mod retrying;

pub use exec::{ExecDriver, ExecDriverConfig};
pub use retrying::RetryingDriver;

use crate::boot::KeyInput;
use crate::cancellation::CancellationToken;
use crate::config::Redactor;
use crate::errors::ConfigurationError;
use crate::retry::RetryConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by a driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// Worth retrying (API throttled, lock contention, ...).
    #[error("transient driver failure: {0}")]
    Transient(String),

    /// Not worth retrying.
    #[error("driver failure: {0}")]
    Fatal(String),

    /// The guest or artifact does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call did not return in time.
    #[error("driver call '{verb}' timed out after {}s", .after.as_secs())]
    Timeout {
        /// The operation.
        verb: String,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// The back-end answered with something unreadable.
    #[error("invalid driver response: {0}")]
    Protocol(String),

    /// Cancellation arrived while waiting to retry.
    #[error("driver call cancelled")]
    Cancelled,
}

impl DriverError {
    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}

/// Hardware of the ephemeral guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    /// Virtual CPUs.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Memory in MiB.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// System disk in GiB.
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u64,
    /// Firmware type ("bios", "efi", "efi-secure").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// Network the guest attaches to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Back-end specific settings, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for HardwareSpec {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            disk_gb: default_disk_gb(),
            firmware: None,
            network: None,
            extra: Map::new(),
        }
    }
}

const fn default_cpus() -> u32 {
    2
}

const fn default_memory_mb() -> u64 {
    4096
}

const fn default_disk_gb() -> u64 {
    40
}

/// Installation media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSpec {
    /// Location of the installer ISO.
    pub iso_url: String,
    /// Expected checksum (`sha256:...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_checksum: Option<String>,
    /// Back-end specific settings, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Everything the driver needs to create a guest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuestSpec {
    /// The build the guest belongs to.
    pub build_id: Uuid,
    /// Guest name.
    pub name: String,
    /// Hardware.
    pub hardware: HardwareSpec,
    /// Installation media.
    pub media: MediaSpec,
}

/// Opaque console reference, meaningful only to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsoleHandle(pub String);

/// Handle to a created guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInstance {
    /// Driver-assigned identifier.
    pub id: String,
    /// Guest name.
    pub name: String,
    /// Network address, once known.
    #[serde(default)]
    pub address: Option<String>,
    /// Console used for boot injection.
    pub console: ConsoleHandle,
}

/// Power state of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Powered on.
    Running,
    /// Powered off.
    Off,
    /// The back-end could not tell.
    Unknown,
}

/// What to convert the guest into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRequest {
    /// The build.
    pub build_id: Uuid,
    /// Artifact name.
    pub name: String,
    /// Replace an existing artifact of the same name.
    pub replace: bool,
    /// Local directory for artifact files.
    pub output_directory: Option<PathBuf>,
}

/// What the driver produced from the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedArtifact {
    /// Artifact identifier in the back-end.
    pub id: String,
    /// Backing files.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

/// The guest lifecycle capability.
///
/// `create` through `destroy` are called by one build at a time for its own
/// guest. Implementations must be safe to share between concurrent builds.
#[async_trait]
pub trait GuestDriver: Send + Sync {
    /// Back-end name, recorded in the manifest.
    fn name(&self) -> &str;

    /// Creates and powers on a guest.
    async fn create(&self, spec: &GuestSpec) -> Result<GuestInstance, DriverError>;

    /// Types keys at the guest console.
    async fn send_keys(&self, guest: &GuestInstance, keys: &[KeyInput]) -> Result<(), DriverError>;

    /// The guest's current network address, if it has one.
    async fn guest_address(&self, guest: &GuestInstance) -> Result<Option<String>, DriverError>;

    /// The guest's power state.
    async fn power_state(&self, guest: &GuestInstance) -> Result<PowerState, DriverError>;

    /// Forces the guest off.
    async fn power_off(&self, guest: &GuestInstance) -> Result<(), DriverError>;

    /// Returns true if an artifact called `name` already exists.
    async fn artifact_exists(&self, name: &str) -> Result<bool, DriverError>;

    /// Turns the powered-off guest into an artifact. Consumes the guest.
    async fn convert_to_artifact(
        &self,
        guest: &GuestInstance,
        request: &ArtifactRequest,
    ) -> Result<ConvertedArtifact, DriverError>;

    /// Destroys the guest.
    async fn destroy(&self, guest: &GuestInstance) -> Result<(), DriverError>;
}

/// The `driver` block of a template.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Which back-end.
    #[serde(flatten)]
    pub backend: DriverBackend,
    /// Backoff for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Available back-ends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverBackend {
    /// External plugin program.
    Exec(ExecDriverConfig),
}

impl DriverConfig {
    /// Checks the block in `Init`.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match &self.backend {
            DriverBackend::Exec(exec) => exec.validate(),
        }
    }

    /// Creates the configured driver for one build, wrapped in retries.
    #[must_use]
    pub fn connect(
        &self,
        build_id: Uuid,
        redactor: Redactor,
        cancel: Arc<CancellationToken>,
    ) -> Arc<dyn GuestDriver> {
        match &self.backend {
            DriverBackend::Exec(exec) => Arc::new(RetryingDriver::new(
                ExecDriver::new(exec.clone(), build_id, redactor),
                self.retry.clone(),
                cancel,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_hardware_defaults_and_passthrough() {
        let hw: HardwareSpec =
            serde_json::from_value(json!({"cpus": 4, "cdrom_type": "sata"})).unwrap();
        assert_eq!(hw.cpus, 4);
        assert_eq!(hw.memory_mb, 4096);
        assert_eq!(hw.extra.get("cdrom_type"), Some(&json!("sata")));

        let back = serde_json::to_value(&hw).unwrap();
        assert_eq!(back["cdrom_type"], "sata");
        assert!(back.get("firmware").is_none());
    }

    #[test]
    fn test_driver_config_deserialize() {
        let config: DriverConfig = serde_json::from_value(json!({
            "type": "exec",
            "program": "/usr/libexec/imagesmith-vsphere",
            "args": ["--datacenter", "dc1"],
            "timeout": "2m",
            "retry": {"max_attempts": 5}
        }))
        .unwrap();

        let DriverBackend::Exec(ref exec) = config.backend;
        assert_eq!(exec.args, vec!["--datacenter", "dc1"]);
        assert_eq!(exec.timeout, Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transient_classification() {
        assert!(DriverError::Transient("busy".into()).is_transient());
        assert!(DriverError::Timeout {
            verb: "create".into(),
            after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!DriverError::NotFound("vm".into()).is_transient());
        assert!(!DriverError::Fatal("bad".into()).is_transient());
    }
}
