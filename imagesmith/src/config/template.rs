//! The build template schema.
//!
//! A template is a JSON document. After variable interpolation it is
//! deserialized into [`BuildTemplate`]; every block below maps to one part
//! of the build.

use super::secrets::Secret;
use crate::boot::BootInjectionPolicy;
use crate::driver::{DriverConfig, HardwareSpec, MediaSpec};
use crate::finalize::ManifestConfig;
use crate::remote::ProvisionerSpec;
use crate::retry::RetryConfig;
use crate::utils::duration::deserialize_duration;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Default quiet period between power-on and the first keystroke.
pub const DEFAULT_BOOT_WAIT: Duration = Duration::from_secs(10);
/// Default budget for the command channel to come up.
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default interval between channel probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Default timeout of one probe connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default grace period for a graceful shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default interval between power-state checks while shutting down.
pub const DEFAULT_SHUTDOWN_POLL: Duration = Duration::from_secs(5);

/// A full build template.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildTemplate {
    /// Variable declarations with defaults (`null` means required).
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Names of variables whose values are sensitive.
    #[serde(default)]
    pub sensitive_variables: Vec<String>,
    /// The guest to build.
    pub source: SourceConfig,
    /// The guest lifecycle back-end.
    pub driver: DriverConfig,
    /// The external hardening program.
    pub provisioner: ProvisionerSpec,
    /// Where to record the artifact.
    #[serde(default)]
    pub manifest: Option<ManifestConfig>,
}

/// The `source` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Guest name; also tags the progress log.
    pub guest_name: String,
    /// Hardware of the ephemeral guest.
    #[serde(default)]
    pub hardware: HardwareSpec,
    /// Installation media.
    pub media: MediaSpec,
    /// The ephemeral artifact server.
    pub http: HttpConfig,
    /// Boot injection.
    pub boot: BootConfig,
    /// The command channel.
    pub communicator: CommunicatorConfig,
    /// Shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// The artifact to produce.
    pub artifact: ArtifactConfig,
}

/// The `source.http` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Directory served to the installer.
    pub directory: PathBuf,
    /// Bootstrap document, relative to `directory`.
    pub bootstrap_document: String,
    /// Address to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Lowest candidate port.
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    /// Highest candidate port.
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    /// Host advertised to the guest instead of a detected one.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

/// The `source.boot` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootConfig {
    /// Quiet period after power-on.
    #[serde(default = "default_boot_wait", deserialize_with = "deserialize_duration")]
    pub wait: Duration,
    /// Boot command strings.
    pub command: Vec<String>,
    /// Whether the sequence may be re-sent.
    #[serde(default)]
    pub injection: BootInjectionPolicy,
}

/// The `source.communicator` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommunicatorConfig {
    /// Fixed guest address; otherwise the driver reports it.
    #[serde(default)]
    pub host: Option<String>,
    /// Channel port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: Option<Secret>,
    /// Private key file.
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    /// Overall budget from the start of installation.
    #[serde(default = "default_ssh_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Interval between probes.
    #[serde(default = "default_poll_interval", deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    /// Timeout of one probe connection.
    #[serde(default = "default_connect_timeout", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    /// Consecutive "port open but no session" observations tolerated.
    #[serde(default = "default_handshake_attempts")]
    pub handshake_attempts: u32,
    /// Backoff used to confirm the channel before provisioning.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// The `source.shutdown` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Command run in the guest to power it off.
    #[serde(default)]
    pub command: Option<String>,
    /// Grace period before a forced power-off.
    #[serde(default = "default_shutdown_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Interval between power-state checks.
    #[serde(default = "default_shutdown_poll", deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            poll_interval: DEFAULT_SHUTDOWN_POLL,
        }
    }
}

/// The `source.artifact` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactConfig {
    /// Artifact name; its identity in the driver's inventory.
    pub name: String,
    /// Replace an existing artifact of the same name.
    #[serde(default)]
    pub replace_existing: bool,
    /// Local directory the driver writes artifact files to.
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

const fn default_port_min() -> u16 {
    8000
}

const fn default_port_max() -> u16 {
    9000
}

const fn default_boot_wait() -> Duration {
    DEFAULT_BOOT_WAIT
}

const fn default_ssh_port() -> u16 {
    22
}

const fn default_ssh_timeout() -> Duration {
    DEFAULT_SSH_TIMEOUT
}

const fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

const fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

const fn default_handshake_attempts() -> u32 {
    10
}

const fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

const fn default_shutdown_poll() -> Duration {
    DEFAULT_SHUTDOWN_POLL
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Value {
        json!({
            "source": {
                "guest_name": "rhel9",
                "media": {"iso_url": "file:///isos/rhel-9.4-x86_64-dvd.iso"},
                "http": {"directory": "http", "bootstrap_document": "ks.cfg"},
                "boot": {"command": ["<up><tab> inst.ks=http://{{ .HTTPIP }}:{{ .HTTPPort }}/ks.cfg<enter>"]},
                "communicator": {"username": "root", "password": "pw"},
                "artifact": {"name": "rhel9-cis-hardened"}
            },
            "driver": {"type": "exec", "program": "/usr/libexec/imagesmith-vsphere"},
            "provisioner": {"command": "ansible-playbook", "args": ["site.yml"]}
        })
    }

    #[test]
    fn test_defaults_applied() {
        let template: BuildTemplate = serde_json::from_value(minimal()).unwrap();
        let source = &template.source;

        assert_eq!(source.boot.wait, DEFAULT_BOOT_WAIT);
        assert_eq!(source.communicator.port, 22);
        assert_eq!(source.communicator.timeout, DEFAULT_SSH_TIMEOUT);
        assert_eq!(source.communicator.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(source.communicator.handshake_attempts, 10);
        assert_eq!(source.shutdown.timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!((source.http.port_min, source.http.port_max), (8000, 9000));
        assert_eq!(source.http.bind_address, "0.0.0.0");
        assert!(!source.artifact.replace_existing);
        assert!(template.manifest.is_none());
    }

    #[test]
    fn test_durations_parsed() {
        let mut value = minimal();
        value["source"]["communicator"]["timeout"] = json!("45m");
        value["source"]["boot"]["wait"] = json!("1m30s");
        let template: BuildTemplate = serde_json::from_value(value).unwrap();
        assert_eq!(template.source.communicator.timeout, Duration::from_secs(2700));
        assert_eq!(template.source.boot.wait, Duration::from_secs(90));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut value = minimal();
        value["source"]["communicator"]["ssh_pasword"] = json!("typo");
        assert!(serde_json::from_value::<BuildTemplate>(value).is_err());
    }

    #[test]
    fn test_password_is_secret() {
        let template: BuildTemplate = serde_json::from_value(minimal()).unwrap();
        let debug = format!("{:?}", template.source.communicator);
        assert!(!debug.contains("\"pw\""));
        assert_eq!(
            template.source.communicator.password.as_ref().map(Secret::expose),
            Some("pw")
        );
    }
}
