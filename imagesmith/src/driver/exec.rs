//! A driver that delegates to an external plugin program.
//!
//! Every capability is one invocation: `<program> [args...] <verb>`, a JSON
//! request on stdin and a JSON response on stdout. Exit code 75 means "try
//! again", 69 means "not found", any other non-zero code is fatal.

use super::{
    ArtifactRequest, ConvertedArtifact, DriverError, GuestDriver, GuestInstance, GuestSpec,
    PowerState,
};
use crate::boot::KeyInput;
use crate::config::Redactor;
use crate::errors::ConfigurationError;
use crate::utils::duration::deserialize_duration;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

/// Plugin exit code for a transient failure (`EX_TEMPFAIL`).
pub const EXIT_TRANSIENT: i32 = 75;
/// Plugin exit code for a missing guest or artifact (`EX_UNAVAILABLE`).
pub const EXIT_NOT_FOUND: i32 = 69;

const STDERR_TAIL: usize = 2048;

/// Configuration of the exec back-end.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecDriverConfig {
    /// The plugin program.
    pub program: PathBuf,
    /// Arguments placed before the verb.
    #[serde(default)]
    pub args: Vec<String>,
    /// Bound on one plugin call.
    #[serde(default = "default_call_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Extra environment for the plugin.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

const fn default_call_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

impl ExecDriverConfig {
    /// Creates a configuration for `program` with defaults.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: default_call_timeout(),
            env: BTreeMap::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.program.as_os_str().is_empty() {
            return Err(ConfigurationError::new("driver program is empty").with_field("driver.program"));
        }
        if self.timeout.is_zero() {
            return Err(
                ConfigurationError::new("driver timeout must be non-zero").with_field("driver.timeout")
            );
        }
        Ok(())
    }
}

/// Driver backed by a plugin program.
#[derive(Debug, Clone)]
pub struct ExecDriver {
    config: ExecDriverConfig,
    build_id: Uuid,
    redactor: Redactor,
}

#[derive(Deserialize)]
struct AddressResponse {
    address: Option<String>,
}

#[derive(Deserialize)]
struct PowerStateResponse {
    state: PowerState,
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

impl ExecDriver {
    /// Creates a driver for one build.
    #[must_use]
    pub fn new(config: ExecDriverConfig, build_id: Uuid, redactor: Redactor) -> Self {
        Self {
            config,
            build_id,
            redactor,
        }
    }

    async fn call<T: DeserializeOwned>(&self, verb: &str, request: Value) -> Result<T, DriverError> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| DriverError::Protocol(format!("encoding {verb} request: {e}")))?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(verb)
            .envs(&self.config.env)
            .env("IMAGESMITH_BUILD_ID", self.build_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(verb, program = %self.config.program.display(), "Calling driver plugin");

        let mut child = command
            .spawn()
            .map_err(|e| DriverError::Fatal(format!("cannot start {}: {e}", self.config.program.display())))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| DriverError::Transient(format!("writing {verb} request: {e}")))?;
        }

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| DriverError::Timeout {
                verb: verb.to_string(),
                after: self.config.timeout,
            })?
            .map_err(|e| DriverError::Transient(format!("waiting for {verb}: {e}")))?;

        if !output.status.success() {
            let stderr = self.redactor.redact(&tail(&String::from_utf8_lossy(&output.stderr)));
            let message = format!("{verb}: {}", stderr.trim());
            return Err(match output.status.code() {
                Some(EXIT_TRANSIENT) => DriverError::Transient(message),
                Some(EXIT_NOT_FOUND) => DriverError::NotFound(message),
                _ => DriverError::Fatal(message),
            });
        }

        let stdout = if output.stdout.iter().all(u8::is_ascii_whitespace) {
            b"{}".as_slice()
        } else {
            output.stdout.as_slice()
        };
        serde_json::from_slice(stdout)
            .map_err(|e| DriverError::Protocol(format!("{verb} response: {e}")))
    }
}

fn tail(text: &str) -> String {
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[async_trait]
impl GuestDriver for ExecDriver {
    fn name(&self) -> &str {
        self.config
            .program
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("exec")
    }

    async fn create(&self, spec: &GuestSpec) -> Result<GuestInstance, DriverError> {
        let request = serde_json::to_value(spec)
            .map_err(|e| DriverError::Protocol(format!("encoding create request: {e}")))?;
        self.call("create", request).await
    }

    async fn send_keys(&self, guest: &GuestInstance, keys: &[KeyInput]) -> Result<(), DriverError> {
        self.call::<Value>("send-keys", json!({"guest": guest, "keys": keys}))
            .await
            .map(|_| ())
    }

    async fn guest_address(&self, guest: &GuestInstance) -> Result<Option<String>, DriverError> {
        let response: AddressResponse = self.call("address", json!({"guest": guest})).await?;
        Ok(response.address.filter(|a| !a.is_empty()))
    }

    async fn power_state(&self, guest: &GuestInstance) -> Result<PowerState, DriverError> {
        let response: PowerStateResponse = self.call("power-state", json!({"guest": guest})).await?;
        Ok(response.state)
    }

    async fn power_off(&self, guest: &GuestInstance) -> Result<(), DriverError> {
        self.call::<Value>("power-off", json!({"guest": guest}))
            .await
            .map(|_| ())
    }

    async fn artifact_exists(&self, name: &str) -> Result<bool, DriverError> {
        let response: ExistsResponse = self.call("artifact-exists", json!({"name": name})).await?;
        Ok(response.exists)
    }

    async fn convert_to_artifact(
        &self,
        guest: &GuestInstance,
        request: &ArtifactRequest,
    ) -> Result<ConvertedArtifact, DriverError> {
        self.call("convert", json!({"guest": guest, "artifact": request}))
            .await
    }

    async fn destroy(&self, guest: &GuestInstance) -> Result<(), DriverError> {
        self.call::<Value>("destroy", json!({"guest": guest}))
            .await
            .map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::driver::{ConsoleHandle, HardwareSpec, MediaSpec};
    use std::os::unix::fs::PermissionsExt;

    /// Writes a shell plugin that answers each verb from a case statement.
    fn plugin(dir: &std::path::Path, body: &str) -> ExecDriverConfig {
        let path = dir.join("plugin.sh");
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = ExecDriverConfig::new(path);
        config.timeout = Duration::from_secs(10);
        config
    }

    fn guest() -> GuestInstance {
        GuestInstance {
            id: "vm-1".into(),
            name: "rhel9".into(),
            address: None,
            console: ConsoleHandle("vnc://127.0.0.1:5901".into()),
        }
    }

    #[tokio::test]
    async fn test_plugin_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = plugin(
            dir.path(),
            r#"case "$1" in
  create) echo '{"id":"vm-1","name":"rhel9","console":"vnc://127.0.0.1:5901"}' ;;
  address) echo '{"address":"10.0.0.7"}' ;;
  power-state) echo '{"state":"off"}' ;;
  artifact-exists) echo '{"exists":true}' ;;
  convert) echo '{"id":"tpl-9","files":["/out/disk.vmdk"]}' ;;
  *) ;;
esac"#,
        );
        let driver = ExecDriver::new(config, Uuid::nil(), Redactor::default());

        let created = driver
            .create(&GuestSpec {
                build_id: Uuid::nil(),
                name: "rhel9".into(),
                hardware: HardwareSpec::default(),
                media: MediaSpec {
                    iso_url: "file:///rhel.iso".into(),
                    iso_checksum: None,
                    extra: serde_json::Map::new(),
                },
            })
            .await
            .unwrap();
        assert_eq!(created, guest());

        assert_eq!(driver.guest_address(&guest()).await.unwrap().as_deref(), Some("10.0.0.7"));
        assert_eq!(driver.power_state(&guest()).await.unwrap(), PowerState::Off);
        assert!(driver.artifact_exists("rhel9-cis").await.unwrap());
        driver.send_keys(&guest(), &[]).await.unwrap();
        driver.destroy(&guest()).await.unwrap();

        let converted = driver
            .convert_to_artifact(
                &guest(),
                &ArtifactRequest {
                    build_id: Uuid::nil(),
                    name: "rhel9-cis".into(),
                    replace: false,
                    output_directory: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(converted.id, "tpl-9");
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = plugin(
            dir.path(),
            r#"case "$1" in
  create) echo "api busy" >&2; exit 75 ;;
  destroy) echo "no such vm" >&2; exit 69 ;;
  *) echo "token=s3cr3t-token rejected" >&2; exit 1 ;;
esac"#,
        );
        let redactor = Redactor::new(["s3cr3t-token"]);
        let driver = ExecDriver::new(config, Uuid::nil(), redactor);

        assert!(matches!(
            driver.destroy(&guest()).await,
            Err(DriverError::NotFound(_))
        ));
        let err = driver.power_off(&guest()).await.unwrap_err();
        assert!(matches!(err, DriverError::Fatal(_)));
        assert!(!err.to_string().contains("s3cr3t-token"));

        let err = driver
            .artifact_exists("x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("<sensitive>"));
    }

    #[tokio::test]
    async fn test_bad_response_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = plugin(dir.path(), "echo 'not json'");
        let driver = ExecDriver::new(config, Uuid::nil(), Redactor::default());
        assert!(matches!(
            driver.power_state(&guest()).await,
            Err(DriverError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let config = ExecDriverConfig::new("/nonexistent/imagesmith-plugin");
        let driver = ExecDriver::new(config, Uuid::nil(), Redactor::default());
        assert!(matches!(
            driver.artifact_exists("x").await,
            Err(DriverError::Fatal(_))
        ));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "é".repeat(STDERR_TAIL);
        let t = tail(&text);
        assert!(t.len() <= STDERR_TAIL);
        assert!(t.chars().all(|c| c == 'é'));
    }
}
