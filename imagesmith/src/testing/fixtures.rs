//! A build template on disk, for loader and coordinator tests.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::{BuildConfig, TemplateLoader};

/// Kickstart served to the installer by the fixture.
pub const FIXTURE_KICKSTART: &str = "lang en_US.UTF-8\nrootpw --plaintext changeme\nreboot\n";

/// A throwaway build directory.
///
/// Holds `template.json`, `http/ks.cfg` and an empty `output/`. The
/// template uses short timings and the `rhel9-test` guest name; tweak it
/// with [`with_template`](Self::with_template) before loading.
#[derive(Debug)]
pub struct TestBuild {
    dir: TempDir,
}

impl Default for TestBuild {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBuild {
    /// Creates the directory with the default template.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be written.
    #[must_use]
    pub fn new() -> Self {
        let dir = tempfile::tempdir()
            .unwrap_or_else(|e| panic!("cannot create fixture directory: {e}"));
        let fixture = Self { dir };
        write(&fixture.dir().join("http/ks.cfg"), FIXTURE_KICKSTART);
        std::fs::create_dir_all(fixture.dir().join("output"))
            .unwrap_or_else(|e| panic!("cannot create output directory: {e}"));
        fixture.write_template(&default_template());
        fixture
    }

    /// Edits the template in place.
    #[must_use]
    pub fn with_template(self, edit: impl FnOnce(&mut Value)) -> Self {
        let mut template = self.template_value();
        edit(&mut template);
        self.write_template(&template);
        self
    }

    /// The fixture directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Path of `template.json`.
    #[must_use]
    pub fn template_path(&self) -> PathBuf {
        self.dir().join("template.json")
    }

    /// The template as written.
    ///
    /// # Panics
    ///
    /// Panics if the template file was removed or corrupted.
    #[must_use]
    pub fn template_value(&self) -> Value {
        let raw = std::fs::read_to_string(self.template_path())
            .unwrap_or_else(|e| panic!("cannot read fixture template: {e}"));
        serde_json::from_str(&raw).unwrap_or_else(|e| panic!("fixture template is not JSON: {e}"))
    }

    /// Path of the kickstart file.
    #[must_use]
    pub fn bootstrap_path(&self) -> PathBuf {
        self.dir().join("http/ks.cfg")
    }

    /// Path of the manifest the default template writes.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.dir().join("manifest.json")
    }

    /// Path of the artifact output directory.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.dir().join("output")
    }

    /// Loads the template with no overrides.
    ///
    /// # Panics
    ///
    /// Panics if the template does not load.
    #[must_use]
    pub fn config(&self) -> BuildConfig {
        TemplateLoader::new()
            .load(&self.template_path())
            .unwrap_or_else(|e| panic!("fixture template does not load: {e}"))
    }

    fn write_template(&self, template: &Value) {
        let text = serde_json::to_string_pretty(template)
            .unwrap_or_else(|e| panic!("cannot serialize template: {e}"));
        write(&self.template_path(), &text);
    }
}

fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| panic!("cannot create {}: {e}", parent.display()));
    }
    std::fs::write(path, contents).unwrap_or_else(|e| panic!("cannot write {}: {e}", path.display()));
}

fn default_template() -> Value {
    let fast_retry = json!({
        "max_attempts": 3,
        "base_delay_ms": 10,
        "max_delay_ms": 100,
        "jitter_strategy": "none"
    });
    json!({
        "variables": {
            "guest_name": "rhel9-test",
            "ssh_password": "fixture-Pa55"
        },
        "sensitive_variables": ["ssh_password"],
        "source": {
            "guest_name": "${var.guest_name}",
            "hardware": {"cpus": 2, "memory_mb": 2048, "disk_gb": 20},
            "media": {"iso_url": "file:///isos/rhel-9.4-x86_64-dvd.iso"},
            "http": {
                "directory": "http",
                "bootstrap_document": "ks.cfg",
                "bind_address": "127.0.0.1",
                "port_min": 0,
                "port_max": 0
            },
            "boot": {
                "wait": "1s",
                "command": ["<up><tab> inst.ks=http://{{ .HTTPIP }}:{{ .HTTPPort }}/ks.cfg<enter>"]
            },
            "communicator": {
                "username": "root",
                "password": "${var.ssh_password}",
                "timeout": "5m",
                "poll_interval": "10s",
                "connect_timeout": "2s",
                "handshake_attempts": 3,
                "retry": fast_retry.clone()
            },
            "shutdown": {
                "command": "shutdown -P now",
                "timeout": "1m",
                "poll_interval": "1s"
            },
            "artifact": {
                "name": "rhel9-cis-hardened",
                "output_directory": "output"
            }
        },
        "driver": {
            "type": "exec",
            "program": "/usr/libexec/imagesmith-driver",
            "retry": fast_retry
        },
        "provisioner": {
            "command": "ansible-playbook",
            "args": ["-i", "{{ .Host }},", "-u", "{{ .User }}", "site.yml"]
        },
        "manifest": {
            "path": "manifest.json",
            "custom_data": {"pipeline": "nightly", "baseline": "cis-level-2"}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_loads() {
        let fixture = TestBuild::new();
        let config = fixture.config();
        assert_eq!(config.template.source.guest_name, "rhel9-test");
        assert_eq!(config.redactor.redact("fixture-Pa55"), "<sensitive>");
        assert_eq!(config.manifest_path(), Some(fixture.manifest_path().as_path()));
    }

    #[test]
    fn test_with_template_edits() {
        let fixture = TestBuild::new().with_template(|t| {
            t["source"]["artifact"]["replace_existing"] = json!(true);
        });
        assert!(fixture.config().template.source.artifact.replace_existing);
    }
}
