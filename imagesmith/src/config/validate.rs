//! Checks run in `Init`, before any resource exists.

use super::loader::BuildConfig;
use crate::boot::BootSequence;
use crate::errors::ConfigurationError;
use std::path::{Path, PathBuf};

/// What `Init` validation produced.
#[derive(Debug, Clone)]
pub struct Preflight {
    /// The parsed boot command, placeholders still symbolic.
    pub boot_sequence: BootSequence,
    /// Full path of the bootstrap document.
    pub bootstrap_path: PathBuf,
}

/// Validates a resolved configuration.
///
/// Only reads the filesystem; creates nothing.
pub fn validate(config: &BuildConfig) -> Result<Preflight, ConfigurationError> {
    let template = &config.template;
    let source = &template.source;

    require(!source.guest_name.trim().is_empty(), "source.guest_name", "guest name is empty")?;
    require(
        !source.artifact.name.trim().is_empty(),
        "source.artifact.name",
        "artifact name is empty",
    )?;

    let comm = &source.communicator;
    require(!comm.username.trim().is_empty(), "source.communicator.username", "username is empty")?;
    let has_password = comm.password.as_ref().is_some_and(|p| !p.is_empty());
    require(
        has_password || comm.private_key_file.is_some(),
        "source.communicator",
        "either a password or a private_key_file is required",
    )?;
    if let Some(ref key) = comm.private_key_file {
        require(
            key.is_file(),
            "source.communicator.private_key_file",
            &format!("private key file {} does not exist", key.display()),
        )?;
    }
    require(comm.port != 0, "source.communicator.port", "port must be non-zero")?;
    require(
        !comm.timeout.is_zero(),
        "source.communicator.timeout",
        "ssh timeout must be non-zero",
    )?;
    require(
        !comm.poll_interval.is_zero(),
        "source.communicator.poll_interval",
        "poll interval must be non-zero",
    )?;

    let http = &source.http;
    require(
        http.directory.is_dir(),
        "source.http.directory",
        &format!("http directory {} does not exist", http.directory.display()),
    )?;
    require(
        crate::utils::paths::is_contained_relative(Path::new(&http.bootstrap_document))
            && !http.bootstrap_document.is_empty(),
        "source.http.bootstrap_document",
        "bootstrap document must be a relative path inside the http directory",
    )?;
    let bootstrap_path = config.bootstrap_path();
    require(
        bootstrap_path.is_file(),
        "source.http.bootstrap_document",
        &format!("bootstrap document {} does not exist", bootstrap_path.display()),
    )?;
    require(
        http.port_min <= http.port_max,
        "source.http.port_min",
        &format!("port range {}-{} is empty", http.port_min, http.port_max),
    )?;

    require(
        !source.boot.command.is_empty(),
        "source.boot.command",
        "boot command is empty",
    )?;
    let boot_sequence = BootSequence::parse(&source.boot.command).map_err(|e| {
        ConfigurationError::new(config.redactor.redact(&e.to_string()))
            .with_field("source.boot.command")
    })?;

    require(
        !source.shutdown.timeout.is_zero(),
        "source.shutdown.timeout",
        "shutdown timeout must be non-zero",
    )?;

    require(
        !template.provisioner.command.trim().is_empty(),
        "provisioner.command",
        "provisioner command is empty",
    )?;

    template.driver.validate()?;

    if let Some(path) = config.manifest_path() {
        require(
            creatable_parent(path),
            "manifest.path",
            &format!("manifest directory for {} cannot be created", path.display()),
        )?;
        require(!path.is_dir(), "manifest.path", "manifest path is a directory")?;
    }

    Ok(Preflight {
        boot_sequence,
        bootstrap_path,
    })
}

fn require(ok: bool, field: &str, message: &str) -> Result<(), ConfigurationError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigurationError::new(message).with_field(field))
    }
}

/// True if the nearest existing ancestor of `path` is a directory.
fn creatable_parent(path: &Path) -> bool {
    path.ancestors()
        .skip(1)
        .find(|p| p.as_os_str().is_empty() || p.exists())
        .is_some_and(|p| p.as_os_str().is_empty() || p.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBuild;

    #[test]
    fn test_fixture_is_valid() {
        let fixture = TestBuild::new();
        let preflight = validate(&fixture.config()).unwrap();
        assert!(preflight.bootstrap_path.is_file());
        assert!(!preflight.boot_sequence.is_empty());
    }

    #[test]
    fn test_missing_bootstrap_document() {
        let fixture = TestBuild::new();
        std::fs::remove_file(fixture.bootstrap_path()).unwrap();
        let err = validate(&fixture.config()).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("source.http.bootstrap_document"));
    }

    #[test]
    fn test_bootstrap_document_must_stay_inside_root() {
        let fixture = TestBuild::new();
        let mut config = fixture.config();
        config.template.source.http.bootstrap_document = "../ks.cfg".into();
        let err = validate(&config).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("source.http.bootstrap_document"));
    }

    #[test]
    fn test_requires_password_or_key() {
        let fixture = TestBuild::new();
        let mut config = fixture.config();
        config.template.source.communicator.password = None;
        let err = validate(&config).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("source.communicator"));

        config.template.source.communicator.private_key_file =
            Some(fixture.dir().join("id_ed25519"));
        let err = validate(&config).unwrap_err();
        assert_eq!(
            err.field.as_deref(),
            Some("source.communicator.private_key_file")
        );

        std::fs::write(fixture.dir().join("id_ed25519"), "key").unwrap();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_bad_boot_command() {
        let fixture = TestBuild::new();
        let mut config = fixture.config();
        config.template.source.boot.command = vec!["<notakey>".into()];
        let err = validate(&config).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("source.boot.command"));
    }

    #[test]
    fn test_port_range_and_provisioner() {
        let fixture = TestBuild::new();
        let mut config = fixture.config();
        config.template.source.http.port_min = 9000;
        config.template.source.http.port_max = 8000;
        assert!(validate(&config).is_err());

        let mut config = fixture.config();
        config.template.provisioner.command = "  ".into();
        let err = validate(&config).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("provisioner.command"));
    }

    #[test]
    fn test_creatable_parent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(creatable_parent(&dir.path().join("a/b/manifest.json")));
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(!creatable_parent(&file.join("manifest.json")));
    }
}
