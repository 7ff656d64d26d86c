//! Turns the powered-off guest into an artifact.

use super::manifest::{Manifest, ManifestEntry, ManifestError};
use super::ManifestConfig;
use crate::config::{ArtifactConfig, Redactor};
use crate::core::{Artifact, ArtifactFile};
use crate::driver::{ArtifactRequest, DriverError, GuestDriver, GuestInstance};
use crate::errors::BuildError;
use crate::utils::{iso_timestamp, strip_local_prefix};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors raised while finalizing.
#[derive(Debug, Clone, Error)]
pub enum FinalizeError {
    /// The driver could not convert the guest.
    #[error("conversion failed: {0}")]
    Convert(#[from] DriverError),

    /// A produced file could not be hashed.
    #[error("hashing {path} failed: {reason}")]
    Hash {
        /// The file.
        path: String,
        /// Why.
        reason: String,
    },

    /// The manifest could not be updated.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl From<FinalizeError> for BuildError {
    fn from(e: FinalizeError) -> Self {
        Self::Finalize(e.to_string())
    }
}

/// Facts about the run recorded next to the artifact.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Guest name.
    pub guest_name: String,
    /// Whether the guest had to be forced off.
    pub forced_shutdown: bool,
    /// Build duration so far.
    pub duration_ms: f64,
}

/// Converts guests and records artifacts.
pub struct Finalizer {
    driver: Arc<dyn GuestDriver>,
    redactor: Redactor,
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("driver", &self.driver.name())
            .finish_non_exhaustive()
    }
}

impl Finalizer {
    /// Creates a finalizer for one build.
    #[must_use]
    pub fn new(driver: Arc<dyn GuestDriver>, redactor: Redactor) -> Self {
        Self { driver, redactor }
    }

    /// Converts `guest` into an artifact. The guest is consumed even if
    /// hashing the produced files fails afterwards.
    pub async fn finalize(
        &self,
        build_id: Uuid,
        guest: &GuestInstance,
        config: &ArtifactConfig,
    ) -> Result<Artifact, FinalizeError> {
        let request = ArtifactRequest {
            build_id,
            name: config.name.clone(),
            replace: config.replace_existing,
            output_directory: config.output_directory.clone(),
        };
        info!(guest = %guest.name, artifact = %config.name, replace = request.replace, "Converting guest to artifact");
        let converted = self.driver.convert_to_artifact(guest, &request).await?;

        let base = config.output_directory.clone();
        let paths = converted.files.clone();
        let files = tokio::task::spawn_blocking(move || describe_files(&paths, base.as_deref()))
            .await
            .map_err(|e| FinalizeError::Hash {
                path: String::new(),
                reason: e.to_string(),
            })??;

        let checksum = combined_checksum(&files, config.output_directory.as_deref());
        let artifact = Artifact {
            id: converted.id,
            name: config.name.clone(),
            build_id,
            driver: self.driver.name().to_string(),
            files,
            checksum,
            created_at: iso_timestamp(),
        };
        info!(
            artifact_id = %artifact.id,
            files = artifact.files.len(),
            bytes = artifact.total_size(),
            "Artifact created"
        );
        Ok(artifact)
    }

    /// Records `artifact` in the configured manifest.
    pub async fn append_manifest(
        &self,
        artifact: &Artifact,
        manifest: &ManifestConfig,
        output_directory: Option<&Path>,
        summary: &RunSummary,
    ) -> Result<ManifestEntry, FinalizeError> {
        let mut entry = ManifestEntry::from_artifact(artifact, output_directory)
            .with_metadata("artifact_name", artifact.name.clone())
            .with_metadata("guest_name", summary.guest_name.clone())
            .with_metadata("forced_shutdown", summary.forced_shutdown)
            .with_metadata("duration_ms", summary.duration_ms.round())
            .with_custom_data(&manifest.custom_data);
        if let Some(ref checksum) = artifact.checksum {
            entry = entry.with_metadata("checksum", format!("sha256:{checksum}"));
        }
        entry.metadata = match self.redactor.redact_value(Value::Object(entry.metadata)) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Manifest::new(&manifest.path).append(&entry).await?;
        Ok(entry)
    }
}

/// Sizes and digests for local files; other paths are kept as references.
fn describe_files(paths: &[PathBuf], base: Option<&Path>) -> Result<Vec<ArtifactFile>, FinalizeError> {
    paths
        .iter()
        .map(|path| {
            let local = match (path.is_relative(), base) {
                (true, Some(base)) => base.join(path),
                _ => path.clone(),
            };
            if !local.is_file() {
                debug!(path = %path.display(), "Artifact file is not local; recording reference only");
                return Ok(ArtifactFile {
                    path: path.clone(),
                    size: None,
                    sha256: None,
                });
            }
            let (size, digest) = sha256_file(&local).map_err(|e| FinalizeError::Hash {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(ArtifactFile {
                path: local,
                size: Some(size),
                sha256: Some(digest),
            })
        })
        .collect()
}

fn sha256_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

/// SHA-256 over the sorted `name:digest` lines of the hashed files.
fn combined_checksum(files: &[ArtifactFile], base: Option<&Path>) -> Option<String> {
    let mut lines: Vec<String> = files
        .iter()
        .filter_map(|f| {
            f.sha256
                .as_ref()
                .map(|d| format!("{}:{d}", strip_local_prefix(&f.path, base)))
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DriverCall, MockGuestDriver};

    fn artifact_config(dir: &Path) -> ArtifactConfig {
        ArtifactConfig {
            name: "rhel9-cis-hardened".into(),
            replace_existing: false,
            output_directory: Some(dir.to_path_buf()),
        }
    }

    #[test]
    fn test_sha256_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, "abc").unwrap();
        let (size, digest) = sha256_file(&path).unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_checksum_ignores_order_and_references() {
        let file = |p: &str, d: Option<&str>| ArtifactFile {
            path: PathBuf::from(p),
            size: None,
            sha256: d.map(String::from),
        };
        let a = [file("/out/a.vmdk", Some("11")), file("/out/b.vmdk", Some("22"))];
        let b = [
            file("/out/b.vmdk", Some("22")),
            file("ds:///templates/x.ovf", None),
            file("/out/a.vmdk", Some("11")),
        ];
        let base = Some(Path::new("/out"));
        assert_eq!(combined_checksum(&a, base), combined_checksum(&b, base));
        assert_eq!(combined_checksum(&[file("/x", None)], base), None);
    }

    #[tokio::test]
    async fn test_finalize_hashes_local_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("disk-0.vmdk"), vec![7u8; 4096]).unwrap();

        let driver = Arc::new(MockGuestDriver::new());
        let guest = driver.guest("rhel9");
        driver.set_artifact_files(vec![
            PathBuf::from("disk-0.vmdk"),
            PathBuf::from("/datastore/templates/rhel9.ovf"),
        ]);
        let finalizer = Finalizer::new(driver.clone(), Redactor::default());

        let artifact = finalizer
            .finalize(Uuid::nil(), &guest, &artifact_config(dir.path()))
            .await
            .unwrap();

        assert_eq!(artifact.id, "rhel9-cis-hardened");
        assert_eq!(artifact.driver, "mock");
        assert_eq!(artifact.files[0].size, Some(4096));
        assert!(artifact.files[0].sha256.is_some());
        assert_eq!(artifact.files[1].size, None);
        assert!(artifact.checksum.is_some());
        assert_eq!(driver.calls_of(DriverCall::Convert), 1);
    }

    #[tokio::test]
    async fn test_manifest_entry_redacted_and_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("disk-0.vmdk"), "disk").unwrap();

        let driver = Arc::new(MockGuestDriver::new());
        let guest = driver.guest("rhel9");
        driver.set_artifact_files(vec![out.join("disk-0.vmdk")]);
        let finalizer = Finalizer::new(driver, Redactor::new(["Vault-Pa55"]));
        let artifact = finalizer
            .finalize(Uuid::now_v7(), &guest, &artifact_config(&out))
            .await
            .unwrap();

        let mut manifest = ManifestConfig::new(dir.path().join("manifest.json"));
        manifest
            .custom_data
            .insert("note".into(), Value::from("built with Vault-Pa55"));
        let summary = RunSummary {
            guest_name: "rhel9".into(),
            forced_shutdown: true,
            duration_ms: 1234.4,
        };
        let entry = finalizer
            .append_manifest(&artifact, &manifest, Some(&out), &summary)
            .await
            .unwrap();

        assert_eq!(entry.files[0].name, "disk-0.vmdk");
        assert_eq!(entry.metadata["forced_shutdown"], true);
        assert_eq!(entry.metadata["note"], "built with <sensitive>");

        let raw = std::fs::read_to_string(dir.path().join("manifest.json")).unwrap();
        assert!(!raw.contains("Vault-Pa55"));
        assert!(!raw.contains(out.to_str().unwrap()));
    }
}
