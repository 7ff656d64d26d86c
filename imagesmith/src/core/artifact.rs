//! The finalized image produced by a build.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One file backing an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Where the driver placed the file.
    pub path: PathBuf,
    /// Size in bytes, when the file is local.
    pub size: Option<u64>,
    /// SHA-256 hex digest, when the file is local.
    pub sha256: Option<String>,
}

/// The finalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Driver-assigned identifier (template id, image id, ...).
    pub id: String,
    /// Human name the artifact was registered under.
    pub name: String,
    /// The build that produced it.
    pub build_id: Uuid,
    /// Name of the driver back-end.
    pub driver: String,
    /// Backing files.
    pub files: Vec<ArtifactFile>,
    /// SHA-256 over the sorted `name:digest` lines of the local files.
    pub checksum: Option<String>,
    /// When the artifact was created (RFC 3339).
    pub created_at: String,
}

impl Artifact {
    /// Returns the paths of all backing files.
    #[must_use]
    pub fn paths(&self) -> Vec<&PathBuf> {
        self.files.iter().map(|f| &f.path).collect()
    }

    /// Total size of the local backing files.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().filter_map(|f| f.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_size_skips_remote_files() {
        let artifact = Artifact {
            id: "vm-1042".into(),
            name: "rhel9-cis-hardened".into(),
            build_id: Uuid::nil(),
            driver: "exec".into(),
            files: vec![
                ArtifactFile {
                    path: "/out/disk-0.vmdk".into(),
                    size: Some(1024),
                    sha256: Some("ab".into()),
                },
                ArtifactFile {
                    path: "[datastore1] rhel9/rhel9.vmx".into(),
                    size: None,
                    sha256: None,
                },
            ],
            checksum: None,
            created_at: crate::utils::iso_timestamp(),
        };

        assert_eq!(artifact.total_size(), 1024);
        assert_eq!(artifact.paths().len(), 2);
    }
}
