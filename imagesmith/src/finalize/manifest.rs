//! The append-only artifact manifest.
//!
//! The manifest is a JSON array shared by every build that names it. An
//! append takes an in-process lock per path, then a `<manifest>.lock` file
//! for other processes, reads the array, adds one entry and replaces the
//! file through a synced temporary file in the same directory. Readers
//! therefore see either the old or the new array, never a partial write.

use crate::core::Artifact;
use crate::utils::strip_local_prefix;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Age after which a leftover lock file is considered abandoned.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(60);

/// How long an append waits for the lock file.
pub const LOCK_WAIT: Duration = Duration::from_secs(30);

const LOCK_RETRY: Duration = Duration::from_millis(50);

static PATH_LOCKS: LazyLock<DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>> =
    LazyLock::new(DashMap::new);

/// Manifest errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// Reading or writing failed.
    #[error("manifest {path}: {reason}")]
    Io {
        /// The manifest.
        path: String,
        /// Why.
        reason: String,
    },

    /// The existing file is not a manifest; it is left untouched.
    #[error("manifest {path} is unreadable and was not modified: {reason}")]
    Corrupt {
        /// The manifest.
        path: String,
        /// Parse error.
        reason: String,
    },

    /// An entry for this build is already recorded.
    #[error("manifest already has an entry for build {0}")]
    Duplicate(Uuid),

    /// Another process held the lock for too long.
    #[error("manifest {path} is locked by another process (waited {}s)", .waited.as_secs())]
    Locked {
        /// The manifest.
        path: String,
        /// Time waited.
        waited: Duration,
    },
}

/// One file of a recorded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path with local prefixes stripped.
    pub name: String,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// SHA-256 hex digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// One recorded artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The build that produced it; unique within a manifest.
    pub build_id: Uuid,
    /// Driver-assigned artifact identifier.
    pub artifact_id: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Driver back-end.
    pub driver: String,
    /// Backing files.
    pub files: Vec<ManifestFile>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ManifestEntry {
    /// Builds an entry, stripping local prefixes from file paths.
    ///
    /// Paths under `base` are recorded relative to it; other absolute
    /// paths are recorded by file name.
    #[must_use]
    pub fn from_artifact(artifact: &Artifact, base: Option<&Path>) -> Self {
        let files = artifact
            .files
            .iter()
            .map(|f| ManifestFile {
                name: strip_local_prefix(&f.path, base),
                size: f.size,
                sha256: f.sha256.clone(),
            })
            .collect();
        Self {
            build_id: artifact.build_id,
            artifact_id: artifact.id.clone(),
            created_at: artifact.created_at.clone(),
            driver: artifact.driver.clone(),
            files,
            metadata: Map::new(),
        }
    }

    /// Adds a metadata value.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Adds several metadata values; existing keys are kept.
    #[must_use]
    pub fn with_custom_data(mut self, data: &Map<String, Value>) -> Self {
        for (k, v) in data {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }
}

/// A manifest file.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    stale_after: Duration,
    lock_wait: Duration,
}

impl Manifest {
    /// Opens (lazily) the manifest at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stale_after: LOCK_STALE_AFTER,
            lock_wait: LOCK_WAIT,
        }
    }

    /// Overrides lock timing.
    #[must_use]
    pub fn with_lock_timing(mut self, stale_after: Duration, wait: Duration) -> Self {
        self.stale_after = stale_after;
        self.lock_wait = wait;
        self
    }

    /// The manifest path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn io_err(&self, e: impl std::fmt::Display) -> ManifestError {
        ManifestError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }

    /// All recorded entries; a missing file is an empty manifest.
    pub async fn entries(&self) -> Result<Vec<ManifestEntry>, ManifestError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_entries(&path))
            .await
            .map_err(|e| self.io_err(e))?
    }

    /// Appends `entry`.
    pub async fn append(&self, entry: &ManifestEntry) -> Result<(), ManifestError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| self.io_err(e))?;

        let key = tokio::fs::canonicalize(&parent)
            .await
            .map_err(|e| self.io_err(e))?
            .join(self.path.file_name().unwrap_or_default());
        let local = PATH_LOCKS
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _in_process = local.lock().await;

        let _file_lock = self.acquire_file_lock().await?;

        let path = self.path.clone();
        let entry = entry.clone();
        let build_id = entry.build_id;
        tokio::task::spawn_blocking(move || write_appended(&path, entry))
            .await
            .map_err(|e| self.io_err(e))??;

        info!(manifest = %self.path.display(), build_id = %build_id, "Manifest entry recorded");
        Ok(())
    }

    async fn acquire_file_lock(&self) -> Result<LockFile, ManifestError> {
        let lock_path = self.lock_path();
        let started = Instant::now();
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockFile(lock_path));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.is_stale(&lock_path) {
                        warn!(lock = %lock_path.display(), "Removing stale manifest lock");
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }
                    if started.elapsed() >= self.lock_wait {
                        return Err(ManifestError::Locked {
                            path: self.path.display().to_string(),
                            waited: started.elapsed(),
                        });
                    }
                    debug!(lock = %lock_path.display(), "Manifest locked; waiting");
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(self.io_err(e)),
            }
        }
    }

    fn is_stale(&self, lock_path: &Path) -> bool {
        std::fs::metadata(lock_path)
            .and_then(|m| m.modified())
            .ok()
            .map(|t| SystemTime::now().duration_since(t).unwrap_or_default())
            .is_some_and(|age| age >= self.stale_after)
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
struct LockFile(PathBuf);

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn read_entries(path: &Path) -> Result<Vec<ManifestEntry>, ManifestError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ManifestError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).map_err(|e| ManifestError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn write_appended(path: &Path, entry: ManifestEntry) -> Result<(), ManifestError> {
    let io = |e: &dyn std::fmt::Display| ManifestError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    let mut entries = read_entries(path)?;
    if entries.iter().any(|e| e.build_id == entry.build_id) {
        return Err(ManifestError::Duplicate(entry.build_id));
    }
    entries.push(entry);

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io(&e))?;
    serde_json::to_writer_pretty(&mut tmp, &entries).map_err(|e| io(&e))?;
    tmp.write_all(b"\n").map_err(|e| io(&e))?;
    tmp.as_file().sync_all().map_err(|e| io(&e))?;
    tmp.persist(path).map_err(|e| io(&e.error))?;

    #[cfg(unix)]
    if let Ok(d) = std::fs::File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactFile;
    use pretty_assertions::assert_eq;

    fn artifact(build_id: Uuid) -> Artifact {
        Artifact {
            id: "rhel9-cis-hardened".into(),
            name: "rhel9-cis-hardened".into(),
            build_id,
            driver: "exec".into(),
            files: vec![
                ArtifactFile {
                    path: PathBuf::from("/var/lib/imagesmith/output/rhel9/disk-0.vmdk"),
                    size: Some(42),
                    sha256: Some("ab".repeat(32)),
                },
                ArtifactFile {
                    path: PathBuf::from("/datastore/templates/rhel9.ovf"),
                    size: None,
                    sha256: None,
                },
            ],
            checksum: None,
            created_at: "2026-10-15T08:00:00Z".into(),
        }
    }

    #[test]
    fn test_entry_strips_local_prefixes() {
        let entry = ManifestEntry::from_artifact(
            &artifact(Uuid::nil()),
            Some(Path::new("/var/lib/imagesmith/output")),
        );
        let names: Vec<&str> = entry.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["rhel9/disk-0.vmdk", "rhel9.ovf"]);

        let json = serde_json::to_value(&entry).unwrap();
        assert!(!json.to_string().contains("/var/lib"));
        assert!(json["files"][1].get("sha256").is_none());
    }

    #[test]
    fn test_custom_data_does_not_override() {
        let mut custom = Map::new();
        custom.insert("guest_name".into(), Value::from("spoofed"));
        custom.insert("team".into(), Value::from("platform"));
        let entry = ManifestEntry::from_artifact(&artifact(Uuid::nil()), None)
            .with_metadata("guest_name", "rhel9")
            .with_custom_data(&custom);
        assert_eq!(entry.metadata["guest_name"], "rhel9");
        assert_eq!(entry.metadata["team"], "platform");
    }

    #[tokio::test]
    async fn test_append_and_refuse_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new(dir.path().join("out/manifest.json"));
        let entry = ManifestEntry::from_artifact(&artifact(Uuid::now_v7()), None);

        manifest.append(&entry).await.unwrap();
        assert_eq!(
            manifest.append(&entry).await.unwrap_err(),
            ManifestError::Duplicate(entry.build_id)
        );

        let entries = manifest.entries().await.unwrap();
        assert_eq!(entries, vec![entry]);
        assert!(!manifest.lock_path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let path = path.clone();
                tokio::spawn(async move {
                    let entry = ManifestEntry::from_artifact(&artifact(Uuid::now_v7()), None);
                    Manifest::new(path).append(&entry).await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let entries = Manifest::new(&path).entries().await.unwrap();
        assert_eq!(entries.len(), 16);
        let mut ids: Vec<Uuid> = entries.iter().map(|e| e.build_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Manifest::new(&path)
            .append(&ManifestEntry::from_artifact(&artifact(Uuid::now_v7()), None))
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Corrupt { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn test_held_lock_times_out_and_stale_lock_is_taken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(dir.path().join("manifest.json.lock"), "4242\n").unwrap();
        let entry = ManifestEntry::from_artifact(&artifact(Uuid::now_v7()), None);

        let held = Manifest::new(&path)
            .with_lock_timing(Duration::from_secs(3600), Duration::from_millis(120));
        assert!(matches!(
            held.append(&entry).await.unwrap_err(),
            ManifestError::Locked { .. }
        ));

        let stale = Manifest::new(&path).with_lock_timing(Duration::ZERO, Duration::from_millis(120));
        stale.append(&entry).await.unwrap();
        assert_eq!(stale.entries().await.unwrap().len(), 1);
    }
}
