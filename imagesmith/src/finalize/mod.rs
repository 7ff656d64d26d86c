//! Artifact conversion and the manifest.

mod finalizer;
mod manifest;

pub use finalizer::{FinalizeError, Finalizer, RunSummary};
pub use manifest::{
    Manifest, ManifestEntry, ManifestError, ManifestFile, LOCK_STALE_AFTER, LOCK_WAIT,
};

use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// The `manifest` block of a template.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestConfig {
    /// Manifest file.
    pub path: PathBuf,
    /// Extra metadata recorded with every entry.
    #[serde(default)]
    pub custom_data: Map<String, Value>,
}

impl ManifestConfig {
    /// A manifest at `path` without custom data.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            custom_data: Map::new(),
        }
    }
}
