use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use hoist_core::StageKind;
use serde::{Deserialize, Serialize};

/// One built layer, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub index: usize,
    pub kind: StageKind,
    pub label: String,
    pub cache_key: String,
    /// Digest of the snapshot this layer produced
    pub digest: String,
    pub added: usize,
    pub removed: usize,
    /// Whether the layer was replayed from the cache
    pub cached: bool,
}

/// Sealed description of a built image.
///
/// Produced by [`RuntimeConfigurator::configure`](crate::RuntimeConfigurator::configure)
/// once the pipeline is sealed; the pipeline never updates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Base image reference, e.g. `ubuntu:18.04`
    pub base: String,
    /// Digest of the final snapshot
    pub digest: String,
    pub layers: Vec<LayerRecord>,
    pub entrypoint: Vec<String>,
    pub exposed_ports: BTreeSet<u16>,
    pub env: BTreeMap<String, String>,
    pub workdir: String,
    pub user: String,
}

impl ImageManifest {
    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the manifest as JSON, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        let content = self.to_json()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ManifestError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ManifestError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to serialize manifest")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write manifest to {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}
