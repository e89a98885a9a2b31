//! Runtime configuration overlay and sealing.

use std::collections::BTreeMap;

use hoist_core::RuntimeConfig;
use hoist_core::stage::normalize_path;
use serde::{Deserialize, Serialize};

use crate::manifest::{ImageManifest, LayerRecord};
use crate::snapshot::{FilesystemSnapshot, ROOT_UID};

/// Runtime settings laid over the built filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverlay {
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<u16>,
    /// Entry command; empty keeps the one set by the build
    pub entrypoint: Vec<String>,
    pub user: String,
    /// Image paths that must exist, such as replaced configuration directories
    pub targets: Vec<String>,
}

impl ConfigOverlay {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        let mut targets = runtime.required_paths.clone();
        if runtime.config_dir.is_some() && !targets.contains(&runtime.config_target) {
            targets.push(runtime.config_target.clone());
        }
        Self {
            workdir: normalize_path("/", &runtime.workdir),
            env: runtime.env.clone(),
            ports: runtime.ports.clone(),
            entrypoint: runtime.entrypoint.clone(),
            user: runtime.user.clone(),
            targets: targets.iter().map(|t| normalize_path("/", t)).collect(),
        }
    }

    /// Image path of the entry program, when it is given as a path.
    pub fn entry_program(&self) -> Option<String> {
        self.entrypoint
            .first()
            .filter(|program| program.contains('/'))
            .map(|program| normalize_path(&self.workdir, program))
    }
}

/// Validates an overlay against the final snapshot and seals the manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeConfigurator;

impl RuntimeConfigurator {
    /// Produces the [`ImageManifest`]. The snapshot is only read, so
    /// configuring twice yields identical manifests.
    pub fn configure(
        &self,
        snapshot: &FilesystemSnapshot,
        overlay: &ConfigOverlay,
        layers: &[LayerRecord],
    ) -> Result<ImageManifest, ConfigureError> {
        let workdir = normalize_path("/", &overlay.workdir);
        if !snapshot.is_dir(&workdir) {
            return Err(ConfigureError::MissingOverlayTarget {
                path: workdir,
                role: "working directory",
            });
        }

        let entrypoint = if overlay.entrypoint.is_empty() {
            snapshot.entrypoint().to_vec()
        } else {
            overlay.entrypoint.clone()
        };
        let Some(program) = entrypoint.first() else {
            return Err(ConfigureError::NoEntrypoint);
        };
        if program.contains('/') {
            let path = normalize_path(&workdir, program);
            if !snapshot.exists(&path) || snapshot.is_dir(&path) {
                return Err(ConfigureError::MissingOverlayTarget {
                    path,
                    role: "entry command",
                });
            }
        }

        for target in &overlay.targets {
            if !snapshot.exists(target) {
                return Err(ConfigureError::MissingOverlayTarget {
                    path: normalize_path("/", target),
                    role: "configuration target",
                });
            }
        }

        let account = snapshot.user(&overlay.user);
        if overlay.user == "root" || account.is_some_and(|a| a.uid == ROOT_UID) {
            return Err(ConfigureError::PrivilegedUser {
                user: overlay.user.clone(),
            });
        }
        let account = account.ok_or_else(|| ConfigureError::MissingUser {
            user: overlay.user.clone(),
        })?;
        if snapshot
            .entry(&workdir)
            .is_some_and(|entry| entry.owner() != account.uid)
        {
            return Err(ConfigureError::NotOwned {
                path: workdir,
                user: overlay.user.clone(),
            });
        }

        let mut env = snapshot.env().clone();
        env.extend(overlay.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut exposed_ports = snapshot.ports().clone();
        exposed_ports.extend(overlay.ports.iter().copied());

        tracing::info!(
            workdir = workdir.as_str(),
            user = overlay.user.as_str(),
            layers = layers.len(),
            "runtime configuration applied"
        );
        Ok(ImageManifest {
            base: snapshot.base_image().to_owned(),
            digest: snapshot.digest().to_owned(),
            layers: layers.to_vec(),
            entrypoint,
            exposed_ports,
            env,
            workdir,
            user: overlay.user.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigureError {
    #[error("{role} {path} does not exist in the image")]
    MissingOverlayTarget { path: String, role: &'static str },

    #[error("runtime user '{user}' is privileged; the image must run as a non-root account")]
    PrivilegedUser { user: String },

    #[error("runtime user '{user}' was never created")]
    MissingUser { user: String },

    #[error("{path} is not owned by runtime user '{user}'")]
    NotOwned { path: String, user: String },

    #[error("no entry command configured")]
    NoEntrypoint,
}
