//! Layer builder: one stage descriptor applied to one snapshot.

use futures::future::join_all;
use hoist_core::{StageDescriptor, StageKind};

use crate::backend::{BackendError, StageBackend};
use crate::cache::{CacheError, LayerCache};
use crate::context::BuildContext;
use crate::manifest::LayerRecord;
use crate::snapshot::{Account, FilesystemSnapshot, SnapshotDelta};

/// Executes stages through a [`StageBackend`], caching the resulting deltas.
///
/// A cacheable stage whose `(parent digest, cache key)` pair was built before
/// is replayed instead of executed. Stages marked non-cacheable (network
/// fetches) always execute.
pub struct LayerBuilder<B: StageBackend> {
    backend: B,
    cache: LayerCache,
    context: Option<BuildContext>,
}

impl<B: StageBackend> LayerBuilder<B> {
    pub fn new(backend: B, cache: LayerCache) -> Self {
        Self {
            backend,
            cache,
            context: None,
        }
    }

    /// Source tree that `copy` stages read from.
    pub fn with_context(mut self, context: BuildContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    pub async fn prepare(&self) -> Result<(), LayerError> {
        self.backend.prepare().await?;
        Ok(())
    }

    pub fn save_cache(&mut self) -> Result<(), LayerError> {
        self.cache.save()?;
        Ok(())
    }

    /// Applies `stage` to `snapshot`, producing exactly one successor.
    ///
    /// On failure the predecessor is consumed and no successor exists.
    pub async fn apply(
        &mut self,
        snapshot: FilesystemSnapshot,
        stage: &StageDescriptor,
    ) -> Result<(FilesystemSnapshot, LayerRecord), LayerError> {
        let parent = snapshot.digest().to_owned();
        let index = snapshot.depth();

        let (delta, cached) = match self.replay_cached(&parent, stage).await? {
            Some(delta) => (delta, true),
            None => {
                let delta = self.execute(&snapshot, stage).await?;
                if stage.is_cacheable() {
                    self.backend.commit(&delta).await?;
                    self.cache.insert(&parent, stage.cache_key(), delta.clone());
                }
                (delta, false)
            }
        };

        let next = snapshot.apply(&delta);
        let record = LayerRecord {
            index,
            kind: stage.kind(),
            label: stage.label(),
            cache_key: stage.cache_key().to_owned(),
            digest: next.digest().to_owned(),
            added: delta.added.len(),
            removed: delta.removed.len(),
            cached,
        };
        tracing::info!(
            index,
            stage = %record.label,
            cached,
            added = record.added,
            removed = record.removed,
            "layer built"
        );
        Ok((next, record))
    }

    async fn replay_cached(
        &mut self,
        parent: &str,
        stage: &StageDescriptor,
    ) -> Result<Option<SnapshotDelta>, LayerError> {
        if !stage.is_cacheable() {
            return Ok(None);
        }
        let Some(delta) = self.cache.get(parent, stage.cache_key()).cloned() else {
            return Ok(None);
        };
        match self.backend.replay(&delta).await {
            Ok(()) => Ok(Some(delta)),
            Err(BackendError::MissingBlob { digest, path }) => {
                tracing::warn!(stage = %stage.label(), %digest, %path, "cached layer content missing, rebuilding");
                self.cache.invalidate(parent, stage.cache_key());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(
        &self,
        snapshot: &FilesystemSnapshot,
        stage: &StageDescriptor,
    ) -> Result<SnapshotDelta, LayerError> {
        tracing::debug!(stage = %stage.label(), workdir = stage.workdir(), "executing stage");
        let mut delta = SnapshotDelta::default();
        let inputs = stage.inputs();

        match stage.kind() {
            StageKind::InstallPackages => {
                let installer = stage.installer().ok_or_else(|| invalid(stage, ""))?;
                let packages = stage.packages();
                // All installs finish before the outcome is decided.
                let results = join_all(packages.iter().map(|(name, constraint)| {
                    self.backend
                        .install(installer, name, constraint, stage.workdir())
                }))
                .await;
                for ((name, _), result) in packages.iter().zip(results) {
                    result.map_err(|source| LayerError::PackageInstall {
                        package: name.clone(),
                        source,
                    })?;
                }
                delta.packages = packages
                    .iter()
                    .map(|(name, constraint)| (name.clone(), constraint.to_string()))
                    .collect();
                delta.merge_changes(self.backend.changes().await?);
            }
            StageKind::Copy => {
                let context = self.context.as_ref().ok_or(LayerError::NoContext)?;
                let (source, dest) = match inputs {
                    [source, dest] => (source, stage.resolve(dest)),
                    _ => return Err(invalid(stage, &inputs.join(" "))),
                };
                let files = context.copy_plan(source, &dest);
                if files.is_empty() {
                    return Err(LayerError::MissingSource {
                        source_path: source.clone(),
                    });
                }
                self.backend.copy(&files).await?;
                delta.merge_changes(self.backend.changes().await?);
            }
            StageKind::Run => {
                let command = inputs.first().ok_or_else(|| invalid(stage, ""))?;
                let fetch = !stage.is_cacheable();
                match self
                    .backend
                    .run(command, stage.workdir(), snapshot.env(), fetch)
                    .await
                {
                    Ok(()) => {}
                    Err(BackendError::Command { command, source }) => {
                        return Err(LayerError::CommandExecution {
                            command,
                            status: source.exit_status(),
                            stderr: source.stderr().to_owned(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
                delta.merge_changes(self.backend.changes().await?);
            }
            StageKind::SetEnv => {
                for input in inputs {
                    let (key, value) = input.split_once('=').ok_or_else(|| invalid(stage, input))?;
                    delta.env.insert(key.to_owned(), value.to_owned());
                }
            }
            StageKind::ExposePort => {
                for input in inputs {
                    delta
                        .ports
                        .push(input.parse().map_err(|_| invalid(stage, input))?);
                }
            }
            StageKind::SetEntrypoint => {
                delta.entrypoint = Some(inputs.to_vec());
            }
            StageKind::Prune => {
                let mut removed_any = false;
                for target in inputs {
                    if !snapshot.exists(target) {
                        tracing::debug!(target = target.as_str(), "prune target absent, skipping");
                        continue;
                    }
                    self.backend.remove(target).await?;
                    delta.removed.push(target.clone());
                    removed_any = true;
                }
                if removed_any {
                    delta.merge_changes(self.backend.changes().await?);
                }
            }
            StageKind::CreateUser => {
                let (name, home) = match inputs {
                    [name, home] => (name, home),
                    _ => return Err(invalid(stage, &inputs.join(" "))),
                };
                let uid = match snapshot.user(name) {
                    Some(existing) => {
                        tracing::debug!(user = name.as_str(), uid = existing.uid, "account already exists");
                        existing.uid
                    }
                    None => {
                        let uid = snapshot.next_uid();
                        self.backend.create_user(name, uid, home).await?;
                        delta.merge_changes(self.backend.changes().await?);
                        uid
                    }
                };
                delta.users.insert(
                    name.clone(),
                    Account {
                        uid,
                        home: home.clone(),
                    },
                );
                if snapshot.is_dir(home) {
                    delta.owners.insert(home.clone(), uid);
                }
            }
        }
        Ok(delta)
    }
}

fn invalid(stage: &StageDescriptor, input: &str) -> LayerError {
    LayerError::InvalidInput {
        kind: stage.kind(),
        input: input.to_owned(),
    }
}

fn exit_text(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "a signal".to_owned(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("package '{package}' could not be installed")]
    PackageInstall {
        package: String,
        source: BackendError,
    },

    #[error("command `{command}` failed with {}", exit_text(.status))]
    CommandExecution {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("'{source_path}' has no files in the build context")]
    MissingSource { source_path: String },

    #[error("copy stages need a build context")]
    NoContext,

    #[error("invalid {kind} input '{input}'")]
    InvalidInput { kind: StageKind, input: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
