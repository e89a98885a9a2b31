//! Build context: the project files a build may copy into the image.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use hoist_core::stage::normalize_path;
use sha2::{Digest, Sha256};

/// Paths never part of a build context, regardless of .gitignore content.
const HOIST_EXCLUDES: &[&str] = &[".hoist", ".git"];

/// Files of a project, relative to its root and sorted.
///
/// Inside a git work tree the listing comes from `git ls-files` (tracked and
/// untracked-but-not-ignored files), so `.gitignore`d paths never reach the
/// image. Elsewhere the directory is walked.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl BuildContext {
    pub fn collect(project_dir: &Path) -> Result<Self, ContextError> {
        let mut files = if inside_work_tree(project_dir) {
            git_ls_files(project_dir)?
        } else {
            walk_files(project_dir)?
        };
        files.retain(|path| {
            !HOIST_EXCLUDES
                .iter()
                .any(|excluded| path.starts_with(excluded))
        });
        files.sort();
        files.dedup();
        tracing::debug!(root = %project_dir.display(), files = files.len(), "build context collected");
        Ok(Self {
            root: project_dir.to_path_buf(),
            files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Context files at or below `source` (`.` selects everything).
    pub fn files_under(&self, source: &str) -> impl Iterator<Item = &PathBuf> {
        let prefix = relative(source);
        self.files.iter().filter(move |file| file.starts_with(&prefix))
    }

    /// Combined digest of the paths and contents of the files under `source`.
    pub fn digest(&self, source: &str) -> Result<String, ContextError> {
        let mut hasher = Sha256::new();
        let mut count = 0usize;
        for file in self.files_under(source) {
            let path = self.root.join(file);
            let mut handle = std::fs::File::open(&path).map_err(|e| ContextError::Read {
                path: path.clone(),
                source: e,
            })?;
            hasher.update(file.to_string_lossy().as_bytes());
            hasher.update([0]);
            std::io::copy(&mut handle, &mut hasher)
                .map_err(|e| ContextError::Read { path, source: e })?;
            hasher.update([0]);
            count += 1;
        }
        if count == 0 {
            return Err(ContextError::EmptySource {
                source_path: source.to_owned(),
            });
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Host file → image path pairs copying `source` to the absolute image path `dest`.
    pub fn copy_plan(&self, source: &str, dest: &str) -> Vec<(PathBuf, String)> {
        let prefix = relative(source);
        self.files_under(source)
            .map(|file| {
                let rest: PathBuf = file.components().skip(prefix.components().count()).collect();
                let target = if rest.as_os_str().is_empty() {
                    normalize_path("/", dest)
                } else {
                    normalize_path(dest, &rest.to_string_lossy())
                };
                (self.root.join(file), target)
            })
            .collect()
    }
}

fn relative(source: &str) -> PathBuf {
    Path::new(source)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn inside_work_tree(project_dir: &Path) -> bool {
    match Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(project_dir)
        .output()
    {
        Ok(output) => output.status.success(),
        Err(e) => {
            tracing::debug!(error = %e, "git unavailable, walking the project directory");
            false
        }
    }
}

fn git_ls_files(project_dir: &Path) -> Result<Vec<PathBuf>, ContextError> {
    let output = Command::new("git")
        .args(["ls-files", "-z", "--cached", "--others", "--exclude-standard"])
        .current_dir(project_dir)
        .output()
        .map_err(|e| ContextError::GitCommand {
            detail: "failed to execute git ls-files".to_owned(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ContextError::GitFailed {
            detail: format!("git ls-files exited with {}: {}", output.status, stderr.trim()),
        });
    }

    // NUL-separated names are never quoted. Deleted-but-tracked files are
    // still listed by --cached.
    Ok(output
        .stdout
        .split(|byte| *byte == 0)
        .filter(|name| !name.is_empty())
        .map(|name| PathBuf::from(OsStr::from_bytes(name)))
        .filter(|path| project_dir.join(path).is_file())
        .collect())
}

fn walk_files(project_dir: &Path) -> Result<Vec<PathBuf>, ContextError> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(project_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !HOIST_EXCLUDES.iter().any(|ex| e.file_name() == *ex)
        });
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file()
            && let Ok(relative) = entry.path().strip_prefix(project_dir)
        {
            files.push(relative.to_path_buf());
        }
    }
    Ok(files)
}

/// Checks whether the git working tree has uncommitted changes.
pub fn is_dirty(project_dir: &Path) -> Result<bool, ContextError> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(project_dir)
        .output()
        .map_err(|e| ContextError::GitCommand {
            detail: "failed to execute git status".to_owned(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ContextError::GitFailed {
            detail: format!("git status exited with {}: {}", output.status, stderr.trim()),
        });
    }

    Ok(!output.stdout.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("git command failed: {detail}")]
    GitCommand {
        detail: String,
        source: std::io::Error,
    },
    #[error("{detail}")]
    GitFailed { detail: String },
    #[error("failed to walk build context")]
    Walk(#[from] walkdir::Error),
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no files in the build context under '{source_path}'")]
    EmptySource { source_path: String },
}
