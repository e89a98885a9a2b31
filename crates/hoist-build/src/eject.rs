use std::path::{Path, PathBuf};

/// Directory holding hoist's per-project state.
pub const HOIST_DIR: &str = ".hoist";

/// Writes the rendered Dockerfile to `.hoist/Dockerfile` so it can be edited
/// and used with a regular container toolchain.
pub fn eject(project_dir: &Path, dockerfile_content: &str) -> Result<PathBuf, EjectError> {
    let hoist_dir = project_dir.join(HOIST_DIR);
    std::fs::create_dir_all(&hoist_dir).map_err(|e| EjectError::CreateDir {
        path: hoist_dir.clone(),
        source: e,
    })?;

    let dockerfile_path = hoist_dir.join("Dockerfile");
    if dockerfile_path.exists() {
        return Err(EjectError::AlreadyEjected(dockerfile_path));
    }

    std::fs::write(&dockerfile_path, dockerfile_content).map_err(|e| EjectError::Write {
        path: dockerfile_path.clone(),
        source: e,
    })?;
    tracing::info!(path = %dockerfile_path.display(), "Dockerfile ejected");

    Ok(dockerfile_path)
}

pub fn is_ejected(project_dir: &Path) -> bool {
    project_dir.join(HOIST_DIR).join("Dockerfile").exists()
}

pub fn load_ejected_dockerfile(project_dir: &Path) -> Result<String, EjectError> {
    let path = project_dir.join(HOIST_DIR).join("Dockerfile");
    std::fs::read_to_string(&path).map_err(|e| EjectError::Read { path, source: e })
}

#[derive(Debug, thiserror::Error)]
pub enum EjectError {
    #[error("failed to create .hoist directory at {path}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Dockerfile already ejected at {0}; edit it directly or delete it to re-eject")]
    AlreadyEjected(PathBuf),
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read ejected Dockerfile at {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}
