//! Stage execution backends.
//!
//! The [`LayerBuilder`](crate::LayerBuilder) decides *what* a stage does to the
//! snapshot; a [`StageBackend`] performs the side effects and reports which
//! paths changed. [`HostBackend`] drives real installers and shell commands
//! against a staging root and detects changes by rescanning it.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use hoist_core::stage::normalize_path;
use hoist_core::{IsolationMode, Platform, VersionConstraint};
use hoist_exec::{
    CommandExecutor, CommandSpec, ExecError, InstallError, Isolation, PackageInstaller,
    PackageManager, RealExecutor, RetryPolicy,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::snapshot::{Changes, Entry, SnapshotDelta};

/// Side-effecting half of stage execution. Tests substitute a mock.
#[allow(async_fn_in_trait)]
pub trait StageBackend: Send + Sync {
    /// Bring the staging root up and record its initial state.
    async fn prepare(&self) -> Result<(), BackendError>;

    /// Install one package. Called concurrently for the packages of a stage.
    async fn install(
        &self,
        installer: &str,
        package: &str,
        constraint: &VersionConstraint,
        workdir: &str,
    ) -> Result<(), BackendError>;

    /// Run a shell command. `fetch` commands reach the network and are retried on transient failures.
    async fn run(
        &self,
        command: &str,
        workdir: &str,
        env: &BTreeMap<String, String>,
        fetch: bool,
    ) -> Result<(), BackendError>;

    /// Copy host files to image paths.
    async fn copy(&self, files: &[(PathBuf, String)]) -> Result<(), BackendError>;

    async fn remove(&self, path: &str) -> Result<(), BackendError>;

    async fn create_user(&self, name: &str, uid: u32, home: &str) -> Result<(), BackendError>;

    /// Paths changed since the previous call (or since `prepare`).
    async fn changes(&self) -> Result<Changes, BackendError>;

    /// Keep the content of a cacheable layer so it can be replayed later.
    async fn commit(&self, delta: &SnapshotDelta) -> Result<(), BackendError>;

    /// Reproduce a cached layer without executing its stage.
    async fn replay(&self, delta: &SnapshotDelta) -> Result<(), BackendError>;
}

/// Image paths never scanned for changes.
const VIRTUAL_DIRS: &[&str] = &["/proc", "/sys", "/dev", "/run", "/tmp"];

#[derive(Debug, Clone)]
struct Tracked {
    entry: Entry,
    len: u64,
    modified: Option<SystemTime>,
}

type Index = BTreeMap<String, Tracked>;

/// Executes stages on this machine against a staging root.
pub struct HostBackend<E: CommandExecutor = RealExecutor> {
    installer: PackageInstaller<E>,
    mode: IsolationMode,
    root: PathBuf,
    watch: Vec<String>,
    blobs: Option<PathBuf>,
    bootstrap: Option<Platform>,
    index: Mutex<Index>,
    /// One lock per package database: dpkg for apt, otherwise the
    /// installer program, which owns its prefix (a venv, a global npm tree)
    install_locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl HostBackend<RealExecutor> {
    pub fn new(root: PathBuf, mode: IsolationMode, policy: RetryPolicy) -> Self {
        Self::with_executor(RealExecutor, root, mode, policy)
    }
}

impl<E: CommandExecutor> HostBackend<E> {
    pub fn with_executor(executor: E, root: PathBuf, mode: IsolationMode, policy: RetryPolicy) -> Self {
        // Without isolation the root is the host's own; callers name what to watch.
        let (root, isolation, watch) = match mode {
            IsolationMode::Chroot => (root.clone(), Isolation::Chroot(root), vec!["/".to_owned()]),
            IsolationMode::Rooted => (root.clone(), Isolation::Rooted(root), vec!["/".to_owned()]),
            IsolationMode::None => (PathBuf::from("/"), Isolation::None, Vec::new()),
        };
        Self {
            installer: PackageInstaller::with_executor(executor, policy).isolated(isolation),
            mode,
            root,
            watch,
            blobs: None,
            bootstrap: None,
            index: Mutex::new(Index::new()),
            install_locks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Only scan these image paths for changes.
    pub fn watching(mut self, paths: Vec<String>) -> Self {
        self.watch = paths;
        self
    }

    /// Store committed layer content in `dir` for replay.
    pub fn with_blob_dir(mut self, dir: PathBuf) -> Self {
        self.blobs = Some(dir);
        self
    }

    /// Bootstrap an empty chroot with the base distribution of `platform`.
    pub fn with_bootstrap(mut self, platform: Platform) -> Self {
        self.bootstrap = Some(platform);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host location of an image path.
    pub fn host_path(&self, image_path: &str) -> PathBuf {
        self.root.join(image_path.trim_start_matches('/'))
    }

    async fn bootstrap_root(&self, platform: &Platform) -> Result<(), BackendError> {
        if self.root.join("etc/os-release").exists() {
            tracing::debug!(root = %self.root.display(), "staging root already bootstrapped");
            return Ok(());
        }
        let profile = hoist_core::resolver::profile(platform).ok_or_else(|| {
            BackendError::Bootstrap {
                root: self.root.clone(),
                reason: format!("no distribution profile for {platform}"),
            }
        })?;
        tracing::info!(platform = %platform, codename = profile.codename, "bootstrapping staging root");
        let command = CommandSpec::new("debootstrap").args([
            "--variant=minbase".to_owned(),
            profile.codename.to_owned(),
            self.root.display().to_string(),
            platform.os.mirror().to_owned(),
        ]);
        self.installer
            .fetch_on_host(&command)
            .await
            .map_err(|e| BackendError::Bootstrap {
                root: self.root.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn rescan(&self) -> Result<Changes, BackendError> {
        let mut index = self.index.lock().await;
        let previous = std::mem::take(&mut *index);
        let root = self.root.clone();
        let watch = self.watch.clone();
        let (current, changes) =
            tokio::task::spawn_blocking(move || scan(&root, &watch, &previous)).await??;
        *index = current;
        Ok(changes)
    }

    fn blob_path(&self, digest: &str) -> Option<PathBuf> {
        self.blobs.as_ref().map(|dir| dir.join(digest))
    }
}

impl<E: CommandExecutor> StageBackend for HostBackend<E> {
    async fn prepare(&self) -> Result<(), BackendError> {
        std::fs::create_dir_all(&self.root).map_err(|e| io_error(&self.root, e))?;
        if self.mode == IsolationMode::Chroot
            && let Some(platform) = &self.bootstrap
        {
            self.bootstrap_root(platform).await?;
        }
        let baseline = self.rescan().await?;
        tracing::debug!(
            root = %self.root.display(),
            paths = baseline.added.len(),
            "staging root indexed"
        );
        Ok(())
    }

    async fn install(
        &self,
        installer: &str,
        package: &str,
        constraint: &VersionConstraint,
        workdir: &str,
    ) -> Result<(), BackendError> {
        let key = match PackageManager::detect(installer) {
            Some(PackageManager::Apt) => "dpkg".to_owned(),
            _ if installer.contains('/') => normalize_path(workdir, installer),
            _ => installer.to_owned(),
        };
        let lock = self.install_locks.lock().await.entry(key).or_default().clone();
        let _guard = lock.lock_owned().await;
        self.installer
            .install(installer, package, constraint, Path::new(workdir))
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        command: &str,
        workdir: &str,
        env: &BTreeMap<String, String>,
        fetch: bool,
    ) -> Result<(), BackendError> {
        let cwd = Path::new(workdir);
        let result = if fetch {
            self.installer.run_fetch(command, cwd, env).await
        } else {
            self.installer.run(command, cwd, env).await
        };
        result.map(|_| ()).map_err(|source| BackendError::Command {
            command: command.to_owned(),
            source,
        })
    }

    async fn copy(&self, files: &[(PathBuf, String)]) -> Result<(), BackendError> {
        for (source, dest) in files {
            let target = self.host_path(dest);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
            std::fs::copy(source, &target).map_err(|e| io_error(source, e))?;
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BackendError> {
        let target = self.host_path(path);
        let result = match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&target),
            Ok(_) => std::fs::remove_file(&target),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&target, e)),
        }
    }

    async fn create_user(&self, name: &str, uid: u32, home: &str) -> Result<(), BackendError> {
        if self.mode == IsolationMode::Rooted {
            // No privileges needed: edit the account databases inside the staging root.
            append_line(
                &self.host_path("/etc/passwd"),
                &format!("{name}:x:{uid}:{uid}::{home}:/bin/sh"),
            )?;
            append_line(&self.host_path("/etc/group"), &format!("{name}:x:{uid}:"))?;
            return Ok(());
        }
        // The home is the runtime tree built earlier; it is adopted, never created.
        let command = format!(
            "useradd --uid {uid} --user-group --home-dir {home} --no-create-home --shell /bin/sh {name} \
             && if [ -d {home} ]; then chown -R {uid}:{uid} {home}; fi"
        );
        self.run(&command, "/", &BTreeMap::new(), false).await
    }

    async fn changes(&self) -> Result<Changes, BackendError> {
        self.rescan().await
    }

    async fn commit(&self, delta: &SnapshotDelta) -> Result<(), BackendError> {
        let Some(dir) = &self.blobs else {
            return Ok(());
        };
        std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        for (path, entry) in &delta.added {
            if let Entry::File { digest, .. } = entry {
                let blob = dir.join(digest);
                if blob.exists() {
                    continue;
                }
                let source = self.host_path(path);
                std::fs::copy(&source, &blob).map_err(|e| io_error(&source, e))?;
            }
        }
        Ok(())
    }

    async fn replay(&self, delta: &SnapshotDelta) -> Result<(), BackendError> {
        // Check every blob before touching the staging root.
        for (path, entry) in &delta.added {
            if let Entry::File { digest, .. } = entry
                && !self.blob_path(digest).is_some_and(|blob| blob.exists())
            {
                return Err(BackendError::MissingBlob {
                    digest: digest.clone(),
                    path: path.clone(),
                });
            }
        }

        for path in &delta.removed {
            self.remove(path).await?;
        }
        for (path, entry) in &delta.added {
            let target = self.host_path(path);
            match entry {
                Entry::Directory { .. } => {
                    std::fs::create_dir_all(&target).map_err(|e| io_error(&target, e))?;
                }
                Entry::File { digest, .. } => {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
                    }
                    if let Some(blob) = self.blob_path(digest) {
                        std::fs::copy(&blob, &target).map_err(|e| io_error(&blob, e))?;
                    }
                }
            }
        }
        // Replayed content becomes part of the baseline for the next stage.
        self.rescan().await?;
        Ok(())
    }
}

fn scan(root: &Path, watch: &[String], previous: &Index) -> Result<(Index, Changes), BackendError> {
    let mut current = Index::new();
    for image_dir in watch {
        let start = root.join(image_dir.trim_start_matches('/'));
        if !start.exists() {
            continue;
        }
        let walker = walkdir::WalkDir::new(&start)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_virtual(root, e.path()));
        for entry in walker {
            let entry = entry?;
            let image_path = image_path(root, entry.path());
            if current.contains_key(&image_path) {
                continue;
            }
            let meta = entry.metadata()?;
            let modified = match meta.modified() {
                Ok(time) => Some(time),
                Err(e) => {
                    tracing::trace!(path = image_path.as_str(), error = %e, "no modification time, hashing");
                    None
                }
            };
            let reused = previous
                .get(&image_path)
                .filter(|old| old.len == meta.len() && old.modified == modified && modified.is_some());
            let tracked = match reused {
                Some(old) => old.clone(),
                None => Tracked {
                    entry: describe(entry.path(), &meta)?,
                    len: meta.len(),
                    modified,
                },
            };
            current.insert(image_path, tracked);
        }
    }

    let mut changes = Changes::default();
    for (path, tracked) in &current {
        if previous.get(path).is_none_or(|old| old.entry != tracked.entry) {
            changes.added.insert(path.clone(), tracked.entry.clone());
        }
    }
    for path in previous.keys() {
        if current.contains_key(path) {
            continue;
        }
        // Report only the top of a removed tree.
        if !changes
            .removed
            .iter()
            .any(|top| hoist_core::stage::is_path_prefix(top, path))
        {
            changes.removed.push(path.clone());
        }
    }
    Ok((current, changes))
}

fn describe(path: &Path, meta: &std::fs::Metadata) -> Result<Entry, BackendError> {
    if meta.is_dir() {
        return Ok(Entry::directory());
    }
    let mut hasher = Sha256::new();
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| io_error(path, e))?;
        hasher.update(b"symlink\0");
        hasher.update(target.to_string_lossy().as_bytes());
    } else {
        let mut file = std::fs::File::open(path).map_err(|e| io_error(path, e))?;
        std::io::copy(&mut file, &mut hasher).map_err(|e| io_error(path, e))?;
    }
    Ok(Entry::file(hex::encode(hasher.finalize())))
}

fn image_path(root: &Path, host: &Path) -> String {
    let host = host.to_string_lossy();
    let root = root.to_string_lossy();
    let relative = host.strip_prefix(root.as_ref()).unwrap_or(&host);
    let trimmed = relative.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{trimmed}")
    }
}

fn is_virtual(root: &Path, host: &Path) -> bool {
    let path = image_path(root, host);
    VIRTUAL_DIRS
        .iter()
        .any(|dir| hoist_core::stage::is_path_prefix(dir, &path))
}

fn append_line(path: &Path, line: &str) -> Result<(), BackendError> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_error(path, e))?;
    writeln!(file, "{line}").map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, source: std::io::Error) -> BackendError {
    BackendError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("command `{command}` failed")]
    Command { command: String, source: ExecError },

    #[error("filesystem operation failed at {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to scan staging root")]
    Walk(#[from] walkdir::Error),

    #[error("staging root scan was interrupted")]
    Join(#[from] tokio::task::JoinError),

    #[error("cached content {digest} for {path} is missing")]
    MissingBlob { digest: String, path: String },

    #[error("failed to bootstrap staging root {root}: {reason}")]
    Bootstrap { root: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rooted(root: &Path) -> HostBackend {
        HostBackend::new(root.to_path_buf(), IsolationMode::Rooted, RetryPolicy::none())
    }

    #[test]
    fn image_paths_are_absolute() {
        let root = Path::new("/srv/rootfs");
        assert_eq!(image_path(root, Path::new("/srv/rootfs")), "/");
        assert_eq!(image_path(root, Path::new("/srv/rootfs/usr/bin")), "/usr/bin");
    }

    #[test]
    fn virtual_dirs_are_skipped() {
        let root = Path::new("/srv/rootfs");
        assert!(is_virtual(root, Path::new("/srv/rootfs/proc/1")));
        assert!(!is_virtual(root, Path::new("/srv/rootfs/usr/share")));
    }

    #[tokio::test]
    async fn changes_report_added_and_removed_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = rooted(tmp.path());
        backend.prepare().await.unwrap();

        backend
            .run("mkdir -p app/node_modules/a && echo hi > app/node_modules/a/x.js", "/", &BTreeMap::new(), false)
            .await
            .unwrap();
        let added = backend.changes().await.unwrap();
        assert!(added.added.contains_key("/app/node_modules/a/x.js"));
        assert!(added.added.get("/app").is_some_and(Entry::is_dir));

        backend.remove("/app/node_modules").await.unwrap();
        let removed = backend.changes().await.unwrap();
        assert_eq!(removed.removed, vec!["/app/node_modules".to_owned()]);
        assert!(removed.added.is_empty());
    }

    #[tokio::test]
    async fn rooted_user_is_written_to_staging_passwd() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = rooted(tmp.path());
        backend.prepare().await.unwrap();
        backend.create_user("hue", 1000, "/usr/share/hue").await.unwrap();

        let passwd = std::fs::read_to_string(tmp.path().join("etc/passwd")).unwrap();
        assert!(passwd.contains("hue:x:1000:1000::/usr/share/hue:/bin/sh"));
        let group = std::fs::read_to_string(tmp.path().join("etc/group")).unwrap();
        assert!(group.contains("hue:x:1000:"));
    }

    #[tokio::test]
    async fn committed_layers_replay_from_blobs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("rootfs");
        let blobs = tmp.path().join("blobs");
        let backend = rooted(&root).with_blob_dir(blobs.clone());
        backend.prepare().await.unwrap();

        backend
            .run("mkdir -p etc && echo 1 > etc/app.conf", "/", &BTreeMap::new(), false)
            .await
            .unwrap();
        let changes = backend.changes().await.unwrap();
        let mut delta = SnapshotDelta::default();
        delta.merge_changes(changes);
        backend.commit(&delta).await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        let fresh = rooted(&root).with_blob_dir(blobs);
        fresh.prepare().await.unwrap();
        fresh.replay(&delta).await.unwrap();
        assert_eq!(std::fs::read_to_string(root.join("etc/app.conf")).unwrap(), "1\n");
    }

    /// Counts how many commands run at the same time.
    #[derive(Default)]
    struct Overlap {
        active: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    struct OverlapExecutor(Arc<Overlap>);

    impl CommandExecutor for OverlapExecutor {
        async fn exec(&self, _command: &CommandSpec) -> Result<hoist_exec::CommandOutput, ExecError> {
            use std::sync::atomic::Ordering;
            let now = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.active.fetch_sub(1, Ordering::SeqCst);
            Ok(hoist_exec::CommandOutput::default())
        }
    }

    fn overlap_backend(root: &Path) -> (HostBackend<OverlapExecutor>, Arc<Overlap>) {
        let overlap = Arc::new(Overlap::default());
        let backend = HostBackend::with_executor(
            OverlapExecutor(overlap.clone()),
            root.to_path_buf(),
            IsolationMode::Rooted,
            RetryPolicy::none(),
        );
        (backend, overlap)
    }

    #[tokio::test]
    async fn installs_into_one_prefix_never_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let (backend, overlap) = overlap_backend(tmp.path());
        let pin = VersionConstraint::Exact("1.0".to_owned());

        let (a, b) = tokio::join!(
            backend.install("./build/env/bin/pip", "connector-a", &pin, "/usr/share/hue"),
            backend.install("./build/env/bin/pip", "connector-b", &pin, "/usr/share/hue"),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(overlap.peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn installs_into_separate_prefixes_may_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let (backend, overlap) = overlap_backend(tmp.path());
        let pin = VersionConstraint::Exact("1.0".to_owned());

        let (a, b) = tokio::join!(
            backend.install("./build/env/bin/pip", "connector-a", &pin, "/usr/share/hue"),
            backend.install("npm", "webpack", &pin, "/usr/share/hue"),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(overlap.peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn replay_without_blobs_fails_before_changing_anything() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = rooted(tmp.path());
        backend.prepare().await.unwrap();
        let mut delta = SnapshotDelta::default();
        delta.added.insert("/etc/app.conf".to_owned(), Entry::file("deadbeef"));
        delta.removed.push("/etc".to_owned());

        let err = backend.replay(&delta).await.unwrap_err();
        assert!(matches!(err, BackendError::MissingBlob { .. }));
    }
}
