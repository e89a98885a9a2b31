//! Declarative stage descriptors.
//!
//! A [`StageDescriptor`] describes one transformation of the image
//! filesystem. Descriptors are validated and their cache key computed at
//! construction; after that they are immutable.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dependency::VersionConstraint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    InstallPackages,
    Copy,
    Run,
    SetEnv,
    ExposePort,
    SetEntrypoint,
    /// Removes build-only trees
    Prune,
    /// Creates the non-privileged runtime account
    CreateUser,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::InstallPackages => "install_packages",
            StageKind::Copy => "copy",
            StageKind::Run => "run",
            StageKind::SetEnv => "set_env",
            StageKind::ExposePort => "expose_port",
            StageKind::SetEntrypoint => "set_entrypoint",
            StageKind::Prune => "prune",
            StageKind::CreateUser => "create_user",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ordered transformation step.
///
/// `inputs` layout depends on `kind`:
///
/// | kind               | inputs                                     |
/// |--------------------|--------------------------------------------|
/// | `install_packages` | installer program, then `name` / `name@version` |
/// | `copy`             | source (build context relative), destination |
/// | `run`              | shell command                              |
/// | `set_env`          | `KEY=VALUE` entries                        |
/// | `expose_port`      | port numbers                               |
/// | `set_entrypoint`   | argv                                       |
/// | `prune`            | absolute paths                             |
/// | `create_user`      | account name, home directory               |
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDescriptor {
    kind: StageKind,
    inputs: Vec<String>,
    workdir: String,
    cacheable: bool,
    /// Digest of copied content, part of the cache key for `copy` stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_digest: Option<String>,
    cache_key: String,
}

impl StageDescriptor {
    /// Install packages with `installer` (e.g. `apt-get`, `pip`).
    ///
    /// Cacheable only when every package is pinned to an exact version.
    pub fn install_packages(
        installer: &str,
        packages: &[(String, VersionConstraint)],
        workdir: &str,
    ) -> crate::Result<Self> {
        if installer.trim().is_empty() {
            return Err(invalid(StageKind::InstallPackages, "installer program is empty"));
        }
        if packages.is_empty() {
            return Err(invalid(StageKind::InstallPackages, "no packages requested"));
        }
        let mut inputs = Vec::with_capacity(packages.len() + 1);
        inputs.push(installer.to_owned());
        for (name, constraint) in packages {
            if name.is_empty() || name.contains('@') || name.contains(char::is_whitespace) {
                return Err(invalid(
                    StageKind::InstallPackages,
                    format!("invalid package name {name:?}"),
                ));
            }
            inputs.push(match constraint {
                VersionConstraint::Latest => name.clone(),
                VersionConstraint::Exact(v) => format!("{name}@{v}"),
            });
        }
        let cacheable = packages
            .iter()
            .all(|(_, c)| matches!(c, VersionConstraint::Exact(_)));
        Self::build(StageKind::InstallPackages, inputs, workdir, cacheable, None)
    }

    /// Copy `source` from the build context to `dest` (relative to `workdir`).
    pub fn copy(source: &str, dest: &str, content_digest: &str, workdir: &str) -> crate::Result<Self> {
        if source.is_empty() || dest.is_empty() {
            return Err(invalid(StageKind::Copy, "source and destination are required"));
        }
        Self::build(
            StageKind::Copy,
            vec![source.to_owned(), dest.to_owned()],
            workdir,
            true,
            Some(content_digest.to_owned()),
        )
    }

    /// Run a shell command. Commands that fetch from the network pass `cacheable = false`.
    pub fn run(command: &str, workdir: &str, cacheable: bool) -> crate::Result<Self> {
        if command.trim().is_empty() {
            return Err(invalid(StageKind::Run, "command is empty"));
        }
        Self::build(StageKind::Run, vec![command.to_owned()], workdir, cacheable, None)
    }

    pub fn set_env<'a>(
        vars: impl IntoIterator<Item = (&'a str, &'a str)>,
        workdir: &str,
    ) -> crate::Result<Self> {
        let mut inputs = Vec::new();
        for (key, value) in vars {
            if key.is_empty() || key.contains('=') {
                return Err(invalid(StageKind::SetEnv, format!("invalid variable name {key:?}")));
            }
            inputs.push(format!("{key}={value}"));
        }
        if inputs.is_empty() {
            return Err(invalid(StageKind::SetEnv, "no variables given"));
        }
        Self::build(StageKind::SetEnv, inputs, workdir, true, None)
    }

    pub fn expose_port(ports: &[u16], workdir: &str) -> crate::Result<Self> {
        if ports.is_empty() {
            return Err(invalid(StageKind::ExposePort, "no ports given"));
        }
        if ports.contains(&0) {
            return Err(invalid(StageKind::ExposePort, "port 0 cannot be exposed"));
        }
        let inputs = ports.iter().map(u16::to_string).collect();
        Self::build(StageKind::ExposePort, inputs, workdir, true, None)
    }

    pub fn set_entrypoint(argv: &[String], workdir: &str) -> crate::Result<Self> {
        if argv.first().is_none_or(|a| a.trim().is_empty()) {
            return Err(invalid(StageKind::SetEntrypoint, "entry command is empty"));
        }
        Self::build(StageKind::SetEntrypoint, argv.to_vec(), workdir, true, None)
    }

    /// Remove build-only trees. Targets must be absolute and must not be `/`.
    pub fn prune(targets: &[String], workdir: &str) -> crate::Result<Self> {
        if targets.is_empty() {
            return Err(invalid(StageKind::Prune, "no targets given"));
        }
        let mut inputs = Vec::with_capacity(targets.len());
        for target in targets {
            if !target.starts_with('/') {
                return Err(invalid(
                    StageKind::Prune,
                    format!("target {target:?} must be absolute"),
                ));
            }
            let normalized = normalize_path("/", target);
            if normalized == "/" {
                return Err(invalid(StageKind::Prune, "refusing to prune the root directory"));
            }
            inputs.push(normalized);
        }
        Self::build(StageKind::Prune, inputs, workdir, true, None)
    }

    /// Create the runtime account `name` with home directory `home`.
    pub fn create_user(name: &str, home: &str, workdir: &str) -> crate::Result<Self> {
        if name.is_empty() || name.contains(char::is_whitespace) || name.contains(':') {
            return Err(invalid(StageKind::CreateUser, format!("invalid account name {name:?}")));
        }
        if !home.starts_with('/') {
            return Err(invalid(
                StageKind::CreateUser,
                format!("home directory {home:?} must be absolute"),
            ));
        }
        Self::build(
            StageKind::CreateUser,
            vec![name.to_owned(), normalize_path("/", home)],
            workdir,
            true,
            None,
        )
    }

    fn build(
        kind: StageKind,
        inputs: Vec<String>,
        workdir: &str,
        cacheable: bool,
        content_digest: Option<String>,
    ) -> crate::Result<Self> {
        if !workdir.starts_with('/') {
            return Err(crate::Error::RelativeWorkdir {
                path: workdir.to_owned(),
            });
        }
        let workdir = normalize_path("/", workdir);
        let cache_key = compute_cache_key(kind, &workdir, &inputs, content_digest.as_deref());
        Ok(Self {
            kind,
            inputs,
            workdir,
            cacheable,
            content_digest,
            cache_key,
        })
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn content_digest(&self) -> Option<&str> {
        self.content_digest.as_deref()
    }

    /// Installer program of an `install_packages` stage.
    pub fn installer(&self) -> Option<&str> {
        match self.kind {
            StageKind::InstallPackages => self.inputs.first().map(String::as_str),
            _ => None,
        }
    }

    /// Requested packages of an `install_packages` stage.
    pub fn packages(&self) -> Vec<(String, VersionConstraint)> {
        if self.kind != StageKind::InstallPackages {
            return Vec::new();
        }
        self.inputs
            .iter()
            .skip(1)
            .map(|spec| match spec.split_once('@') {
                Some((name, version)) => {
                    (name.to_owned(), VersionConstraint::Exact(version.to_owned()))
                }
                None => (spec.clone(), VersionConstraint::Latest),
            })
            .collect()
    }

    /// Absolute image path for `path`, resolved against this stage's working directory.
    pub fn resolve(&self, path: &str) -> String {
        normalize_path(&self.workdir, path)
    }

    /// Short description used in logs and error messages.
    pub fn label(&self) -> String {
        let detail = match self.kind {
            StageKind::InstallPackages => self.inputs.get(1..).unwrap_or_default().join(" "),
            _ => self.inputs.join(" "),
        };
        const MAX: usize = 60;
        if detail.chars().count() > MAX {
            let truncated: String = detail.chars().take(MAX).collect();
            format!("{} {truncated}...", self.kind)
        } else {
            format!("{} {detail}", self.kind)
        }
    }
}

fn invalid(kind: StageKind, reason: impl Into<String>) -> crate::Error {
    crate::Error::InvalidStage {
        kind: kind.as_str(),
        reason: reason.into(),
    }
}

fn compute_cache_key(
    kind: StageKind,
    workdir: &str,
    inputs: &[String],
    content_digest: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(workdir.as_bytes());
    for input in inputs {
        hasher.update([0]);
        hasher.update(input.as_bytes());
    }
    if let Some(digest) = content_digest {
        hasher.update([1]);
        hasher.update(digest.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Joins `path` onto `base` (when relative) and removes `.`/`..` components.
///
/// ```
/// use hoist_core::stage::normalize_path;
///
/// assert_eq!(normalize_path("/usr/share/hue", "./startup.sh"), "/usr/share/hue/startup.sh");
/// assert_eq!(normalize_path("/app", "../etc/"), "/etc");
/// assert_eq!(normalize_path("/app", "/"), "/");
/// ```
pub fn normalize_path(base: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{base}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// True when `ancestor` equals `path` or is one of its parent directories.
pub fn is_path_prefix(ancestor: &str, path: &str) -> bool {
    let ancestor = normalize_path("/", ancestor);
    let path = normalize_path("/", path);
    ancestor == "/"
        || path == ancestor
        || path
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}
