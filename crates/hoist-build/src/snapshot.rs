//! Immutable filesystem snapshots.
//!
//! A [`FilesystemSnapshot`] is the image filesystem as seen after some number
//! of layers. It is never shared or cloned: [`FilesystemSnapshot::apply`]
//! consumes the predecessor and returns its successor, so the chain of
//! snapshots is linear and every snapshot has exactly one parent.

use std::collections::{BTreeMap, BTreeSet};

use hoist_core::Platform;
use hoist_core::stage::{is_path_prefix, normalize_path};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ROOT_UID: u32 = 0;

/// First uid handed out to accounts created by the build.
pub const FIRST_USER_UID: u32 = 1000;

const BASE_DIRECTORIES: &[&str] = &[
    "/", "/bin", "/etc", "/home", "/opt", "/root", "/tmp", "/usr", "/usr/bin", "/usr/lib",
    "/usr/local", "/usr/share", "/var",
];

/// One path in the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Entry {
    Directory { owner: u32 },
    File { digest: String, owner: u32 },
}

impl Entry {
    pub fn directory() -> Self {
        Entry::Directory { owner: ROOT_UID }
    }

    pub fn file(digest: impl Into<String>) -> Self {
        Entry::File {
            digest: digest.into(),
            owner: ROOT_UID,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory { .. })
    }

    pub fn owner(&self) -> u32 {
        match self {
            Entry::Directory { owner } | Entry::File { owner, .. } => *owner,
        }
    }

    fn with_owner(&self, uid: u32) -> Self {
        match self {
            Entry::Directory { .. } => Entry::Directory { owner: uid },
            Entry::File { digest, .. } => Entry::File {
                digest: digest.clone(),
                owner: uid,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub uid: u32,
    pub home: String,
}

/// Everything one layer changes. Deltas are what the layer cache stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    /// Removed paths; removing a directory removes everything below it
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub added: BTreeMap<String, Entry>,
    /// Installed package → requested constraint
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, Account>,
    /// Path → uid, applied recursively after additions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub owners: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
}

impl SnapshotDelta {
    /// Records filesystem changes reported by a backend.
    pub fn merge_changes(&mut self, changes: Changes) {
        for path in changes.removed {
            self.added.remove(&path);
            if !self.removed.contains(&path) {
                self.removed.push(path);
            }
        }
        self.added.extend(changes.added);
    }

    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for path in &self.removed {
            record(&mut hasher, "-", &[path]);
        }
        for (path, entry) in &self.added {
            match entry {
                Entry::Directory { owner } => record(&mut hasher, "d", &[path, &owner.to_string()]),
                Entry::File { digest, owner } => {
                    record(&mut hasher, "f", &[path, digest, &owner.to_string()])
                }
            }
        }
        for (name, constraint) in &self.packages {
            record(&mut hasher, "p", &[name, constraint]);
        }
        for (name, account) in &self.users {
            record(&mut hasher, "u", &[name, &account.uid.to_string(), &account.home]);
        }
        for (path, uid) in &self.owners {
            record(&mut hasher, "o", &[path, &uid.to_string()]);
        }
        for (key, value) in &self.env {
            record(&mut hasher, "e", &[key, value]);
        }
        for port in &self.ports {
            record(&mut hasher, "x", &[&port.to_string()]);
        }
        if let Some(argv) = &self.entrypoint {
            let argv: Vec<&String> = argv.iter().collect();
            record(&mut hasher, "c", &argv);
        }
        hex::encode(hasher.finalize())
    }

    /// True when the layer only touches image metadata.
    pub fn is_metadata_only(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.owners.is_empty()
    }
}

/// One tagged, NUL-separated line of a delta digest.
fn record(hasher: &mut Sha256, tag: &str, fields: &[&String]) {
    hasher.update(tag.as_bytes());
    for field in fields {
        hasher.update([0]);
        hasher.update(field.as_bytes());
    }
    hasher.update(b"\n");
}

/// Filesystem changes observed while executing a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub added: BTreeMap<String, Entry>,
    pub removed: Vec<String>,
}

/// The image filesystem after some number of layers.
#[derive(Debug, PartialEq, Eq)]
pub struct FilesystemSnapshot {
    base: String,
    entries: BTreeMap<String, Entry>,
    packages: BTreeMap<String, String>,
    users: BTreeMap<String, Account>,
    env: BTreeMap<String, String>,
    ports: BTreeSet<u16>,
    entrypoint: Vec<String>,
    depth: usize,
    parent: Option<String>,
    digest: String,
}

impl FilesystemSnapshot {
    /// The untouched base image of `platform`.
    pub fn base(platform: &Platform) -> Self {
        let entries = BASE_DIRECTORIES
            .iter()
            .map(|dir| ((*dir).to_owned(), Entry::directory()))
            .collect();
        let users = BTreeMap::from([(
            "root".to_owned(),
            Account {
                uid: ROOT_UID,
                home: "/root".to_owned(),
            },
        )]);
        let mut hasher = Sha256::new();
        hasher.update(b"base\0");
        hasher.update(platform.base_image().as_bytes());
        Self {
            base: platform.base_image(),
            entries,
            packages: BTreeMap::new(),
            users,
            env: BTreeMap::new(),
            ports: BTreeSet::new(),
            entrypoint: Vec::new(),
            depth: 0,
            parent: None,
            digest: hex::encode(hasher.finalize()),
        }
    }

    /// Produces the successor snapshot. Removals are applied before additions.
    pub fn apply(mut self, delta: &SnapshotDelta) -> Self {
        for path in &delta.removed {
            let path = normalize_path("/", path);
            self.entries.retain(|existing, _| !is_path_prefix(&path, existing));
        }

        for (path, entry) in &delta.added {
            let path = normalize_path("/", path);
            self.ensure_parents(&path, entry.owner());
            self.entries.insert(path, entry.clone());
        }

        for (root, uid) in &delta.owners {
            let root = normalize_path("/", root);
            if root == "/" {
                continue;
            }
            for (path, entry) in self.entries.iter_mut() {
                if is_path_prefix(&root, path) {
                    *entry = entry.with_owner(*uid);
                }
            }
        }

        self.packages
            .extend(delta.packages.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.users
            .extend(delta.users.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.env
            .extend(delta.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.ports.extend(delta.ports.iter().copied());
        if let Some(entrypoint) = &delta.entrypoint {
            self.entrypoint = entrypoint.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.digest.as_bytes());
        hasher.update([0]);
        hasher.update(delta.digest().as_bytes());
        let digest = hex::encode(hasher.finalize());

        self.parent = Some(std::mem::replace(&mut self.digest, digest));
        self.depth += 1;
        self
    }

    fn ensure_parents(&mut self, path: &str, owner: u32) {
        let mut current = String::new();
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            current.push('/');
            current.push_str(component);
            self.entries
                .entry(current.clone())
                .or_insert(Entry::Directory { owner });
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Base image reference the chain started from, e.g. `ubuntu:18.04`.
    pub fn base_image(&self) -> &str {
        &self.base
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Number of layers applied on top of the base image.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn entry(&self, path: &str) -> Option<&Entry> {
        self.entries.get(&normalize_path("/", path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.entry(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.entry(path).is_some_and(Entry::is_dir)
    }

    pub fn packages(&self) -> &BTreeMap<String, String> {
        &self.packages
    }

    pub fn user(&self, name: &str) -> Option<&Account> {
        self.users.get(name)
    }

    /// Lowest free uid at or above [`FIRST_USER_UID`].
    pub fn next_uid(&self) -> u32 {
        let taken: BTreeSet<u32> = self.users.values().map(|a| a.uid).collect();
        (FIRST_USER_UID..)
            .find(|uid| !taken.contains(uid))
            .unwrap_or(FIRST_USER_UID)
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn ports(&self) -> &BTreeSet<u16> {
        &self.ports
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }
}
