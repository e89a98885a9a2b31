//! Resolved dependency sets.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version requirement for a single package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "version")]
pub enum VersionConstraint {
    /// Whatever the package source currently ships.
    Latest,
    /// An exact version string as understood by the package manager.
    Exact(String),
}

impl VersionConstraint {
    /// Parses a constraint from config: empty, `*` or `latest` mean unconstrained.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" || raw.eq_ignore_ascii_case("latest") {
            VersionConstraint::Latest
        } else {
            VersionConstraint::Exact(raw.to_owned())
        }
    }

    pub fn exact(&self) -> Option<&str> {
        match self {
            VersionConstraint::Latest => None,
            VersionConstraint::Exact(v) => Some(v),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Latest => f.write_str("latest"),
            VersionConstraint::Exact(v) => f.write_str(v),
        }
    }
}

/// Which package manager installs a dependency, and at which pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Distribution package installed with the system package manager.
    System,
    /// Language runtime or build toolchain.
    Toolchain,
    /// Runtime plugin installed after the application build.
    Plugin,
}

/// Where a dependency is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum PackageSource {
    /// The base distribution's default repositories.
    Distribution,
    /// An additional repository enabled to satisfy a pin.
    Supplemental(String),
    /// The language-level package index used for plugins.
    PluginIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub constraint: VersionConstraint,
    pub source: PackageSource,
}

/// A package deliberately left out, with the reason it was excluded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Exclusion {
    pub name: String,
    pub reason: String,
}

/// Mapping from package name to its resolved requirement.
///
/// Names are unique across all kinds; [`DependencySet::insert`] rejects a
/// second entry with an existing name. The set is built once by the
/// resolver and only read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySet {
    entries: BTreeMap<String, Dependency>,
    exclusions: Vec<Exclusion>,
    /// Supplemental source name → command that enables it
    sources: BTreeMap<String, String>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, dependency: Dependency) -> crate::Result<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(crate::Error::DuplicateDependency { name });
        }
        self.entries.insert(name, dependency);
        Ok(())
    }

    /// Records an exclusion and drops any entry of the same name.
    pub fn exclude(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        let name = name.into();
        self.entries.remove(&name);
        if !self.exclusions.iter().any(|e| e.name == name) {
            self.exclusions.push(Exclusion {
                name,
                reason: reason.into(),
            });
            self.exclusions.sort();
        }
    }

    pub fn add_source(&mut self, name: impl Into<String>, setup: impl Into<String>) {
        self.sources.insert(name.into(), setup.into());
    }

    /// Supplemental sources with their setup commands, in name order.
    pub fn sources(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sources.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.entries.get(name)
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclusions.iter().any(|e| e.name == name)
    }

    pub fn exclusion(&self, name: &str) -> Option<&Exclusion> {
        self.exclusions.iter().find(|e| e.name == name)
    }

    pub fn exclusions(&self) -> &[Exclusion] {
        &self.exclusions
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dependency)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries of one kind, in name order.
    pub fn of_kind(&self, kind: DependencyKind) -> impl Iterator<Item = (&str, &Dependency)> {
        self.iter().filter(move |(_, d)| d.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(v: VersionConstraint) -> Dependency {
        Dependency {
            kind: DependencyKind::System,
            constraint: v,
            source: PackageSource::Distribution,
        }
    }

    #[test]
    fn constraint_parse() {
        assert_eq!(VersionConstraint::parse(""), VersionConstraint::Latest);
        assert_eq!(VersionConstraint::parse("*"), VersionConstraint::Latest);
        assert_eq!(VersionConstraint::parse("LATEST"), VersionConstraint::Latest);
        assert_eq!(
            VersionConstraint::parse(" 1.0 "),
            VersionConstraint::Exact("1.0".to_owned())
        );
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut set = DependencySet::new();
        set.insert("gcc", system(VersionConstraint::Latest)).unwrap();
        let err = set.insert("gcc", system(VersionConstraint::Latest)).unwrap_err();
        assert!(matches!(err, crate::Error::DuplicateDependency { ref name } if name == "gcc"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn exclude_removes_and_records_reason() {
        let mut set = DependencySet::new();
        set.insert("libfoo-dev", system(VersionConstraint::Latest)).unwrap();
        set.exclude("libfoo-dev", "breaks the build");
        set.exclude("libfoo-dev", "second reason ignored");

        assert!(set.get("libfoo-dev").is_none());
        assert!(set.is_excluded("libfoo-dev"));
        assert_eq!(set.exclusions().len(), 1);
        assert_eq!(set.exclusion("libfoo-dev").unwrap().reason, "breaks the build");
    }
}
