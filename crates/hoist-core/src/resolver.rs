//! Platform → dependency resolution over a static compatibility table.
//!
//! The table records, per supported base distribution, the system packages
//! the build needs, the toolchain versions the distribution ships, the
//! supplemental sources able to provide newer toolchains, and packages known
//! to break the build there.
//!
//! Toolchain pins are minimums. When the distribution default already meets
//! the pin it is used as is; otherwise a supplemental source carrying the
//! pinned version is enabled. If none does, resolution fails with
//! [`Error::VersionPinConflict`](crate::Error::VersionPinConflict) rather
//! than picking an older version.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::config::HoistConfig;
use crate::dependency::{Dependency, DependencyKind, DependencySet, PackageSource, VersionConstraint};
use crate::platform::{OsFamily, Platform};

/// A supported base distribution.
#[derive(Debug)]
pub struct PlatformProfile {
    pub os: OsFamily,
    pub version: &'static str,
    pub codename: &'static str,
    /// Packages installed with the system package manager before anything else
    pub system_packages: &'static [&'static str],
    pub toolchains: &'static [Toolchain],
    /// Packages that must not be installed on this platform, with the reason
    pub exclusions: &'static [(&'static str, &'static str)],
}

#[derive(Debug)]
pub struct Toolchain {
    pub name: &'static str,
    /// Version shipped by the distribution's default repositories
    pub default_version: &'static str,
    /// Package names with `{v}` substituted by the selected version, and an
    /// optional version constraint template
    pub packages: &'static [(&'static str, Option<&'static str>)],
    pub sources: &'static [SupplementalSource],
}

#[derive(Debug)]
pub struct SupplementalSource {
    /// Source name, `{v}` substituted
    pub name: &'static str,
    /// Command enabling the source, `{v}` substituted
    pub setup: &'static str,
    pub versions: &'static [&'static str],
}

const DEADSNAKES_SETUP: &str = "add-apt-repository -y ppa:deadsnakes/ppa && apt-get update";
const NODESOURCE_SETUP: &str = "curl -fsSL https://deb.nodesource.com/setup_{v}.x | bash -";

const PYTHON_PACKAGES: &[(&str, Option<&str>)] = &[
    ("python{v}", None),
    ("python{v}-dev", None),
    ("python{v}-venv", None),
];
const NODE_PACKAGES: &[(&str, Option<&str>)] = &[("nodejs", Some("{v}.*"))];

const COMMON_BUILD_PACKAGES: &[&str] = &[
    "build-essential",
    "ca-certificates",
    "curl",
    "git",
    "libffi-dev",
    "libgmp3-dev",
    "libkrb5-dev",
    "libldap2-dev",
    "libpq-dev",
    "libsasl2-dev",
    "libsasl2-modules-gssapi-mit",
    "libsqlite3-dev",
    "libssl-dev",
    "libxml2-dev",
    "libxslt1-dev",
    "make",
    "rsync",
    "software-properties-common",
    "sudo",
];

const UBUNTU_BUILD_PACKAGES: &[&str] = &[
    "build-essential",
    "ca-certificates",
    "curl",
    "git",
    "libffi-dev",
    "libgmp3-dev",
    "libkrb5-dev",
    "libldap2-dev",
    "libmysqlclient-dev",
    "libpq-dev",
    "libsasl2-dev",
    "libsasl2-modules-gssapi-mit",
    "libsqlite3-dev",
    "libssl-dev",
    "libxml2-dev",
    "libxslt1-dev",
    "make",
    "rsync",
    "software-properties-common",
    "sudo",
];

const PROFILES: &[PlatformProfile] = &[
    PlatformProfile {
        os: OsFamily::Ubuntu,
        version: "18.04",
        codename: "bionic",
        system_packages: UBUNTU_BUILD_PACKAGES,
        toolchains: &[
            Toolchain {
                name: "python",
                default_version: "3.6",
                packages: PYTHON_PACKAGES,
                sources: &[SupplementalSource {
                    name: "deadsnakes",
                    setup: DEADSNAKES_SETUP,
                    versions: &["3.7", "3.8", "3.9", "3.10"],
                }],
            },
            Toolchain {
                name: "nodejs",
                default_version: "8",
                packages: NODE_PACKAGES,
                sources: &[SupplementalSource {
                    name: "nodesource-{v}.x",
                    setup: NODESOURCE_SETUP,
                    versions: &["10", "12", "14", "16"],
                }],
            },
        ],
        exclusions: &[(
            "libmariadbclient-dev",
            "conflicts with libmysqlclient-dev headers and breaks the build",
        )],
    },
    PlatformProfile {
        os: OsFamily::Ubuntu,
        version: "20.04",
        codename: "focal",
        system_packages: UBUNTU_BUILD_PACKAGES,
        toolchains: &[
            Toolchain {
                name: "python",
                default_version: "3.8",
                packages: PYTHON_PACKAGES,
                sources: &[SupplementalSource {
                    name: "deadsnakes",
                    setup: DEADSNAKES_SETUP,
                    versions: &["3.9", "3.10", "3.11"],
                }],
            },
            Toolchain {
                name: "nodejs",
                default_version: "10",
                packages: NODE_PACKAGES,
                sources: &[SupplementalSource {
                    name: "nodesource-{v}.x",
                    setup: NODESOURCE_SETUP,
                    versions: &["14", "16", "18", "20"],
                }],
            },
        ],
        exclusions: &[],
    },
    PlatformProfile {
        os: OsFamily::Ubuntu,
        version: "22.04",
        codename: "jammy",
        system_packages: UBUNTU_BUILD_PACKAGES,
        toolchains: &[
            Toolchain {
                name: "python",
                default_version: "3.10",
                packages: PYTHON_PACKAGES,
                sources: &[SupplementalSource {
                    name: "deadsnakes",
                    setup: DEADSNAKES_SETUP,
                    versions: &["3.11", "3.12"],
                }],
            },
            Toolchain {
                name: "nodejs",
                default_version: "12",
                packages: NODE_PACKAGES,
                sources: &[SupplementalSource {
                    name: "nodesource-{v}.x",
                    setup: NODESOURCE_SETUP,
                    versions: &["16", "18", "20"],
                }],
            },
        ],
        exclusions: &[],
    },
    PlatformProfile {
        os: OsFamily::Debian,
        version: "11",
        codename: "bullseye",
        system_packages: COMMON_BUILD_PACKAGES,
        toolchains: &[
            Toolchain {
                name: "python",
                default_version: "3.9",
                packages: PYTHON_PACKAGES,
                sources: &[],
            },
            Toolchain {
                name: "nodejs",
                default_version: "12",
                packages: NODE_PACKAGES,
                sources: &[SupplementalSource {
                    name: "nodesource-{v}.x",
                    setup: NODESOURCE_SETUP,
                    versions: &["14", "16", "18", "20"],
                }],
            },
        ],
        exclusions: &[(
            "software-properties-common",
            "PPA tooling is unused on Debian and pulls in python3 from the distribution",
        )],
    },
    PlatformProfile {
        os: OsFamily::Debian,
        version: "12",
        codename: "bookworm",
        system_packages: COMMON_BUILD_PACKAGES,
        toolchains: &[
            Toolchain {
                name: "python",
                default_version: "3.11",
                packages: PYTHON_PACKAGES,
                sources: &[],
            },
            Toolchain {
                name: "nodejs",
                default_version: "18",
                packages: NODE_PACKAGES,
                sources: &[SupplementalSource {
                    name: "nodesource-{v}.x",
                    setup: NODESOURCE_SETUP,
                    versions: &["20", "22"],
                }],
            },
        ],
        exclusions: &[(
            "software-properties-common",
            "PPA tooling is unused on Debian and pulls in python3 from the distribution",
        )],
    },
];

/// All platform identifiers the table supports, e.g. `ubuntu-18.04`.
pub fn known_platforms() -> Vec<String> {
    PROFILES
        .iter()
        .map(|p| format!("{}-{}", p.os.as_str(), p.version))
        .collect()
}

/// Looks up the table entry for a platform.
pub fn profile(platform: &Platform) -> Option<&'static PlatformProfile> {
    PROFILES
        .iter()
        .find(|p| p.os == platform.os && p.version == platform.version)
}

/// Resolves dependency sets for a fixed set of pins, plugins and exclusions.
///
/// # Examples
///
/// ```
/// use hoist_core::{DependencyKind, PackageSource, Resolver};
///
/// let deps = Resolver::new()
///     .pin("python", "3.8")
///     .resolve("ubuntu", "18.04")
///     .unwrap();
/// let python = deps.get("python3.8").unwrap();
/// assert_eq!(python.kind, DependencyKind::Toolchain);
/// assert_eq!(python.source, PackageSource::Supplemental("deadsnakes".to_owned()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    pins: BTreeMap<String, String>,
    plugins: BTreeMap<String, String>,
    exclusions: Vec<(String, String)>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver carrying the pins, plugins and exclusions from hoist.toml.
    pub fn from_config(config: &HoistConfig) -> Self {
        Self {
            pins: config.toolchain.clone(),
            plugins: config.plugins.clone(),
            exclusions: config
                .exclude
                .iter()
                .map(|e| (e.name.clone(), e.reason.clone()))
                .collect(),
        }
    }

    pub fn pin(mut self, toolchain: impl Into<String>, version: impl Into<String>) -> Self {
        self.pins.insert(toolchain.into(), version.into());
        self
    }

    pub fn plugin(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.plugins.insert(name.into(), version.into());
        self
    }

    pub fn exclude(mut self, name: impl Into<String>, reason: impl Into<String>) -> Self {
        self.exclusions.push((name.into(), reason.into()));
        self
    }

    /// Resolve for `target_os` (e.g. `ubuntu`) at `target_os_version` (e.g. `18.04`).
    pub fn resolve(&self, target_os: &str, target_os_version: &str) -> crate::Result<DependencySet> {
        let os = target_os.parse::<OsFamily>()?;
        self.resolve_platform(&Platform::new(os, target_os_version))
    }

    pub fn resolve_platform(&self, platform: &Platform) -> crate::Result<DependencySet> {
        let profile = profile(platform).ok_or_else(|| crate::Error::UnsupportedPlatform {
            requested: platform.to_string(),
            known: known_platforms(),
        })?;
        tracing::debug!(platform = %platform, codename = profile.codename, "resolving dependencies");

        let mut set = DependencySet::new();

        for name in profile.system_packages {
            set.insert(
                *name,
                Dependency {
                    kind: DependencyKind::System,
                    constraint: VersionConstraint::Latest,
                    source: PackageSource::Distribution,
                },
            )?;
        }

        for (toolchain_name, pinned) in &self.pins {
            let toolchain = profile
                .toolchains
                .iter()
                .find(|t| t.name == toolchain_name.as_str())
                .ok_or_else(|| crate::Error::VersionPinConflict {
                    package: toolchain_name.clone(),
                    requested: pinned.clone(),
                    platform: platform.to_string(),
                    available: "(not packaged)".to_owned(),
                })?;

            let (version, source) = select_toolchain(toolchain, pinned, platform)?;
            if let PackageSource::Supplemental(source_name) = &source
                && let Some(supplemental) = toolchain
                    .sources
                    .iter()
                    .find(|s| expand(s.name, &version) == *source_name)
            {
                set.add_source(source_name.clone(), expand(supplemental.setup, &version));
            }

            for (package, constraint) in toolchain.packages {
                set.insert(
                    expand(package, &version),
                    Dependency {
                        kind: DependencyKind::Toolchain,
                        constraint: match constraint {
                            Some(template) => VersionConstraint::Exact(expand(template, &version)),
                            None => VersionConstraint::Latest,
                        },
                        source: source.clone(),
                    },
                )?;
            }
            tracing::debug!(
                toolchain = toolchain_name.as_str(),
                pinned = pinned.as_str(),
                selected = version.as_str(),
                "toolchain resolved"
            );
        }

        for (name, version) in &self.plugins {
            set.insert(
                name.clone(),
                Dependency {
                    kind: DependencyKind::Plugin,
                    constraint: VersionConstraint::parse(version),
                    source: PackageSource::PluginIndex,
                },
            )?;
        }

        for (name, reason) in profile.exclusions {
            set.exclude(*name, *reason);
        }
        for (name, reason) in &self.exclusions {
            set.exclude(name.clone(), reason.clone());
        }

        tracing::info!(
            platform = %platform,
            dependencies = set.len(),
            exclusions = set.exclusions().len(),
            "dependencies resolved"
        );
        Ok(set)
    }
}

/// Picks the toolchain version and its source for a minimum pin.
fn select_toolchain(
    toolchain: &Toolchain,
    pinned: &str,
    platform: &Platform,
) -> crate::Result<(String, PackageSource)> {
    if compare_versions(toolchain.default_version, pinned) != Ordering::Less {
        return Ok((toolchain.default_version.to_owned(), PackageSource::Distribution));
    }

    toolchain
        .sources
        .iter()
        .find(|s| s.versions.iter().any(|v| compare_versions(v, pinned) == Ordering::Equal))
        .map(|s| {
            (
                pinned.to_owned(),
                PackageSource::Supplemental(expand(s.name, pinned)),
            )
        })
        .ok_or_else(|| crate::Error::VersionPinConflict {
            package: toolchain.name.to_owned(),
            requested: pinned.to_owned(),
            platform: platform.to_string(),
            available: toolchain.default_version.to_owned(),
        })
}

fn expand(template: &str, version: &str) -> String {
    template.replace("{v}", version)
}

/// Compares dotted versions numerically where both components are numbers.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
