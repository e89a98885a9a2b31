//! Target base distribution identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Known base distribution families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Ubuntu,
    Debian,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Ubuntu => "ubuntu",
            OsFamily::Debian => "debian",
        }
    }

    /// Default archive mirror, used when bootstrapping a staging root.
    pub fn mirror(&self) -> &'static str {
        match self {
            OsFamily::Ubuntu => "http://archive.ubuntu.com/ubuntu",
            OsFamily::Debian => "http://deb.debian.org/debian",
        }
    }
}

impl FromStr for OsFamily {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ubuntu" => Ok(OsFamily::Ubuntu),
            "debian" => Ok(OsFamily::Debian),
            _ => Err(crate::Error::UnsupportedPlatform {
                requested: s.to_owned(),
                known: crate::resolver::known_platforms(),
            }),
        }
    }
}

/// A base platform such as `ubuntu-18.04`.
///
/// Parsing only checks the shape `<os>-<version>` and the OS family; whether
/// the version is actually supported is decided by the resolver table.
///
/// # Examples
///
/// ```
/// use hoist_core::Platform;
///
/// let p: Platform = "ubuntu-18.04".parse().unwrap();
/// assert_eq!(p.version, "18.04");
/// assert_eq!(p.to_string(), "ubuntu-18.04");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub os: OsFamily,
    pub version: String,
}

impl Platform {
    pub fn new(os: OsFamily, version: impl Into<String>) -> Self {
        Self {
            os,
            version: version.into(),
        }
    }

    /// Base image reference used when rendering a Dockerfile.
    pub fn base_image(&self) -> String {
        format!("{}:{}", self.os.as_str(), self.version)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os.as_str(), self.version)
    }
}

impl FromStr for Platform {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let unsupported = || crate::Error::UnsupportedPlatform {
            requested: s.to_owned(),
            known: crate::resolver::known_platforms(),
        };

        let (os, version) = s.split_once(['-', ':']).ok_or_else(unsupported)?;
        if version.is_empty() {
            return Err(unsupported());
        }
        let os = os.parse::<OsFamily>().map_err(|_| unsupported())?;
        Ok(Self::new(os, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dash_and_colon_forms() {
        let a: Platform = "ubuntu-18.04".parse().unwrap();
        let b: Platform = "ubuntu:18.04".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.base_image(), "ubuntu:18.04");
    }

    #[test]
    fn rejects_unknown_family() {
        let err = "alpine-3.19".parse::<Platform>().unwrap_err();
        assert!(matches!(err, crate::Error::UnsupportedPlatform { .. }));
    }

    #[test]
    fn rejects_missing_version() {
        assert!("ubuntu".parse::<Platform>().is_err());
        assert!("ubuntu-".parse::<Platform>().is_err());
    }
}
