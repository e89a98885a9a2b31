use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config")]
    ConfigSerialize { source: toml::ser::Error },

    // ── Platform resolution ──
    #[error(
        "unsupported platform '{requested}'; known platforms: {}",
        format_list(known)
    )]
    UnsupportedPlatform {
        requested: String,
        known: Vec<String>,
    },

    #[error(
        "pinned {package} {requested} is not available for {platform} \
         (distribution ships {available}; no supplemental source carries it)"
    )]
    VersionPinConflict {
        package: String,
        requested: String,
        platform: String,
        available: String,
    },

    #[error("dependency '{name}' declared twice")]
    DuplicateDependency { name: String },

    // ── Stage construction ──
    #[error("invalid {kind} stage: {reason}")]
    InvalidStage { kind: &'static str, reason: String },

    #[error("stage working directory {path:?} must be absolute")]
    RelativeWorkdir { path: String },
}

fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_owned()
    } else {
        items.join(", ")
    }
}
