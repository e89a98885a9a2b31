mod build;
mod doctor;
mod eject;
mod init;
mod plan;
mod render;
mod resolve;

use std::path::{Path, PathBuf};

use anyhow::Context;
use hoist_build::{BuildContext, PipelinePlan};
use hoist_core::config::CONFIG_FILE;
use hoist_core::{DependencySet, HoistConfig, Platform, Resolver};

pub use build::build;
pub use doctor::doctor;
pub use eject::eject;
pub use init::init_project;
pub use plan::plan;
pub use render::render;
pub use resolve::resolve;

/// Project location and overrides shared by every subcommand.
pub struct Project {
    dir: PathBuf,
    manifest: PathBuf,
    platform: Option<String>,
}

impl Project {
    pub fn new(dir: PathBuf, manifest: Option<PathBuf>, platform: Option<String>) -> Self {
        let manifest = manifest.unwrap_or_else(|| dir.join(CONFIG_FILE));
        Self {
            dir,
            manifest,
            platform,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Path {
        &self.manifest
    }

    /// hoist.toml with the `--platform` override applied.
    pub fn config(&self) -> anyhow::Result<HoistConfig> {
        let mut config = HoistConfig::load_file(&self.manifest)?;
        if let Some(platform) = &self.platform {
            config.platform.target = platform.clone();
        }
        Ok(config)
    }

    pub fn resolve(&self, config: &HoistConfig) -> anyhow::Result<(Platform, DependencySet)> {
        let platform: Platform = config.platform.target.parse()?;
        let deps = Resolver::from_config(config).resolve_platform(&platform)?;
        Ok((platform, deps))
    }

    pub fn context(&self) -> anyhow::Result<BuildContext> {
        BuildContext::collect(&self.dir)
            .with_context(|| format!("failed to collect build context from {}", self.dir.display()))
    }

    /// Resolves and plans without building anything.
    pub fn plan(&self) -> anyhow::Result<(HoistConfig, DependencySet, PipelinePlan)> {
        let config = self.config()?;
        let (_, deps) = self.resolve(&config)?;
        let context = self.context()?;
        let plan = PipelinePlan::from_config(&config, &deps, &context)?;
        Ok((config, deps, plan))
    }
}
