use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use hoist_build::context::{self, ContextError};
use hoist_build::{HostBackend, ImageAssembler, ImageManifest, LayerBuilder, LayerCache};
use hoist_core::{HoistConfig, IsolationMode, Platform};
use hoist_exec::RetryPolicy;

use super::Project;

/// Build the image for `project` and write its manifest to `out`.
pub async fn build(
    project: &Project,
    out: &Path,
    allow_dirty: bool,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let project_dir = project.dir();

    // Dirty check: refuse to build uncommitted changes unless --allow-dirty
    if !allow_dirty {
        match context::is_dirty(project_dir) {
            Ok(true) => anyhow::bail!(
                "uncommitted changes detected.\n\
                 Commit your changes, or use `hoist build --allow-dirty` to build anyway."
            ),
            Ok(false) => {}
            Err(ContextError::GitFailed { detail }) => {
                tracing::debug!(%detail, "not a git work tree, skipping dirty check");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let config = project.config()?;
    let platform: Platform = config.platform.target.parse()?;
    let build_context = project.context()?;

    println!("Building {} image from {}...", platform, project_dir.display());

    let staging = project_dir.join(&config.backend.staging_dir);
    if config.backend.isolation != IsolationMode::None {
        discard_staging(&staging)?;
    }

    let cache_dir = project_dir.join(&config.cache.dir);
    let cache = if config.cache.enabled {
        LayerCache::open(&cache_dir)
            .with_context(|| format!("failed to open layer cache at {}", cache_dir.display()))?
    } else {
        LayerCache::in_memory()
    };

    let backend = host_backend(&config, &platform, staging.clone(), &cache_dir);
    let builder = LayerBuilder::new(backend, cache).with_context(build_context.clone());
    let mut assembler = ImageAssembler::new(builder);

    let run = assembler.run(&config, &build_context);
    let result = match timeout {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
            Ok(result) => result,
            Err(_elapsed) => {
                discard_staging(&staging)?;
                anyhow::bail!("build timed out after {secs}s; staging root discarded");
            }
        },
        None => run.await,
    };

    let manifest = match result {
        Ok(manifest) => manifest,
        Err(e) => {
            let kind = e.kind();
            eprintln!("Staging root left at {} for inspection", staging.display());
            return Err(anyhow::Error::new(e).context(format!("build failed [{kind}]")));
        }
    };

    manifest
        .write(out)
        .with_context(|| format!("failed to write manifest to {}", out.display()))?;
    print_summary(&manifest, out);
    Ok(())
}

fn host_backend(
    config: &HoistConfig,
    platform: &Platform,
    staging: PathBuf,
    cache_dir: &Path,
) -> HostBackend {
    let mode = config.backend.isolation;
    let mut backend = HostBackend::new(staging, mode, RetryPolicy::from_config(&config.retry));
    if config.cache.enabled {
        backend = backend.with_blob_dir(cache_dir.join("blobs"));
    }
    match mode {
        IsolationMode::Chroot => backend.with_bootstrap(platform.clone()),
        IsolationMode::Rooted => backend,
        IsolationMode::None => {
            let mut watch = vec![config.build.app_dir.clone(), config.runtime.workdir.clone()];
            watch.extend(config.build.build_only.iter().cloned());
            watch.sort();
            watch.dedup();
            backend.watching(watch)
        }
    }
}

fn discard_staging(staging: &Path) -> anyhow::Result<()> {
    if staging.exists() {
        tracing::debug!(root = %staging.display(), "removing staging root");
        std::fs::remove_dir_all(staging)
            .with_context(|| format!("failed to remove staging root {}", staging.display()))?;
    }
    Ok(())
}

fn print_summary(manifest: &ImageManifest, out: &Path) {
    let cached = manifest.layers.iter().filter(|layer| layer.cached).count();
    println!();
    println!("Image sealed: {}", manifest.digest);
    println!("  base:    {}", manifest.base);
    println!("  layers:  {} ({cached} from cache)", manifest.layers.len());
    println!("  user:    {}", manifest.user);
    println!("  workdir: {}", manifest.workdir);
    println!("  entry:   {:?}", manifest.entrypoint);
    println!("Manifest written to {}", out.display());
}
