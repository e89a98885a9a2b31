//! Image assembler: orders stages into phases and drives the layer builder.
//!
//! ```text
//! hoist build
//!   1. Resolve     ── Resolver::resolve_platform()  → DependencySet
//!   2. Plan        ── PipelinePlan::from_config()   → PipelinePlan (prune policy checked here)
//!   3. Assemble    ── LayerBuilder::apply() per stage, strictly in order
//!   4. Configure   ── RuntimeConfigurator::configure() → ImageManifest
//! ```

use std::path::Path;

use hoist_core::stage::{is_path_prefix, normalize_path};
use hoist_core::{
    DependencyKind, DependencySet, HoistConfig, Platform, Resolver, StageDescriptor, StageKind,
    VersionConstraint,
};
use serde::Serialize;

use crate::backend::StageBackend;
use crate::configurator::{ConfigOverlay, RuntimeConfigurator};
use crate::context::{BuildContext, ContextError};
use crate::layer::LayerBuilder;
use crate::manifest::{ImageManifest, LayerRecord};
use crate::pipeline::{PipelineError, PipelineState};
use crate::snapshot::FilesystemSnapshot;

/// Pipeline phases, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SystemPackages,
    Sources,
    Toolchain,
    Build,
    Prune,
    Plugins,
    RuntimeConfig,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::SystemPackages => "system packages",
            Phase::Sources => "supplemental sources",
            Phase::Toolchain => "toolchain",
            Phase::Build => "build",
            Phase::Prune => "prune",
            Phase::Plugins => "plugins",
            Phase::RuntimeConfig => "runtime configuration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStage {
    pub phase: Phase,
    pub descriptor: StageDescriptor,
}

/// A validated, ordered stage sequence plus the runtime overlay it must satisfy.
#[derive(Debug, Clone, Serialize)]
pub struct PipelinePlan {
    platform: Platform,
    stages: Vec<PlannedStage>,
    overlay: ConfigOverlay,
}

impl PipelinePlan {
    /// Validates phase order and the pruning policy.
    ///
    /// Prune stages must follow the build phase, and no prune target may
    /// equal or contain a path the runtime overlay or a later stage relies on.
    pub fn new(
        platform: Platform,
        stages: Vec<PlannedStage>,
        overlay: ConfigOverlay,
    ) -> Result<Self, AssembleError> {
        let mut previous: Option<Phase> = None;
        let mut built = false;
        for (index, stage) in stages.iter().enumerate() {
            if let Some(prev) = previous
                && stage.phase < prev
            {
                return Err(AssembleError::PhaseOrder {
                    stage: stage.descriptor.label(),
                    phase: stage.phase,
                    after: prev,
                });
            }
            previous = Some(stage.phase);
            built |= stage.phase == Phase::Build;

            let is_prune = stage.descriptor.kind() == StageKind::Prune;
            if is_prune != (stage.phase == Phase::Prune) {
                return Err(AssembleError::MisplacedPrune {
                    stage: stage.descriptor.label(),
                    phase: stage.phase,
                });
            }
            if !is_prune {
                continue;
            }
            if !built {
                return Err(AssembleError::PruneBeforeBuild {
                    stage: stage.descriptor.label(),
                });
            }

            let protected = protected_paths(&overlay, &stages[index + 1..]);
            for target in stage.descriptor.inputs() {
                if let Some((path, role)) = protected
                    .iter()
                    .find(|(path, _)| is_path_prefix(target, path))
                {
                    return Err(AssembleError::PruneOverlap {
                        target: target.clone(),
                        path: path.clone(),
                        role,
                    });
                }
            }
        }
        Ok(Self {
            platform,
            stages,
            overlay,
        })
    }

    /// Derives the stage sequence from hoist.toml and the resolved dependencies.
    pub fn from_config(
        config: &HoistConfig,
        deps: &DependencySet,
        context: &BuildContext,
    ) -> Result<PipelinePlan, AssembleError> {
        let platform: Platform = config.platform.target.parse()?;
        let build = &config.build;
        let runtime = &config.runtime;
        let system = config.installers.system.as_str();
        let mut stages = Vec::new();
        let mut push = |phase, descriptor| stages.push(PlannedStage { phase, descriptor });

        let system_packages = packages_of(deps, DependencyKind::System);
        if !system_packages.is_empty() {
            push(
                Phase::SystemPackages,
                StageDescriptor::install_packages(system, &system_packages, "/")?,
            );
        }
        for (_, setup) in deps.sources() {
            push(Phase::Sources, StageDescriptor::run(setup, "/", false)?);
        }
        let toolchain = packages_of(deps, DependencyKind::Toolchain);
        if !toolchain.is_empty() {
            push(
                Phase::Toolchain,
                StageDescriptor::install_packages(system, &toolchain, "/")?,
            );
        }

        let app_dir = normalize_path("/", &build.app_dir);
        push(
            Phase::Build,
            StageDescriptor::copy(
                &build.source_dir,
                &app_dir,
                &context.digest(&build.source_dir)?,
                &app_dir,
            )?,
        );
        for step in &build.steps {
            push(
                Phase::Build,
                StageDescriptor::run(&step.run, &app_dir, step.cacheable)?,
            );
        }
        if !build.build_only.is_empty() {
            push(
                Phase::Prune,
                StageDescriptor::prune(&build.build_only, &app_dir)?,
            );
        }

        let plugins = packages_of(deps, DependencyKind::Plugin);
        if !plugins.is_empty() {
            push(
                Phase::Plugins,
                StageDescriptor::install_packages(&config.installers.plugin, &plugins, &app_dir)?,
            );
        }

        let workdir = normalize_path("/", &runtime.workdir);
        if let Some(config_dir) = &runtime.config_dir {
            push(
                Phase::RuntimeConfig,
                StageDescriptor::copy(
                    config_dir,
                    &runtime.config_target,
                    &context.digest(config_dir)?,
                    &workdir,
                )?,
            );
        }
        if let Some(script) = &runtime.startup_script {
            let file_name = Path::new(script)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| script.clone());
            push(
                Phase::RuntimeConfig,
                StageDescriptor::copy(script, &file_name, &context.digest(script)?, &workdir)?,
            );
        }
        push(
            Phase::RuntimeConfig,
            StageDescriptor::create_user(&runtime.user, &workdir, &workdir)?,
        );
        if !runtime.env.is_empty() {
            push(
                Phase::RuntimeConfig,
                StageDescriptor::set_env(
                    runtime.env.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                    &workdir,
                )?,
            );
        }
        if !runtime.ports.is_empty() {
            push(
                Phase::RuntimeConfig,
                StageDescriptor::expose_port(&runtime.ports, &workdir)?,
            );
        }
        if !runtime.entrypoint.is_empty() {
            push(
                Phase::RuntimeConfig,
                StageDescriptor::set_entrypoint(&runtime.entrypoint, &workdir)?,
            );
        }

        let plan = Self::new(platform, stages, ConfigOverlay::from_runtime(runtime))?;
        tracing::info!(
            platform = %plan.platform,
            stages = plan.stages.len(),
            "pipeline planned"
        );
        Ok(plan)
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn overlay(&self) -> &ConfigOverlay {
        &self.overlay
    }

    pub fn cache_keys(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.descriptor.cache_key()).collect()
    }

    /// Every installed package must be declared in `deps` and not excluded.
    pub fn check_dependencies(&self, deps: &DependencySet) -> Result<(), AssembleError> {
        for stage in &self.stages {
            for (name, _) in stage.descriptor.packages() {
                if let Some(exclusion) = deps.exclusion(&name) {
                    return Err(AssembleError::ExcludedPackage {
                        package: name,
                        reason: exclusion.reason.clone(),
                    });
                }
                if deps.get(&name).is_none() {
                    return Err(AssembleError::UndeclaredPackage { package: name });
                }
            }
        }
        Ok(())
    }
}

/// Paths a prune stage must leave alone, with what depends on them.
fn protected_paths(overlay: &ConfigOverlay, later: &[PlannedStage]) -> Vec<(String, &'static str)> {
    let mut paths = vec![(overlay.workdir.clone(), "runtime working directory")];
    if let Some(program) = overlay.entry_program() {
        paths.push((program, "entry command"));
    }
    paths.extend(
        overlay
            .targets
            .iter()
            .map(|target| (target.clone(), "runtime-required path")),
    );
    for stage in later {
        let descriptor = &stage.descriptor;
        paths.push((descriptor.workdir().to_owned(), "working directory of a later stage"));
        if descriptor.kind() == StageKind::Copy
            && let Some(dest) = descriptor.inputs().get(1)
        {
            paths.push((descriptor.resolve(dest), "destination of a later copy"));
        }
        if let Some(installer) = descriptor.installer()
            && installer.contains('/')
        {
            paths.push((descriptor.resolve(installer), "installer of a later stage"));
        }
    }
    paths
}

/// Runs a [`PipelinePlan`] through a [`LayerBuilder`] and seals the result.
pub struct ImageAssembler<B: StageBackend> {
    builder: LayerBuilder<B>,
    configurator: RuntimeConfigurator,
    state: PipelineState,
}

impl<B: StageBackend> ImageAssembler<B> {
    pub fn new(builder: LayerBuilder<B>) -> Self {
        Self {
            builder,
            configurator: RuntimeConfigurator,
            state: PipelineState::Initialized,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn builder(&self) -> &LayerBuilder<B> {
        &self.builder
    }

    /// Executes the plan's stages exactly in declared order on top of the base image.
    pub async fn assemble(
        &mut self,
        plan: &PipelinePlan,
        deps: &DependencySet,
    ) -> Result<(FilesystemSnapshot, Vec<LayerRecord>), PipelineError> {
        if self.state.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                from: self.state.clone(),
                to: PipelineState::Building(0),
            });
        }
        if self.state == PipelineState::Initialized {
            self.transition(PipelineState::Resolving)?;
        }
        let result = self.assemble_stages(plan, deps).await;
        let saved = self.builder.save_cache();
        let assembled = self.settle(result)?;
        if let Err(e) = saved {
            tracing::warn!(error = %e, "failed to persist layer cache");
        }
        Ok(assembled)
    }

    async fn assemble_stages(
        &mut self,
        plan: &PipelinePlan,
        deps: &DependencySet,
    ) -> Result<(FilesystemSnapshot, Vec<LayerRecord>), PipelineError> {
        plan.check_dependencies(deps)?;
        self.builder.prepare().await.map_err(PipelineError::Setup)?;

        let mut snapshot = FilesystemSnapshot::base(plan.platform());
        let mut layers = Vec::with_capacity(plan.stages().len());
        for (index, stage) in plan.stages().iter().enumerate() {
            let next = if stage.descriptor.kind() == StageKind::Prune {
                PipelineState::Pruning
            } else {
                PipelineState::Building(index)
            };
            self.state.transition(next)?;
            let (successor, record) = self
                .builder
                .apply(snapshot, &stage.descriptor)
                .await
                .map_err(|source| PipelineError::Stage {
                    index,
                    label: stage.descriptor.label(),
                    source,
                })?;
            snapshot = successor;
            layers.push(record);
        }
        Ok((snapshot, layers))
    }

    /// Validates the overlay against the final snapshot and seals the manifest.
    pub fn seal(
        &mut self,
        snapshot: &FilesystemSnapshot,
        overlay: &ConfigOverlay,
        layers: &[LayerRecord],
    ) -> Result<ImageManifest, PipelineError> {
        self.transition(PipelineState::Configuring)?;
        let result = self
            .configurator
            .configure(snapshot, overlay, layers)
            .map_err(PipelineError::from);
        let manifest = self.settle(result)?;
        self.transition(PipelineState::Sealed)?;
        Ok(manifest)
    }

    /// The whole run: resolve, plan, assemble, seal.
    pub async fn run(
        &mut self,
        config: &HoistConfig,
        context: &BuildContext,
    ) -> Result<ImageManifest, PipelineError> {
        self.transition(PipelineState::Resolving)?;
        let planned = config
            .platform
            .target
            .parse::<Platform>()
            .and_then(|platform| Resolver::from_config(config).resolve_platform(&platform))
            .map_err(PipelineError::from)
            .and_then(|deps| {
                PipelinePlan::from_config(config, &deps, context)
                    .map(|plan| (plan, deps))
                    .map_err(PipelineError::from)
            });
        let (plan, deps) = self.settle(planned)?;

        let (snapshot, layers) = self.assemble(&plan, &deps).await?;
        self.seal(&snapshot, plan.overlay(), &layers)
    }

    fn transition(&mut self, next: PipelineState) -> Result<(), PipelineError> {
        let result = self.state.transition(next);
        self.settle(result)
    }

    /// Records a failure in the pipeline state before handing it on.
    fn settle<T>(&mut self, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if let Err(e) = &result {
            tracing::error!(kind = e.kind(), error = %e, state = %self.state, "pipeline failed");
            self.state.fail(format!("{}: {e}", e.kind()));
        }
        result
    }
}

fn packages_of(deps: &DependencySet, kind: DependencyKind) -> Vec<(String, VersionConstraint)> {
    deps.of_kind(kind)
        .map(|(name, dep)| (name.to_owned(), dep.constraint.clone()))
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("prune target {target} would remove {path} ({role})")]
    PruneOverlap {
        target: String,
        path: String,
        role: &'static str,
    },

    #[error("stage '{stage}' prunes before anything was built")]
    PruneBeforeBuild { stage: String },

    #[error("stage '{stage}' is in the {} phase; prune stages belong to the prune phase only", .phase.as_str())]
    MisplacedPrune { stage: String, phase: Phase },

    #[error("stage '{stage}' ({}) cannot run after the {} phase", .phase.as_str(), .after.as_str())]
    PhaseOrder {
        stage: String,
        phase: Phase,
        after: Phase,
    },

    #[error("package '{package}' is excluded: {reason}")]
    ExcludedPackage { package: String, reason: String },

    #[error("package '{package}' is not in the resolved dependency set")]
    UndeclaredPackage { package: String },

    #[error(transparent)]
    Descriptor(#[from] hoist_core::Error),

    #[error(transparent)]
    Context(#[from] ContextError),
}
