use hoist_core::{StageDescriptor, StageKind};
use hoist_exec::PackageManager;

use crate::assembler::{Phase, PipelinePlan};

/// Renders a [`PipelinePlan`] as an equivalent single-stage Dockerfile.
pub struct DockerfileGenerator<'a> {
    plan: &'a PipelinePlan,
}

impl<'a> DockerfileGenerator<'a> {
    pub fn new(plan: &'a PipelinePlan) -> Self {
        Self { plan }
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "# Generated by hoist for {platform}\nFROM {base}\n",
            platform = self.plan.platform(),
            base = self.plan.platform().base_image(),
        );
        let mut phase: Option<Phase> = None;
        let mut workdir = "/".to_owned();

        for stage in self.plan.stages() {
            if phase != Some(stage.phase) {
                out.push_str(&format!("\n# === {} ===\n", stage.phase.as_str()));
                phase = Some(stage.phase);
            }
            let descriptor = &stage.descriptor;
            if needs_workdir(descriptor) && descriptor.workdir() != workdir {
                workdir = descriptor.workdir().to_owned();
                out.push_str(&format!("WORKDIR {workdir}\n"));
            }
            out.push_str(&instruction(descriptor));
            out.push('\n');
        }

        let overlay = self.plan.overlay();
        out.push_str(&format!(
            "\n# === runtime ===\nWORKDIR {}\nUSER {}\n",
            overlay.workdir, overlay.user
        ));
        out
    }
}

fn needs_workdir(stage: &StageDescriptor) -> bool {
    matches!(stage.kind(), StageKind::Run | StageKind::InstallPackages)
}

fn instruction(stage: &StageDescriptor) -> String {
    let inputs = stage.inputs();
    match stage.kind() {
        StageKind::InstallPackages => {
            let installer = stage.installer().unwrap_or_default();
            let manager = PackageManager::detect(installer);
            let specs: Vec<String> = stage
                .packages()
                .iter()
                .map(|(name, constraint)| match manager {
                    Some(manager) => manager.package_spec(name, constraint),
                    None => name.clone(),
                })
                .collect();
            let list = specs.join(" \\\n    ");
            match manager {
                Some(PackageManager::Apt) => format!(
                    "RUN apt-get update \\\n && DEBIAN_FRONTEND=noninteractive {installer} install -y --no-install-recommends \\\n    {list} \\\n && rm -rf /var/lib/apt/lists/*"
                ),
                Some(PackageManager::Pip) => {
                    format!("RUN {installer} install --no-cache-dir \\\n    {list}")
                }
                Some(PackageManager::Npm) => format!("RUN {installer} install --global \\\n    {list}"),
                None => format!("RUN {installer} install \\\n    {list}"),
            }
        }
        StageKind::Copy => match inputs {
            [source, dest] => format!("COPY {source} {}", stage.resolve(dest)),
            _ => String::new(),
        },
        StageKind::Run => format!("RUN {}", inputs.join(" ")),
        StageKind::SetEnv => {
            let vars: Vec<String> = inputs
                .iter()
                .filter_map(|input| input.split_once('='))
                .map(|(key, value)| format!("{key}={}", quote(value)))
                .collect();
            format!("ENV {}", vars.join(" "))
        }
        StageKind::ExposePort => format!("EXPOSE {}", inputs.join(" ")),
        StageKind::SetEntrypoint => {
            let argv: Vec<String> = inputs.iter().map(|arg| quote(arg)).collect();
            format!("CMD [{}]", argv.join(", "))
        }
        StageKind::Prune => format!("RUN rm -rf {}", inputs.join(" ")),
        StageKind::CreateUser => match inputs {
            [name, home] => format!(
                "RUN useradd --user-group --home-dir {home} --no-create-home --shell /bin/sh {name} \\\n && chown -R {name}:{name} {home}"
            ),
            _ => String::new(),
        },
    }
}

/// Double-quoted with `"` and `\` escaped, valid both for ENV and JSON-form CMD.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
