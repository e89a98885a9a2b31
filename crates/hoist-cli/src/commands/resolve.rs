use hoist_core::{DependencyKind, PackageSource};

use super::Project;

pub async fn resolve(project: &Project, json: bool) -> anyhow::Result<()> {
    let config = project.config()?;
    let (platform, deps) = project.resolve(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&deps)?);
        return Ok(());
    }

    println!("Dependencies for {platform}:");
    for kind in [DependencyKind::System, DependencyKind::Toolchain, DependencyKind::Plugin] {
        for (name, dep) in deps.of_kind(kind) {
            let source = match &dep.source {
                PackageSource::Distribution => "distribution".to_owned(),
                PackageSource::Supplemental(name) => format!("supplemental:{name}"),
                PackageSource::PluginIndex => "plugin index".to_owned(),
            };
            println!(
                "  {:<9} {name:<32} {:<10} {source}",
                kind_label(kind),
                dep.constraint.to_string()
            );
        }
    }

    let mut sources = deps.sources().peekable();
    if sources.peek().is_some() {
        println!();
        println!("Supplemental sources:");
        for (name, setup) in sources {
            println!("  {name}: {setup}");
        }
    }

    if !deps.exclusions().is_empty() {
        println!();
        println!("Excluded:");
        for exclusion in deps.exclusions() {
            println!("  {}: {}", exclusion.name, exclusion.reason);
        }
    }
    Ok(())
}

fn kind_label(kind: DependencyKind) -> &'static str {
    match kind {
        DependencyKind::System => "system",
        DependencyKind::Toolchain => "toolchain",
        DependencyKind::Plugin => "plugin",
    }
}
