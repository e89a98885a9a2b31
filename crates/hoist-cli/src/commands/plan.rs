use super::Project;

pub async fn plan(project: &Project, json: bool) -> anyhow::Result<()> {
    let (_, _, plan) = project.plan()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Pipeline for {} ({} stages):", plan.platform(), plan.stages().len());
    for (index, stage) in plan.stages().iter().enumerate() {
        let descriptor = &stage.descriptor;
        let key = descriptor.cache_key();
        let key = key.get(..12).unwrap_or(key);
        let cacheable = if descriptor.is_cacheable() { "" } else { "  (always runs)" };
        println!(
            "  {index:>2}  {:<22} {key}  {}{cacheable}",
            stage.phase.as_str(),
            descriptor.label()
        );
    }

    let overlay = plan.overlay();
    println!();
    println!(
        "Runtime: user {} in {}, ports {:?}, entry {:?}",
        overlay.user, overlay.workdir, overlay.ports, overlay.entrypoint
    );
    Ok(())
}
