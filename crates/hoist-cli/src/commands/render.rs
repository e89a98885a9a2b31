use hoist_build::DockerfileGenerator;

use super::Project;

pub async fn render(project: &Project) -> anyhow::Result<()> {
    let (_, _, plan) = project.plan()?;
    print!("{}", DockerfileGenerator::new(&plan).render());
    Ok(())
}
