use hoist_build::DockerfileGenerator;

use super::Project;

pub async fn eject(project: &Project) -> anyhow::Result<()> {
    let (_, _, plan) = project.plan()?;
    let dockerfile = DockerfileGenerator::new(&plan).render();

    let path = hoist_build::eject::eject(project.dir(), &dockerfile)?;

    println!("Ejected build config to {}", path.display());
    println!("You can now edit it directly and build it with any container toolchain.");
    Ok(())
}
