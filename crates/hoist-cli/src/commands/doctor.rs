use hoist_core::{IsolationMode, Platform};
use hoist_exec::{CheckResult, PackageInstaller, RetryPolicy};

use super::Project;

pub async fn doctor(project: &Project) -> anyhow::Result<()> {
    let config = project.config();

    let loaded = config
        .as_ref()
        // arch-lint: allow(no-silent-result-drop) reason="doctor must report diagnostics even when hoist.toml is invalid; the error is shown in the config check"
        .ok();
    let isolation = loaded.map(|c| c.backend.isolation).unwrap_or_default();
    let system_installer = loaded.map_or("apt-get", |c| c.installers.system.as_str());

    // Tools every build needs, plus the ones the configured isolation adds
    let mut tools = vec!["git"];
    match isolation {
        IsolationMode::Chroot => tools.extend(["chroot", "debootstrap"]),
        IsolationMode::Rooted | IsolationMode::None => tools.push(system_installer),
    }

    let installer = PackageInstaller::new(RetryPolicy::none());
    let mut report = installer.doctor(&tools).await;

    report.config_file = match (&config, project.manifest().exists()) {
        (Ok(_), true) => CheckResult::ok(&format!("{}", project.manifest().display())),
        (Ok(_), false) => CheckResult::fail(&format!(
            "{} not found, using defaults (run `hoist init`)",
            project.manifest().display()
        )),
        (Err(e), _) => CheckResult::fail(&e.to_string()),
    };

    report.platform = match &config {
        Ok(config) => match config.platform.target.parse::<Platform>() {
            Ok(platform) if hoist_core::resolver::profile(&platform).is_some() => {
                CheckResult::ok(&platform.to_string())
            }
            Ok(platform) => CheckResult::fail(&format!(
                "{platform} is not supported (known: {})",
                hoist_core::resolver::known_platforms().join(", ")
            )),
            Err(e) => CheckResult::fail(&e.to_string()),
        },
        Err(_) => CheckResult::fail("config could not be loaded"),
    };

    println!();
    println!("{report}");

    if !report.all_passed() {
        anyhow::bail!("some checks failed, see above for details");
    }

    Ok(())
}
