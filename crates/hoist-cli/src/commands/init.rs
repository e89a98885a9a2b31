use std::path::Path;

use hoist_build::eject::HOIST_DIR;
use hoist_core::HoistConfig;
use hoist_core::config::CONFIG_FILE;

/// Write a default hoist.toml and keep hoist's state out of version control.
pub async fn init_project() -> anyhow::Result<()> {
    let mut created = Vec::new();

    let config_path = Path::new(CONFIG_FILE);
    if config_path.exists() {
        eprintln!("{CONFIG_FILE} already exists, skipping");
    } else {
        let content = HoistConfig::default().to_toml()?;
        std::fs::write(config_path, content)?;
        created.push(CONFIG_FILE);
    }

    let gitignore_path = Path::new(".gitignore");
    let ignore_line = format!("/{HOIST_DIR}/");
    let existing = if gitignore_path.exists() {
        std::fs::read_to_string(gitignore_path)?
    } else {
        String::new()
    };
    if existing.lines().any(|line| line.trim() == ignore_line) {
        eprintln!(".gitignore already ignores {HOIST_DIR}, skipping");
    } else {
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&ignore_line);
        content.push('\n');
        std::fs::write(gitignore_path, content)?;
        created.push(".gitignore");
    }

    if created.is_empty() {
        println!("Nothing to create, already initialized.");
    } else {
        for f in &created {
            println!("Updated {f}");
        }
    }

    println!();
    println!("Next steps:");
    println!();
    println!("  1. Pin toolchains and list plugins in {CONFIG_FILE}:");
    println!("     [toolchain]");
    println!("     python = \"3.8\"");
    println!("     [plugins]");
    println!("     connector-a = \"1.0\"");
    println!();
    println!("  2. Check the plan:");
    println!("     hoist plan");
    println!();
    println!("  3. Build:");
    println!("     hoist build --out image-manifest.json");

    Ok(())
}
