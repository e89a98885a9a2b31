mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hoist", about = "Assemble reproducible application images from hoist.toml")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default hoist.toml into the current directory
    Init,
    /// Print the resolved dependency set for the target platform
    Resolve {
        #[command(flatten)]
        project: ProjectArgs,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the ordered build stages with their cache keys
    Plan {
        #[command(flatten)]
        project: ProjectArgs,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Build the image and write its manifest
    Build {
        #[command(flatten)]
        project: ProjectArgs,
        /// Where to write the image manifest
        #[arg(long, default_value = "image-manifest.json")]
        out: PathBuf,
        /// Allow building with uncommitted changes
        #[arg(long)]
        allow_dirty: bool,
        /// Abort the whole build after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the equivalent Dockerfile
    Render {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Eject the Dockerfile to .hoist/Dockerfile for manual customization
    Eject {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Check that the host tools a build needs are available
    Doctor {
        #[command(flatten)]
        project: ProjectArgs,
    },
}

/// Where the project lives and what to build it for.
#[derive(Args, Clone)]
struct ProjectArgs {
    /// Target platform, e.g. ubuntu-18.04 (overrides hoist.toml)
    #[arg(long)]
    platform: Option<String>,
    /// Project source directory
    #[arg(long, default_value = ".")]
    source: PathBuf,
    /// Path to hoist.toml (default: <source>/hoist.toml)
    #[arg(long)]
    manifest: Option<PathBuf>,
}

impl From<ProjectArgs> for commands::Project {
    fn from(args: ProjectArgs) -> Self {
        commands::Project::new(args.source, args.manifest, args.platform)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => commands::init_project().await?,
        Commands::Resolve { project, json } => commands::resolve(&project.into(), json).await?,
        Commands::Plan { project, json } => commands::plan(&project.into(), json).await?,
        Commands::Build {
            project,
            out,
            allow_dirty,
            timeout,
        } => commands::build(&project.into(), &out, allow_dirty, timeout).await?,
        Commands::Render { project } => commands::render(&project.into()).await?,
        Commands::Eject { project } => commands::eject(&project.into()).await?,
        Commands::Doctor { project } => commands::doctor(&project.into()).await?,
    }

    Ok(())
}
