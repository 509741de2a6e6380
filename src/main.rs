//! Command-line front end for the half-map local filter.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use halfmap_filter::{plugin::CITATION, Config};

#[derive(Parser)]
#[command(name = "halfmap-filter")]
#[command(about = "Locally filter cryo-EM half-maps with SIDESPLITTER", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the OpenMP thread count
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the filter job (default if no command specified)
    Run,

    /// Continue a job after a failure, skipping completed steps
    Resume,

    /// Print whether the job's outputs are ready
    Summary,

    /// Forget completed steps so the next run starts from scratch
    Reset,

    /// Validate configuration and inputs
    Validate,

    /// Unpack and compile the filter binary
    Install,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Print the reference to cite
    Cite,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => run_command(cli.config, cli.threads, false).await?,
        Some(Commands::Resume) => run_command(cli.config, cli.threads, true).await?,
        Some(Commands::Summary) => summary_command(cli.config)?,
        Some(Commands::Reset) => reset_command(cli.config)?,
        Some(Commands::Validate) => validate_command(cli.config, cli.threads)?,
        Some(Commands::Install) => install_command(cli.config).await?,
        Some(Commands::GenerateConfig { output }) => generate_config_command(output)?,
        Some(Commands::Cite) => println!("{CITATION}"),
    }

    Ok(())
}

fn load_config(path: &Path, threads: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(t) = threads {
        config.threads = t;
    }
    config.validate()?;
    Ok(config)
}

async fn run_command(config_path: PathBuf, threads: Option<usize>, resume: bool) -> Result<()> {
    let config = load_config(&config_path, threads)?;
    let job = config.build_job()?;

    let outputs = if resume {
        job.resume().await?
    } else {
        job.run().await?
    };

    for volume in outputs.iter() {
        println!(
            "{}: {} ({} px, {:.4} Å/px)",
            volume.label,
            volume.path.display(),
            volume.dimension,
            volume.sampling_rate
        );
    }
    println!("{}", job.summary());
    Ok(())
}

fn summary_command(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path, None)?;
    let job = config.build_job()?;
    println!("{}", job.summary());
    for relation in job.relations()? {
        println!("  {} -> {}", relation.source, relation.target);
    }
    Ok(())
}

fn reset_command(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path, None)?;
    let job = config.build_job()?;
    job.reset()?;
    println!("{}", job.summary());
    Ok(())
}

fn validate_command(config_path: PathBuf, threads: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, threads)?;
    let job = config.build_job()?;
    let plugin = config.plugin();

    println!("Configuration is valid");
    println!("  Run directory: {}", job.run_dir().display());
    println!("  Arguments: {}", job.run_parameters().argument_map());
    println!("  Threads: {}", config.threads);
    if !plugin.is_installed() {
        tracing::warn!(
            "{} not found; run `halfmap-filter install`",
            plugin.program().display()
        );
    }
    Ok(())
}

async fn install_command(config_path: PathBuf) -> Result<()> {
    // The tool home is the only thing install needs, so a missing config is fine.
    let plugin = if config_path.exists() {
        Config::from_file(&config_path)?.plugin()
    } else {
        halfmap_filter::ToolPlugin::from_env()
    };
    plugin.install().await?;
    println!("Installed {}", plugin.program().display());
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = Config::sample().to_yaml()?;
    std::fs::write(&output, yaml)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Generated sample configuration at {}", output.display());
    Ok(())
}
