mod console;
mod replay;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use workbench::WorkbenchConfig;

#[derive(Parser, Debug)]
#[command(name = "pixelforge")]
#[command(about = "Replay generated application code against a live sandbox")]
struct Cli {
    /// Configuration file (defaults to <config dir>/pixelforge/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed a recorded model response through the workbench
    Replay(replay::ReplayArgs),
    /// Print the effective configuration
    Config {
        /// Write the defaults to the configuration file if it does not exist
        #[arg(long, default_value_t = false)]
        init: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    // Single-threaded: actions are applied in order on one cooperative runtime
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => WorkbenchConfig::default_path()
            .context("No platform configuration directory; pass --config")?,
    };

    match cli.command {
        Command::Replay(args) => {
            let config = load_config(&config_path).await?;
            replay::run(args, config).await
        }
        Command::Config { init } => show_config(&config_path, init).await,
    }
}

async fn load_config(path: &Path) -> anyhow::Result<WorkbenchConfig> {
    WorkbenchConfig::load(path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn show_config(path: &Path, init: bool) -> anyhow::Result<()> {
    let config = load_config(path).await?;
    if init {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            log::info!("Configuration already exists at {}", path.display());
        } else {
            config
                .save(path)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
    }

    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
