use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use ferrisbak::backup::{self, BackupOptions};
use ferrisbak::{AutomationEngine, Config, Inventory};

#[derive(Parser)]
#[command(name = "ferrisbak")]
#[command(about = "Scripted configuration backups for network devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up every device matching FILTER
    Backup(BackupArgs),

    /// Validate the configuration and compile all scripts
    Check,
}

#[derive(Args)]
struct BackupArgs {
    /// Address devices upload to (overrides preferences.host_ip)
    #[arg(long)]
    host_ip: Option<String>,

    /// Backup root (overrides preferences.backup_dir)
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Glob over device names, e.g. "core/*"
    #[arg(default_value = "*")]
    filter: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Backup(args) => {
            if let Some(dir) = args.backup_dir {
                config.preferences.backup_dir = Some(dir);
            }
            run_backup(config, args.host_ip, &args.filter).await
        }
        Commands::Check => run_check(&config),
    }
}

async fn run_backup(config: Config, host_ip: Option<String>, filter: &str) -> Result<ExitCode> {
    let engine = Arc::new(AutomationEngine::new());
    let inventory = Inventory::build(&config, &engine).context("Invalid configuration")?;
    let options = BackupOptions::from_config(&config, host_ip).context("Invalid configuration")?;
    let devices = inventory.select(filter)?;

    let report = backup::run(config.ssh_connector(), engine, devices, &options)
        .await
        .context("Failed to start TFTP intake server")?;

    println!("{}", report);

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn run_check(config: &Config) -> Result<ExitCode> {
    let inventory =
        Inventory::build(config, &AutomationEngine::new()).context("Invalid configuration")?;

    for class in inventory.classes.values() {
        info!("class '{}': {} targets", class.name, class.targets.len());
    }
    println!(
        "Configuration OK: {} devices, {} device classes",
        inventory.devices.len(),
        inventory.classes.len()
    );
    Ok(ExitCode::SUCCESS)
}
