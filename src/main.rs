//! # version-keeper CLI (`vk`)
//!
//! ## Usage
//!
//! ```bash
//! vk --config ./config/vk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vk init` | Create an empty deployment catalog |
//! | `vk add <file.json>` | Insert or replace records from a JSON file |
//! | `vk status [all\|app.name]` | Print the status table |
//! | `vk update [all\|app.name]` | Check for new versions |
//! | `vk upgrade <app.name>` | Pin a deployment to its latest version |
//! | `vk hold <app.name>` | Freeze a deployment at its current version |
//! | `vk release <app.name>` | Lift a hold |
//! | `vk remove <app.name>` | Delete a record |
//! | `vk watch` | Check periodically until Ctrl-C |
//! | `vk serve` | Start the HTTP server (and the watcher when `[schedule]` is set) |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use version_keeper::commands::{dispatch, parse_identity, Command, Target};
use version_keeper::config::{self, Config};
use version_keeper::handlers::Handlers;
use version_keeper::models::Deployment;
use version_keeper::{schedule, server};

/// version-keeper: tracks deployed application versions and pins upgrades
/// into a GitOps repository.
#[derive(Parser)]
#[command(name = "vk", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the catalog if it does not exist yet.
    Init,

    /// Insert or replace deployments from a JSON file (one record or an
    /// array of records).
    Add { file: PathBuf },

    /// Show one or all deployments.
    Status {
        #[arg(default_value = "all")]
        target: String,
    },

    /// Look for new versions.
    Update {
        #[arg(default_value = "all")]
        target: String,
    },

    /// Upgrade one deployment to its latest known version.
    Upgrade { deployment: String },

    /// Stop a deployment from being upgraded.
    Hold { deployment: String },

    /// Allow upgrades again after `hold`.
    Release { deployment: String },

    /// Delete a deployment from the catalog.
    Remove { deployment: String },

    /// Run `update all` periodically until interrupted.
    Watch {
        /// Seconds between passes. Defaults to `[schedule].interval_secs`.
        #[arg(long)]
        interval: Option<u64>,

        /// Upgrade records as soon as a new version is found.
        #[arg(long)]
        auto_upgrade: bool,
    },

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let handlers = Handlers::from_config(&cfg)?;

    match cli.command {
        Commands::Init => init_catalog(&cfg, &handlers).await?,
        Commands::Add { file } => add_deployments(&handlers, &file).await?,
        Commands::Status { target } => run(&handlers, Command::Status(target.parse()?)).await?,
        Commands::Update { target } => {
            let target: Target = target.parse()?;
            run(&handlers, Command::Update(target)).await?
        }
        Commands::Upgrade { deployment } => {
            let (app, name) = parse_identity(&deployment)?;
            run(&handlers, Command::Upgrade { app, name }).await?
        }
        Commands::Hold { deployment } => {
            let (app, name) = parse_identity(&deployment)?;
            run(&handlers, Command::Hold { app, name }).await?
        }
        Commands::Release { deployment } => {
            let (app, name) = parse_identity(&deployment)?;
            run(&handlers, Command::Release { app, name }).await?
        }
        Commands::Remove { deployment } => {
            let (app, name) = parse_identity(&deployment)?;
            run(&handlers, Command::Remove { app, name }).await?
        }
        Commands::Watch {
            interval,
            auto_upgrade,
        } => {
            let configured = cfg.schedule.as_ref();
            let secs = interval
                .or(configured.map(|s| s.interval_secs))
                .unwrap_or(3600);
            if secs == 0 {
                anyhow::bail!("--interval must be > 0");
            }
            let auto_upgrade = auto_upgrade || configured.is_some_and(|s| s.auto_upgrade);
            schedule::run_watch(handlers, Duration::from_secs(secs), auto_upgrade).await?;
        }
        Commands::Serve => {
            if let Some(watch) = cfg.schedule.clone() {
                let watcher = handlers.clone();
                tokio::spawn(async move {
                    let interval = Duration::from_secs(watch.interval_secs);
                    if let Err(e) =
                        schedule::run_watch(watcher, interval, watch.auto_upgrade).await
                    {
                        tracing::error!(error = format!("{:#}", e), "watcher stopped");
                    }
                });
            }
            server::run_server(&cfg.server.bind, handlers).await?;
        }
    }

    Ok(())
}

async fn run(handlers: &Handlers, command: Command) -> Result<()> {
    let output = dispatch(handlers, command).await?;
    println!("{}", output);
    Ok(())
}

async fn init_catalog(cfg: &Config, handlers: &Handlers) -> Result<()> {
    let store = handlers.store();
    if !store.exists().await? {
        tracing::info!(backend = %cfg.store.backend, "catalog missing, creating it");
        store.create().await?;
    }
    let count = store.load_all().await?.len();
    println!("Catalog ready ({} deployments).", count);
    Ok(())
}

async fn add_deployments(handlers: &Handlers, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", file.display()))?;

    let records: Vec<Deployment> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    for record in &records {
        handlers.set_deployment(record).await?;
        println!("Saved {}", record.identity());
    }
    Ok(())
}
