//! revive CLI - drive the runtime over stdio
//!
//! `serve` reads NDJSON requests on stdin and answers on stdout; logs go to
//! stderr so stdout stays the wire channel.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revive::interpreter::CalcFactory;
use revive::runtime::storage::{self, FileStore, MemoryStore, SnapshotStore};
use revive::runtime::{Runtime, RuntimeConfig};
use revive::service::Service;
use std::path::PathBuf;
use tokio::io::BufReader;

#[derive(Parser)]
#[command(name = "revive")]
#[command(about = "Session resurrection runtime for stateless hosts", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for file-backed snapshots
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Accepted serverID
    #[arg(long)]
    namespace: Option<String>,

    /// Idle grace period in milliseconds
    #[arg(long)]
    idle_grace_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer NDJSON requests from stdin
    Serve {
        /// Keep snapshots in memory instead of on disk
        #[arg(long)]
        memory: bool,

        /// Script queued after every reset
        #[arg(long)]
        init: Option<PathBuf>,
    },

    /// Write the effective configuration to a file
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = effective_config(&cli)?;

    match cli.command {
        Commands::Serve { memory, init } => {
            let mut factory = CalcFactory::new();
            if let Some(path) = init {
                let script = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read init script: {:?}", path))?;
                factory = factory.with_init_script(script);
            }

            if memory {
                serve(Runtime::new(config, MemoryStore::new(), factory)).await?;
            } else {
                let store = FileStore::open(&config.store_root).with_context(|| {
                    format!("Failed to open snapshot store: {:?}", config.store_root)
                })?;
                serve(Runtime::new(config, store, factory)).await?;
            }
        }

        Commands::InitConfig { path } => {
            storage::write_config(&path, &config)?;
            eprintln!("Wrote configuration to {:?}", path);
        }
    }

    Ok(())
}

fn effective_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => storage::load_config(path)?,
        None => RuntimeConfig::default(),
    };

    if let Some(dir) = &cli.store_dir {
        config.store_root = dir.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.namespace = Some(namespace.clone());
    }
    if let Some(ms) = cli.idle_grace_ms {
        config.idle_grace_ms = ms;
    }

    Ok(config)
}

async fn serve<S: SnapshotStore>(runtime: Runtime<S, CalcFactory>) -> Result<()> {
    let mut service = Service::new(runtime);
    service
        .handle(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("Service loop failed")?;
    Ok(())
}
