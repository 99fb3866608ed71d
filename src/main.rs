use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use toolpool::config;
use toolpool::manager::ConnectionManager;

#[derive(Parser)]
#[command(name = "toolpool")]
#[command(about = "Pooled, fault-tolerant connections to external tool servers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to YAML config file (environment variables used otherwise)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tools a server advertises
    Tools {
        /// Server name from the configuration
        server: String,
    },

    /// Invoke a tool on a server
    Call {
        /// Server name from the configuration
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },

    /// Show pool status and metrics
    Status {
        /// Limit output to one server
        #[arg(long)]
        server: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;
    info!(servers = config.servers.len(), "configuration loaded");

    let manager = Arc::new(ConnectionManager::from_config(&config));
    manager.initialize(config.descriptors()).await?;

    let result = run_command(&manager, cli.command).await;

    manager.shutdown().await;
    result
}

async fn run_command(manager: &Arc<ConnectionManager>, command: Commands) -> Result<()> {
    match command {
        Commands::Tools { server } => {
            let facade = manager.facade(&server).await?;
            let tools = facade.list_tools().await?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
        }
        Commands::Call { server, tool, args } => {
            let args: Value = match args {
                Some(raw) => serde_json::from_str(&raw)
                    .context("--args must be a valid JSON object")?,
                None => Value::Object(Default::default()),
            };
            let facade = manager.facade(&server).await?;
            let result = facade.call_tool(&tool, args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status { server } => match server {
            Some(server) => {
                let pool = manager.pool(&server).await?;
                pool.report_status().await;
                let snapshot = manager
                    .server_metrics(&server)
                    .await
                    .context(format!("no metrics recorded for server '{server}'"))?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            None => {
                for server in manager.servers().await {
                    let pool = manager.pool(&server).await?;
                    pool.report_status().await;
                }
                let summary = manager.metrics_summary().await;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        },
    }

    Ok(())
}
