//! Switchboard Server
//!
//! Run with: cargo run -- serve
//!
//! # Configuration
//!
//! Settings come from `--config`, or the first `config.toml` found in the
//! user config directory, `/etc/switchboard` or the working directory.
//! `SWITCHBOARD_*` environment variables override the file, and `RUST_LOG`
//! overrides the configured log level.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use switchboard::config::{generate_default_config, Config, LoggingConfig};
use switchboard::server::HubServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WebSocket message hub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the hub until Ctrl+C or SIGTERM
    Serve {
        /// Config file (default: search standard locations)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the listen host
        #[arg(long)]
        host: Option<String>,
        /// Override the listen port (0 picks a free port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Write a default config file
    InitConfig {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = match config {
                Some(path) => Config::load_with_env(&path)?,
                None => Config::load_default(),
            };
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            init_logging(&config.logging);
            serve(config).await
        }
        Commands::InitConfig { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    println!("Wrote default config to {:?}", path);
                }
                None => print!("{}", content),
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting Switchboard v{}", env!("CARGO_PKG_VERSION"));

    let server = HubServer::new(&config);
    let handlers = server.hub().handlers().kinds();
    if handlers.is_empty() {
        tracing::info!("No handlers configured, every message is relayed");
    } else {
        tracing::info!("Handlers: {}", handlers.join(", "));
    }

    server.run_until_signal().await?;
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("switchboard={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
