use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mesh_hub::Hub;
use mesh_hub::config::{FileConfig, HubConfig, load_config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "mesh-hub")]
#[command(about = "Signaling hub for browser peer meshes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub in the foreground
    Serve(ServeArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on, 0 = auto-select (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to config.toml
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => run_server(args).await,
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    let default_directive = if args.debug {
        "mesh_hub=debug,tower_http=debug,info"
    } else {
        "mesh_hub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(&args.config)
        .extract()
        .context("Failed to load configuration")?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    let config = HubConfig::from_file(&file_config)?;

    let hub = Arc::new(Hub::new(config.ice.clone()));
    let cancel = CancellationToken::new();
    let keepalive = (!config.keepalive_interval.is_zero())
        .then(|| hub.spawn_keepalive(config.keepalive_interval, cancel.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Signaling hub listening on ws://{}/", listener.local_addr()?);

    let shutdown_cancel = cancel.clone();
    let shutdown_hub = hub.clone();
    let shutdown_signal = async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
            }
            _ = shutdown_cancel.cancelled() => {}
        }
        info!("Received shutdown signal, cleaning up...");
        // Upgraded sockets are not tracked by graceful shutdown.
        shutdown_hub.close_all();
    };

    let server_result = mesh_hub::server::serve(listener, hub.clone(), shutdown_signal)
        .await
        .context("Server error");

    cancel.cancel();
    if let Some(task) = keepalive {
        let _ = task.await;
    }
    info!(sessions = hub.session_count(), "Shutdown complete");
    server_result
}
