//! huddle-relay: signaling and relay server for huddle sessions.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use huddle_relay::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "huddle-relay")]
#[command(about = "Signaling and relay server for huddle sessions")]
struct Args {
    /// Address to listen on for WebSocket connections
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,huddle_relay=debug,huddle_core=debug"
    } else {
        "info,huddle_relay=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting huddle-relay");
    let listener = RelayServer::bind(&args.listen).await?;
    let server = RelayServer::new();

    info!("Relay running. Press Ctrl+C to stop.");

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
