//! Backhaul relay server
//!
//! Accepts a remote client's control connection, pools the data channels
//! it opens, and relays local TCP/UDP target traffic back through them.

use anyhow::{Context, Result};
use backhaul::config::{ServerConfig, Settings};
use backhaul::{tls, Server};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Backhaul - reverse TCP/UDP tunneling relay, server half
#[derive(Parser, Debug)]
#[command(name = "backhaul-server")]
#[command(about = "Reverse TCP/UDP tunneling relay, server half")]
#[command(version)]
struct Args {
    /// Configuration URL, e.g. server://0.0.0.0:10101/127.0.0.1:8080?tls=1
    url: String,

    /// Optional TOML settings file for tunables and logging
    #[arg(short, long)]
    settings: Option<String>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => Settings::load(path).context("Failed to load settings")?,
        None => Settings::default(),
    };

    let level = args
        .log_level
        .unwrap_or_else(|| settings.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    let config = ServerConfig::from_url(&args.url).context("Invalid configuration URL")?;

    let acceptor = tls::acceptor_for_mode(
        &config.tls_code,
        config.cert_path.as_deref(),
        config.key_path.as_deref(),
    )
    .context("Failed to build TLS acceptor")?;

    info!("Backhaul server v{}", backhaul::VERSION);

    let server = Server::new(config, acceptor, settings.tunables);
    server.manage().await;

    Ok(())
}
