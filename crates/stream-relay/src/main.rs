use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::{path::PathBuf, sync::Arc};
use stream_relay::{mcp::DefaultHandler, Config, Server};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stream-relay", about = "Session-multiplexed streamable HTTP server")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve(ServeArgs),
    /// Print the effective configuration as TOML
    PrintConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to a TOML config file
    #[arg(long, env = "STREAM_RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Host to bind to
    #[arg(long, env = "STREAM_RELAY_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, short, env = "PORT")]
    port: Option<u16>,

    /// Bearer token required on the session route
    #[arg(long, env = "STREAM_RELAY_API_KEY")]
    api_key: Option<String>,
}

impl ConfigArgs {
    fn load(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::load(path),
            None => Ok(Config::default()),
        }
    }
}

impl ServeArgs {
    fn resolve(&self) -> Result<Config> {
        let mut config = self.config.load()?;
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(api_key) = &self.api_key {
            config.server.api_key = Some(api_key.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Serve(args) => serve(args.resolve()?).await,
        Commands::PrintConfig(args) => {
            print!("{}", args.load()?.to_redacted_toml()?);
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let address = config.server.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind to {}", address))?;

    let token = CancellationToken::new();
    let server = Arc::new(Server::new(
        config.clone(),
        Arc::new(DefaultHandler),
        token.clone(),
    )?);

    let url = format!("http://{}{}", address, config.server.path);
    println!("{} {}", "stream-relay".bright_purple().bold(), env!("CARGO_PKG_VERSION"));
    println!("Listening on {}", url.bright_white().bold());
    if config.server.api_key.is_some() {
        println!("{}", "Bearer authentication enabled".green());
    } else {
        println!("{}", "No API key configured; session route is open".yellow());
    }

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Received shutdown signal");
        token.cancel();
    });

    server.serve(listener).await
}
