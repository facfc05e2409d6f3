use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use soht::config::Config;
use soht::server::Handler;

/// Tunnel server: terminates HTTP upload/download sessions and dials targets
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("soht=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Config::load(&args.config)?;
    config.validate_server()?;

    let port = if config.port == 0 { 8080 } else { config.port };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("tunnel server listening on 0.0.0.0:{port}");

    let handler = Handler::new(&config);
    Arc::clone(&handler).spawn_reaper();

    tokio::select! {
        result = handler.serve(listener) => result?,
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }

    Ok(())
}
