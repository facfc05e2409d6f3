use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use soht::config::Config;
use soht::pool::AddressPool;
use soht::socks::Socks5Server;
use soht::transport::Transport;

/// Tunnel client: local SOCKS5 proxy over an HTTP upload/download transport
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
    config.validate_client()?;
    let config = Arc::new(config);

    let pool = AddressPool::new(
        &config.addresses,
        config.port,
        &config.host,
        config.tls,
    );
    Arc::clone(&pool).spawn_prober();

    let transport = Arc::new(Transport::new(Arc::clone(&config), Arc::clone(&pool))?);
    let socks = Socks5Server::new(transport);

    info!(
        "starting SOCKS5 client on port {} toward {} endpoint(s)",
        config.proxy_port,
        config.addresses.len()
    );

    tokio::select! {
        result = socks.run(config.proxy_port) => result?,
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            socks.stop(Duration::from_secs(10)).await;
            pool.stop();
        }
    }

    Ok(())
}
