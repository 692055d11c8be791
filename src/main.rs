use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use throttle_guard::config::Config;
use throttle_guard::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "throttle-guard", version, about = "Request throttling server")]
struct Cli {
    /// Address to listen on, overrides BIND_ADDR
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// JSON throttle configuration file, overrides THROTTLE_CONFIG
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(path) = cli.config {
        config.throttle_config = Some(path);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("throttle_guard={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting throttle guard");
    tracing::info!(
        "Configuration: bind_addr={}, storage={:?}",
        config.bind_addr,
        config.storage
    );

    let server = Server::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
