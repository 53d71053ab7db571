use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};
use tunnel_agent::config::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load(cli)?;

    let default_directive = if config.silent { "warn" } else { "tunnel_agent=info" };
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .init();

    tracing::info!(relay_addr = %config.relay_addr, target_addr = %config.target_addr, pool_size = config.pool_size, "starting agent pool");

    let pool_size = config.pool_size;
    let pool_cfg = std::sync::Arc::new(tunnel_agent::pool_config(&config)?);
    tunnel_agent::serve(pool_cfg, pool_size, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
