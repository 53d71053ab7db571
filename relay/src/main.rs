use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};
use tunnel_relay::config::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load(cli)?;

    let default_directive = if config.silent { "warn" } else { "tunnel_relay=info" };
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .init();

    let secret = config.relay_secret.clone();
    let listeners = tunnel_relay::bind(&config).await?;
    tunnel_relay::serve(listeners, secret, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
