pub mod config;
pub mod pool;

use config::AgentConfig;
use pool::PoolConfig;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tunnel_core::tls::build_client_config;

pub fn pool_config(config: &AgentConfig) -> anyhow::Result<PoolConfig> {
    let relay_client_config = match &config.relay_tls {
        Some(tls) => Some(build_client_config(tls)?),
        None => None,
    };
    let target_client_config = match &config.target_tls {
        Some(tls) => Some(build_client_config(tls)?),
        None => None,
    };

    Ok(PoolConfig {
        relay_host: config.relay_host.clone(),
        relay_addr: config.relay_addr,
        relay_client_config,
        target_host: config.target_host.clone(),
        target_addr: config.target_addr,
        target_client_config,
        relay_secret: config.relay_secret.clone(),
        target_timeout: config.target_timeout,
        relay_timeout: config.relay_timeout,
    })
}

/// Run the pool until `shutdown` resolves, then stop scheduling replacements
/// and abort every in-flight pool member.
pub async fn serve(
    pool_cfg: Arc<PoolConfig>,
    pool_size: u32,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let terminating = Arc::new(AtomicBool::new(false));
    let pool_task = tokio::spawn(pool::run(Arc::clone(&pool_cfg), pool_size, Arc::clone(&terminating)));

    shutdown.await;
    tracing::info!("shutdown signal received, terminating pool");
    terminating.store(true, std::sync::atomic::Ordering::Relaxed);
    pool_task.abort();

    Ok(())
}
