pub mod config;

use config::{ListenerTlsConfig, RelayConfig};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tunnel_core::auth::{self, AuthOutcome};
use tunnel_core::listener::{Listener, ListenerTransport};
use tunnel_core::matcher::{Matcher, Side};
use tunnel_core::pipe::PipeRole;
use tunnel_core::pump;
use tunnel_core::tunnel_key::identity_tunnel_key;

async fn build_listener(
    addr: std::net::SocketAddr,
    tls: &Option<ListenerTlsConfig>,
    role: PipeRole,
    idle_timeout: Option<std::time::Duration>,
) -> anyhow::Result<Listener> {
    let transport = match tls {
        Some(tls_cfg) => {
            let server_config = tunnel_core::tls::build_server_config(&tunnel_core::tls::ServerTlsConfig {
                material: tls_cfg.material.clone(),
                request_client_cert: tls_cfg.request_client_cert,
                ca_cert: tls_cfg.ca_cert.clone(),
            })?;
            ListenerTransport::Tls {
                server_config,
                request_client_cert: tls_cfg.request_client_cert,
            }
        }
        None => ListenerTransport::Plain,
    };
    Ok(Listener::bind(addr, transport, idle_timeout, identity_tunnel_key(), role).await?)
}

/// Bind both listeners and return their resolved local addresses without
/// serving yet. Lets tests discover OS-assigned ports before connecting.
pub struct BoundListeners {
    relay: Listener,
    public: Listener,
}

impl BoundListeners {
    pub fn relay_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.relay.local_addr()
    }

    pub fn public_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.public.local_addr()
    }
}

pub async fn bind(config: &RelayConfig) -> anyhow::Result<BoundListeners> {
    let relay = build_listener(config.relay_addr, &config.relay_tls, PipeRole::RelaySide, config.relay_timeout).await?;
    let public = build_listener(config.public_addr, &config.public_tls, PipeRole::PublicSide, config.public_timeout).await?;
    Ok(BoundListeners { relay, public })
}

/// Serve both listeners until `shutdown` resolves, then drain everything:
/// stop accepting, abort in-flight tunnels, and drop every still-pending
/// pipe.
pub async fn serve(
    listeners: BoundListeners,
    relay_secret: Vec<u8>,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let BoundListeners { relay: relay_listener, public: public_listener } = listeners;

    tracing::info!(addr = ?relay_listener.local_addr(), "relay listener bound");
    tracing::info!(addr = ?public_listener.local_addr(), "public listener bound");

    let matcher = Arc::new(Matcher::new());
    let active: Arc<DashMap<u64, tokio::task::AbortHandle>> = Arc::new(DashMap::new());
    let terminating = Arc::new(AtomicBool::new(false));
    let secret = Arc::new(relay_secret);

    let relay_accept = {
        let matcher = Arc::clone(&matcher);
        let active = Arc::clone(&active);
        let terminating = Arc::clone(&terminating);
        let secret = Arc::clone(&secret);
        tokio::spawn(async move {
            loop {
                match relay_listener.accept_one().await {
                    Ok(pipe) => {
                        if terminating.load(Ordering::Relaxed) {
                            continue;
                        }
                        let matcher = Arc::clone(&matcher);
                        let active = Arc::clone(&active);
                        let secret = Arc::clone(&secret);
                        tokio::spawn(async move {
                            let auth_timeout = pipe.idle_timeout;
                            match auth::authorize(pipe, &secret, auth_timeout).await {
                                AuthOutcome::Authorized(pipe) => {
                                    handle_authorized(Side::Relay, pipe, &matcher, &active);
                                }
                                AuthOutcome::Rejected(err) => {
                                    tracing::warn!(error = %err, "agent connection rejected");
                                }
                            }
                        });
                    }
                    Err(err) => tracing::warn!(error = %err, "relay listener accept failed"),
                }
            }
        })
    };

    let public_accept = {
        let matcher = Arc::clone(&matcher);
        let active = Arc::clone(&active);
        let terminating = Arc::clone(&terminating);
        tokio::spawn(async move {
            loop {
                match public_listener.accept_one().await {
                    Ok(mut pipe) => {
                        if terminating.load(Ordering::Relaxed) {
                            continue;
                        }
                        pipe.authorized = true;
                        handle_authorized(Side::Public, pipe, &matcher, &active);
                    }
                    Err(err) => tracing::warn!(error = %err, "public listener accept failed"),
                }
            }
        })
    };

    shutdown.await;
    tracing::info!("shutdown signal received, draining tunnels");
    terminating.store(true, Ordering::Relaxed);
    relay_accept.abort();
    public_accept.abort();
    for entry in active.iter() {
        entry.value().abort();
    }
    drop(matcher.drain_all());

    Ok(())
}

fn handle_authorized(
    side: Side,
    pipe: tunnel_core::pipe::SocketPipe,
    matcher: &Arc<Matcher>,
    active: &Arc<DashMap<u64, tokio::task::AbortHandle>>,
) {
    if let Some((arrived, counterpart)) = matcher.pair_or_enqueue(side, pipe) {
        let arrived_id = arrived.id;
        let counterpart_id = counterpart.id;
        let cleanup_active = Arc::clone(active);
        let handle = tokio::spawn(async move {
            pump::run(arrived, counterpart).await;
            cleanup_active.remove(&arrived_id);
            cleanup_active.remove(&counterpart_id);
        });
        let abort_handle = handle.abort_handle();
        active.insert(arrived_id, abort_handle.clone());
        active.insert(counterpart_id, abort_handle);
    }
}
