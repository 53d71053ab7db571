//! Agent pool manager: keeps N warm outbound relay connections, and runs the
//! "wait for first byte → open target → replay buffer → pump" dance on each.

use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tunnel_core::pipe::{Connection, PipeRole, SocketPipe};
use tunnel_core::pump;
use tunnel_core::tunnel_key::NULL_KEY;

const REPLACEMENT_BACKOFF: Duration = Duration::from_secs(5);

/// Static, resolved dial targets for one agent process. Built once at
/// startup from `AgentConfig` and shared read-only by every pool member task.
pub struct PoolConfig {
    pub relay_host: String,
    pub relay_addr: std::net::SocketAddr,
    pub relay_client_config: Option<Arc<rustls::ClientConfig>>,
    pub target_host: String,
    pub target_addr: std::net::SocketAddr,
    pub target_client_config: Option<Arc<rustls::ClientConfig>>,
    pub relay_secret: Vec<u8>,
    pub target_timeout: Option<Duration>,
    pub relay_timeout: Option<Duration>,
}

async fn dial(
    addr: std::net::SocketAddr,
    host: &str,
    tls: Option<&Arc<rustls::ClientConfig>>,
) -> tunnel_core::CoreResult<Connection> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| tunnel_core::CoreError::PeerUnreachable { addr: addr.to_string(), source })?;

    match tls {
        Some(client_config) => {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| tunnel_core::CoreError::TlsMaterialFailure(format!("{host} is not a valid TLS server name")))?;
            let connector = TlsConnector::from(Arc::clone(client_config));
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|source| tunnel_core::CoreError::HandshakeFailure { pipe_id: 0, source })?;
            Ok(Connection::ClientTls(Box::new(tls_stream)))
        }
        None => Ok(Connection::Plain(stream)),
    }
}

/// Run the pool at a fixed size of `count` members until `terminating` is set.
pub async fn run(cfg: Arc<PoolConfig>, count: u32, terminating: Arc<AtomicBool>) {
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        members.push(tokio::spawn(run_member(Arc::clone(&cfg), Arc::clone(&terminating))));
    }
    for member in members {
        let _ = member.await;
    }
}

async fn run_member(cfg: Arc<PoolConfig>, terminating: Arc<AtomicBool>) {
    loop {
        if terminating.load(Ordering::Relaxed) {
            return;
        }

        let mut relay_pipe = match dial(cfg.relay_addr, &cfg.relay_host, cfg.relay_client_config.as_ref()).await {
            Ok(connection) => SocketPipe::new(PipeRole::RelaySide, NULL_KEY.to_string(), connection)
                .with_idle_timeout(cfg.relay_timeout),
            Err(err) => {
                tracing::warn!(error = %err, "failed to dial relay, retrying after backoff");
                tokio::time::sleep(REPLACEMENT_BACKOFF).await;
                continue;
            }
        };

        if !cfg.relay_secret.is_empty() {
            use tokio::io::AsyncWriteExt;
            if let Err(err) = relay_pipe.connection.write_all(&cfg.relay_secret).await {
                tracing::warn!(error = %err, "failed to write shared secret to relay, retrying after backoff");
                tokio::time::sleep(REPLACEMENT_BACKOFF).await;
                continue;
            }
        }

        tracing::info!(pipe_id = relay_pipe.id, "pool member connected, waiting to be consumed");

        let mut buf = vec![0u8; 16 * 1024];
        let n = match relay_pipe.connection.read(&mut buf).await {
            Ok(0) => {
                tracing::info!(pipe_id = relay_pipe.id, "relay closed idle pool member, retrying after backoff");
                tokio::time::sleep(REPLACEMENT_BACKOFF).await;
                continue;
            }
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(pipe_id = relay_pipe.id, error = %err, "pool member errored while idle, retrying after backoff");
                tokio::time::sleep(REPLACEMENT_BACKOFF).await;
                continue;
            }
        };
        buf.truncate(n);
        relay_pipe.pending.push(Bytes::from(buf));

        if !terminating.load(Ordering::Relaxed) {
            tokio::spawn(run_member(Arc::clone(&cfg), Arc::clone(&terminating)));
        }

        match dial(cfg.target_addr, &cfg.target_host, cfg.target_client_config.as_ref()).await {
            Ok(connection) => {
                let target_pipe = SocketPipe::new(PipeRole::TargetSide, NULL_KEY.to_string(), connection)
                    .with_idle_timeout(cfg.target_timeout);
                tracing::info!(pipe_id = relay_pipe.id, target_pipe_id = target_pipe.id, "pairing pool member with target");
                pump::run(relay_pipe, target_pipe).await;
            }
            Err(err) => {
                tracing::warn!(pipe_id = relay_pipe.id, error = %err, "failed to reach target after consumption");
            }
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn pool_member_replays_first_byte_then_pumps() {
        let target_addr = echo_server().await;

        let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay_listener.local_addr().unwrap();

        let cfg = Arc::new(PoolConfig {
            relay_host: "127.0.0.1".to_string(),
            relay_addr,
            relay_client_config: None,
            target_host: "127.0.0.1".to_string(),
            target_addr,
            target_client_config: None,
            relay_secret: Vec::new(),
            target_timeout: None,
            relay_timeout: None,
        });
        let terminating = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_member(cfg, terminating));

        let (mut relay_side, _) = relay_listener.accept().await.unwrap();
        relay_side.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        relay_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
