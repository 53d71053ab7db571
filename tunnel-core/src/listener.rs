//! Listener adapter: accepts plain or TLS connections on a bind address and
//! hands each one back as a fresh, keep-alive-configured `SocketPipe`.

use crate::error::{CoreError, CoreResult};
use crate::pipe::{Connection, PipeRole, SocketPipe};
use crate::tls::peer_common_name;
use crate::tunnel_key::{TunnelKeyFn, NULL_KEY};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Transport a listener speaks. `request_client_cert` only matters for the
/// `Tls` variant, and mirrors the flag the `ServerConfig` was built with —
/// kept alongside it since the listener needs to know whether to bother
/// extracting a peer certificate at all.
pub enum ListenerTransport {
    Plain,
    Tls {
        server_config: Arc<ServerConfig>,
        request_client_cert: bool,
    },
}

/// A bound listener on one side of the Relay (or, in principle, any other
/// accept-loop owner). One `Listener` exists per configured bind address.
pub struct Listener {
    tcp: TcpListener,
    transport: ListenerTransport,
    idle_timeout: Option<Duration>,
    tunnel_key_fn: TunnelKeyFn,
    role: PipeRole,
}

impl Listener {
    pub async fn bind(
        bind_addr: SocketAddr,
        transport: ListenerTransport,
        idle_timeout: Option<Duration>,
        tunnel_key_fn: TunnelKeyFn,
        role: PipeRole,
    ) -> CoreResult<Self> {
        let tcp = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| CoreError::BindFailure { addr: bind_addr, source })?;
        Ok(Self {
            tcp,
            transport,
            idle_timeout,
            tunnel_key_fn,
            role,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Accept and fully establish exactly one connection, including the TLS
    /// handshake when configured. A `HandshakeFailure` or accept-level I/O
    /// error here is always per-connection: the caller logs it and loops,
    /// the listener itself is never torn down by it.
    pub async fn accept_one(&self) -> CoreResult<SocketPipe> {
        let (stream, peer_addr) = self.tcp.accept().await.map_err(|source| CoreError::Io {
            pipe_id: 0,
            source,
        })?;

        match &self.transport {
            ListenerTransport::Plain => {
                let pipe = SocketPipe::new(self.role, NULL_KEY.to_string(), Connection::Plain(stream))
                    .with_idle_timeout(self.idle_timeout);
                Ok(pipe)
            }
            ListenerTransport::Tls {
                server_config,
                request_client_cert,
            } => {
                let acceptor = TlsAcceptor::from(Arc::clone(server_config));
                let tls_stream = acceptor.accept(stream).await.map_err(|source| CoreError::HandshakeFailure {
                    pipe_id: 0,
                    source,
                })?;

                let tunnel_key = if *request_client_cert {
                    let (_, session) = tls_stream.get_ref();
                    session
                        .peer_certificates()
                        .and_then(|certs| certs.first())
                        .and_then(peer_common_name)
                        .map(|cn| (self.tunnel_key_fn)(&cn))
                        .unwrap_or_else(|| {
                            tracing::warn!(%peer_addr, "TLS peer presented no usable certificate subject, falling back to null tunnel key");
                            NULL_KEY.to_string()
                        })
                } else {
                    NULL_KEY.to_string()
                };

                let pipe = SocketPipe::new(
                    self.role,
                    tunnel_key,
                    Connection::ServerTls(Box::new(tls_stream)),
                )
                .with_idle_timeout(self.idle_timeout);
                Ok(pipe)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{build_client_config, build_server_config, ClientTlsConfig, ServerTlsConfig, TlsMaterialSource};
    use crate::tunnel_key::identity_tunnel_key;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::TcpStream;

    /// Generates a fresh self-signed cert/key pair for `common_name`, written
    /// to a process-unique scratch directory as PEM, the same way
    /// `wsh-server`'s dev-cert generator does it.
    fn write_self_signed_pem(common_name: &str) -> (PathBuf, PathBuf) {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("tunnel-core-listener-test-{}-{}", std::process::id(), n));
        std::fs::create_dir_all(&dir).unwrap();

        let mut params = rcgen::CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let key_path = dir.join("key.pem");
        let cert_path = dir.join("cert.pem");
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        std::fs::write(&cert_path, cert.pem()).unwrap();
        (key_path, cert_path)
    }

    #[tokio::test]
    async fn plain_listener_accepts_and_assigns_null_key() {
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            ListenerTransport::Plain,
            None,
            identity_tunnel_key(),
            PipeRole::PublicSide,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let (accept_res, _connect_res) = tokio::join!(listener.accept_one(), TcpStream::connect(addr));
        let pipe = accept_res.unwrap();
        assert_eq!(pipe.tunnel_key, NULL_KEY);
    }

    #[tokio::test]
    async fn bind_failure_on_unavailable_address_is_reported() {
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            ListenerTransport::Plain,
            None,
            identity_tunnel_key(),
            PipeRole::PublicSide,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let result = Listener::bind(
            addr,
            ListenerTransport::Plain,
            None,
            identity_tunnel_key(),
            PipeRole::PublicSide,
        )
        .await;
        assert!(matches!(result, Err(CoreError::BindFailure { .. })));
    }

    #[tokio::test]
    async fn tls_listener_derives_tunnel_key_from_peer_common_name() {
        let (server_key, server_cert) = write_self_signed_pem("relay.test");
        let (client_key, client_cert) = write_self_signed_pem("agent-7");

        let server_config = build_server_config(&ServerTlsConfig {
            material: TlsMaterialSource::KeyCert { key_path: server_key, cert_path: server_cert },
            request_client_cert: true,
            ca_cert: Some(client_cert.clone()),
        })
        .unwrap();

        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            ListenerTransport::Tls { server_config, request_client_cert: true },
            None,
            identity_tunnel_key(),
            PipeRole::RelaySide,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let client_config = build_client_config(&ClientTlsConfig {
            verify_cert: false,
            ca_cert: None,
            client_identity: Some((client_key, client_cert)),
        })
        .unwrap();

        let connect = async {
            let stream = TcpStream::connect(addr).await.unwrap();
            let domain = rustls::pki_types::ServerName::try_from("localhost").unwrap();
            tokio_rustls::TlsConnector::from(client_config).connect(domain, stream).await.unwrap()
        };

        let (accept_res, _client_stream) = tokio::join!(listener.accept_one(), connect);
        let pipe = accept_res.unwrap();
        assert_eq!(pipe.tunnel_key, "agent-7");
    }
}
