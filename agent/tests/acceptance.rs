//! End-to-end acceptance tests for the agent's pool manager against a mock
//! relay (a bare TCP listener standing in for the real relay binary) and a
//! real loopback echo server standing in for the target service.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tunnel_agent::pool::PoolConfig;
use tunnel_core::tls::{build_client_config, build_server_config, peer_common_name, ClientTlsConfig, ServerTlsConfig, TlsMaterialSource};

/// Generates a fresh self-signed cert/key pair for `common_name`, written to
/// a process-unique scratch directory as PEM, the same way `wsh-server`'s
/// dev-cert generator does it.
fn write_self_signed_pem(common_name: &str) -> (PathBuf, PathBuf) {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("tunnel-agent-acceptance-{}-{}", std::process::id(), n));
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

async fn echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
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

#[tokio::test(flavor = "multi_thread")]
async fn pool_refills_after_each_consumption() {
    let target_addr = echo_server().await;
    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_listener.local_addr().unwrap();

    let pool_cfg = Arc::new(PoolConfig {
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
    tokio::spawn(tunnel_agent::pool::run(Arc::clone(&pool_cfg), 3, Arc::clone(&terminating)));

    // The relay mock accepts 3 warm members up front.
    let mut warm = Vec::new();
    for _ in 0..3 {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(2), relay_listener.accept())
            .await
            .expect("pool must open its initial 3 members")
            .unwrap();
        warm.push(stream);
    }

    // Consume one: write a request's first byte, which must trigger a
    // replacement connection at the relay.
    let mut consumed = warm.pop().unwrap();
    consumed.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(2), consumed.read_exact(&mut buf))
        .await
        .expect("echoed bytes must arrive")
        .unwrap();
    assert_eq!(&buf, b"hello");

    let (_replacement, _) = tokio::time::timeout(Duration::from_secs(2), relay_listener.accept())
        .await
        .expect("a replacement pool member must connect after consumption")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn secret_is_written_as_connection_prefix() {
    let target_addr = echo_server().await;
    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_listener.local_addr().unwrap();

    let pool_cfg = Arc::new(PoolConfig {
        relay_host: "127.0.0.1".to_string(),
        relay_addr,
        relay_client_config: None,
        target_host: "127.0.0.1".to_string(),
        target_addr,
        target_client_config: None,
        relay_secret: b"s3cret".to_vec(),
        target_timeout: None,
        relay_timeout: None,
    });
    let terminating = Arc::new(AtomicBool::new(false));
    tokio::spawn(tunnel_agent::pool::run(pool_cfg, 1, terminating));

    let (mut stream, _) = tokio::time::timeout(Duration::from_secs(2), relay_listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut prefix = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut prefix))
        .await
        .expect("secret prefix must be written immediately")
        .unwrap();
    assert_eq!(&prefix, b"s3cret");
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_client_config_presents_a_client_certificate_over_tls() {
    let target_addr = echo_server().await;

    let (relay_server_key, relay_server_cert) = write_self_signed_pem("mock-relay.test");
    let (agent_key, agent_cert) = write_self_signed_pem("agent-pool-1");

    let relay_server_config = build_server_config(&ServerTlsConfig {
        material: TlsMaterialSource::KeyCert { key_path: relay_server_key, cert_path: relay_server_cert },
        request_client_cert: true,
        ca_cert: Some(agent_cert.clone()),
    })
    .unwrap();

    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_listener.local_addr().unwrap();

    let relay_client_config = build_client_config(&ClientTlsConfig {
        verify_cert: false,
        ca_cert: None,
        client_identity: Some((agent_key, agent_cert)),
    })
    .unwrap();

    let pool_cfg = Arc::new(PoolConfig {
        relay_host: "127.0.0.1".to_string(),
        relay_addr,
        relay_client_config: Some(relay_client_config),
        target_host: "127.0.0.1".to_string(),
        target_addr,
        target_client_config: None,
        relay_secret: Vec::new(),
        target_timeout: None,
        relay_timeout: None,
    });
    let terminating = Arc::new(AtomicBool::new(false));
    tokio::spawn(tunnel_agent::pool::run(pool_cfg, 1, terminating));

    let (tcp_stream, _) = tokio::time::timeout(Duration::from_secs(2), relay_listener.accept())
        .await
        .unwrap()
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(relay_server_config);
    let mut tls_stream = tokio::time::timeout(Duration::from_secs(2), acceptor.accept(tcp_stream))
        .await
        .expect("handshake must complete")
        .unwrap();

    let peer_cn = {
        let (_, session) = tls_stream.get_ref();
        let cert = session.peer_certificates().and_then(|certs| certs.first()).unwrap();
        peer_common_name(cert).unwrap()
    };
    assert_eq!(peer_cn, "agent-pool-1");

    tls_stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tls_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}
