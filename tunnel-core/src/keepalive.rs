use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;

/// Interval, in seconds, between TCP keep-alive probes. Configured on every
/// socket the core touches — both halves of a pump and every agent pool
/// member — so a silently-dead peer is detected instead of held forever.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Enable TCP keep-alive with the fixed 120s probe interval on `stream`.
///
/// Best-effort: a platform that rejects the socket option is logged and
/// otherwise ignored, since keep-alive is a liveness aid, not a correctness
/// requirement.
pub fn configure_keepalive(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_INTERVAL)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        tracing::warn!(error = %err, "failed to configure TCP keep-alive");
    }
}
