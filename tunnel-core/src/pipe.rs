//! `SocketPipe`: one half of a potential tunnel, and the byte-oriented
//! connection abstraction (plain TCP or TLS) it wraps.

use crate::pending::PendingBytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next monotonically increasing pipe id. Shared across both
/// listeners on the Relay and the pool on the Agent — ids are unique
/// process-wide, not just per-listener.
pub fn next_pipe_id() -> u64 {
    NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which side of which process a pipe represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    /// Relay's agent-facing listener.
    RelaySide,
    /// Relay's public listener.
    PublicSide,
    /// Agent's connection to the target service.
    TargetSide,
}

impl PipeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipeRole::RelaySide => "relay-side",
            PipeRole::PublicSide => "public-side",
            PipeRole::TargetSide => "target-side",
        }
    }
}

impl std::fmt::Display for PipeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The underlying byte stream behind a pipe: either a bare TCP socket or one
/// wrapped in a completed TLS session. Both directions implement
/// `AsyncRead`/`AsyncWrite`, so `Pump` never needs to know which.
pub enum Connection {
    Plain(TcpStream),
    ServerTls(Box<ServerTlsStream<TcpStream>>),
    ClientTls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Connection::ServerTls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
            Connection::ClientTls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Connection::ServerTls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
            Connection::ClientTls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            Connection::ServerTls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
            Connection::ClientTls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Connection::ServerTls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
            Connection::ClientTls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection {
    pub fn configure_keepalive(&self) {
        let stream = match self {
            Connection::Plain(s) => s,
            Connection::ServerTls(s) => s.get_ref().0,
            Connection::ClientTls(s) => s.get_ref().0,
        };
        crate::keepalive::configure_keepalive(stream);
    }
}

/// One half of a potential tunnel: an accepted or dialed connection, not yet
/// (or no longer) paired with its counterpart.
///
/// `SocketPipe` only carries the bookkeeping described in the data model; the
/// live connection itself is handed by value into a `Pump` once pairing
/// happens, which is why there is no mutable "paired socket" field here (see
/// the design note on event-emitter classes in the accompanying design
/// record).
pub struct SocketPipe {
    pub id: u64,
    pub role: PipeRole,
    pub authorized: bool,
    pub tunnel_key: String,
    pub pending: PendingBytes,
    pub connection: Connection,
    /// Torn down if no byte is read within this window once pumping starts.
    /// `None` disables idle detection for this pipe.
    pub idle_timeout: Option<std::time::Duration>,
}

impl SocketPipe {
    pub fn new(role: PipeRole, tunnel_key: String, connection: Connection) -> Self {
        connection.configure_keepalive();
        Self {
            id: next_pipe_id(),
            role,
            authorized: false,
            tunnel_key,
            pending: PendingBytes::new(),
            connection,
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<std::time::Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = next_pipe_id();
        let b = next_pipe_id();
        assert!(b > a);
    }

    #[test]
    fn role_display_matches_spec_wording() {
        assert_eq!(PipeRole::RelaySide.to_string(), "relay-side");
        assert_eq!(PipeRole::PublicSide.to_string(), "public-side");
        assert_eq!(PipeRole::TargetSide.to_string(), "target-side");
    }
}
