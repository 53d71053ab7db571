use std::net::SocketAddr;

/// Every fallible operation the pairing and forwarding engine performs.
///
/// `BindFailure` and `TlsMaterialFailure` are process-fatal at startup; every
/// other variant is contained at the pipe (or pipe pair) it affects and is
/// never allowed to unwind past the task that owns that pipe.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("failed to bind listener on {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load TLS material: {0}")]
    TlsMaterialFailure(String),

    #[error("TLS handshake failed for pipe {pipe_id}: {source}")]
    HandshakeFailure {
        pipe_id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("pipe {pipe_id} sent a shared-secret prefix that did not match")]
    AuthMismatch { pipe_id: u64 },

    #[error("pipe {pipe_id} did not authorize within the configured timeout")]
    AuthTimeout { pipe_id: u64 },

    #[error("I/O error on pipe {pipe_id}: {source}")]
    Io {
        pipe_id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("could not reach {addr}: {source}")]
    PeerUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;
