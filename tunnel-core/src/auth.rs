//! Authenticator: gates a newly accepted relay-side pipe on a shared-secret
//! prefix before it is handed to the Matcher.

use crate::error::{CoreError, CoreResult};
use crate::pipe::SocketPipe;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Outcome of authorizing a single pipe.
pub enum AuthOutcome {
    Authorized(SocketPipe),
    Rejected(CoreError),
}

/// Authorize `pipe` against `secret`. An empty secret authorizes immediately
/// without consuming any bytes. Otherwise bytes are read from the
/// connection into the pipe's pending-bytes buffer until the first chunk is
/// at least as long as the secret; only the first chunk is ever inspected
/// (chunks are not concatenated across reads to re-check a short prefix).
pub async fn authorize(mut pipe: SocketPipe, secret: &[u8], timeout: Option<Duration>) -> AuthOutcome {
    if secret.is_empty() {
        pipe.authorized = true;
        return AuthOutcome::Authorized(pipe);
    }

    let attempt = async {
        loop {
            let mut buf = vec![0u8; 4096];
            let n = match pipe.connection.read(&mut buf).await {
                Ok(0) => {
                    return Err(CoreError::Io {
                        pipe_id: pipe.id,
                        source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed before authorizing"),
                    })
                }
                Ok(n) => n,
                Err(source) => return Err(CoreError::Io { pipe_id: pipe.id, source }),
            };
            buf.truncate(n);
            pipe.pending.push(Bytes::from(buf));

            let Some(first) = pipe.pending.first_chunk() else {
                continue;
            };
            if first.len() < secret.len() {
                continue;
            }
            if &first[..secret.len()] != secret {
                return Err(CoreError::AuthMismatch { pipe_id: pipe.id });
            }
            let remainder = first.slice(secret.len()..);
            pipe.pending.set_first_chunk(remainder);
            return Ok(());
        }
    };

    let result = match timeout {
        Some(dur) => match tokio::time::timeout(dur, attempt).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::AuthTimeout { pipe_id: pipe.id }),
        },
        None => attempt.await,
    };

    match result {
        Ok(()) => {
            pipe.authorized = true;
            AuthOutcome::Authorized(pipe)
        }
        Err(err) => AuthOutcome::Rejected(err),
    }
}
