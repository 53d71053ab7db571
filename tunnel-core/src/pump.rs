//! Bidirectional byte pump: the component that keeps a paired tunnel alive.

use crate::pipe::SocketPipe;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Drain `left`'s and `right`'s pending bytes onto each other, then copy
/// bytes bidirectionally until either side hits EOF or an I/O error.
///
/// Consumes both pipes: once paired, a tunnel is represented solely by this
/// task's ownership of the two underlying connections, not by any mutable
/// field on either `SocketPipe` (see the design note on back-references).
pub async fn run(mut left: SocketPipe, mut right: SocketPipe) {
    let left_id = left.id;
    let right_id = right.id;
    let tunnel_key = left.tunnel_key.clone();
    let left_idle = left.idle_timeout;
    let right_idle = right.idle_timeout;

    if let Err(err) = left.pending.drain_into(&mut right.connection).await {
        tracing::warn!(pipe_id = right_id, %tunnel_key, error = %err, "failed to replay pending bytes before pump start");
        return;
    }
    if let Err(err) = right.pending.drain_into(&mut left.connection).await {
        tracing::warn!(pipe_id = left_id, %tunnel_key, error = %err, "failed to replay pending bytes before pump start");
        return;
    }

    let (mut left_rd, mut left_wr) = split(left.connection);
    let (mut right_rd, mut right_wr) = split(right.connection);

    let left_to_right = copy_with_idle_timeout(&mut left_rd, &mut right_wr, left_idle);
    let right_to_left = copy_with_idle_timeout(&mut right_rd, &mut left_wr, right_idle);

    tokio::select! {
        result = left_to_right => {
            log_half_close(left_id, right_id, left.role.as_str(), &tunnel_key, result);
        }
        result = right_to_left => {
            log_half_close(right_id, left_id, right.role.as_str(), &tunnel_key, result);
        }
    }

    let _ = left_wr.shutdown().await;
    let _ = right_wr.shutdown().await;

    tracing::info!(pipe_id = left_id, other_pipe_id = right_id, %tunnel_key, "tunnel closed");
}

enum HalfResult {
    Eof(u64),
    IdleTimedOut,
    Err(std::io::Error),
}

/// Copy bytes from `src` to `dst` until EOF or error. When `idle` is set, the
/// deadline resets on every successful read — a timeout here is
/// indistinguishable from a peer-initiated close to the counterpart.
async fn copy_with_idle_timeout<R, W>(src: &mut R, dst: &mut W, idle: Option<Duration>) -> HalfResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total: u64 = 0;
    loop {
        let read = match idle {
            Some(dur) => match tokio::time::timeout(dur, src.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return HalfResult::IdleTimedOut,
            },
            None => src.read(&mut buf).await,
        };
        let n = match read {
            Ok(0) => return HalfResult::Eof(total),
            Ok(n) => n,
            Err(err) => return HalfResult::Err(err),
        };
        if let Err(err) = dst.write_all(&buf[..n]).await {
            return HalfResult::Err(err);
        }
        total += n as u64;
    }
}

fn log_half_close(closed_pipe_id: u64, other_pipe_id: u64, role: &str, tunnel_key: &str, result: HalfResult) {
    match result {
        HalfResult::Eof(bytes) => tracing::debug!(
            pipe_id = closed_pipe_id,
            other_pipe_id,
            role,
            %tunnel_key,
            bytes,
            "side closed, tearing down tunnel"
        ),
        HalfResult::IdleTimedOut => tracing::info!(
            pipe_id = closed_pipe_id,
            other_pipe_id,
            role,
            %tunnel_key,
            "side idle-timed-out, tearing down tunnel"
        ),
        HalfResult::Err(err) => tracing::warn!(
            pipe_id = closed_pipe_id,
            other_pipe_id,
            role,
            %tunnel_key,
            error = %err,
            "side errored, tearing down tunnel"
        ),
    }
}
