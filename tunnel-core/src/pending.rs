use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// An ordered sequence of owned byte chunks received before a pipe was paired
/// (or, for the relay listener, before it was authorized).
///
/// Appends are O(1). The secret-stripping step in the authenticator only ever
/// inspects the first chunk, so chunks are never coalesced eagerly. Draining
/// happens exactly once, immediately on pairing, and leaves the buffer empty.
#[derive(Debug, Default)]
pub struct PendingBytes {
    chunks: Vec<Bytes>,
}

impl PendingBytes {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The first buffered chunk, if any. Used by the authenticator, which
    /// only ever checks the secret prefix against this one chunk.
    pub fn first_chunk(&self) -> Option<&Bytes> {
        self.chunks.first()
    }

    /// Replace the first chunk (used after the authenticator strips a
    /// matched secret prefix off its head).
    pub fn set_first_chunk(&mut self, chunk: Bytes) {
        if self.chunks.is_empty() {
            self.push(chunk);
        } else if chunk.is_empty() {
            self.chunks.remove(0);
        } else {
            self.chunks[0] = chunk;
        }
    }

    /// Write every buffered chunk, in order, to `dst`, then clear the buffer.
    /// Drains exactly once; calling this on an already-empty buffer is a
    /// no-op.
    pub async fn drain_into<W: AsyncWrite + Unpin>(&mut self, dst: &mut W) -> std::io::Result<()> {
        for chunk in self.chunks.drain(..) {
            dst.write_all(&chunk).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn concat(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.to_vec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_skips_empty_chunks() {
        let mut pb = PendingBytes::new();
        pb.push(Bytes::new());
        assert!(pb.is_empty());
    }

    #[test]
    fn first_chunk_reflects_insertion_order() {
        let mut pb = PendingBytes::new();
        pb.push(Bytes::from_static(b"abc"));
        pb.push(Bytes::from_static(b"def"));
        assert_eq!(pb.first_chunk().unwrap().as_ref(), b"abc");
    }

    #[test]
    fn set_first_chunk_strips_matched_prefix() {
        let mut pb = PendingBytes::new();
        pb.push(Bytes::from_static(b"s3cretHELLO"));
        pb.set_first_chunk(Bytes::from_static(b"HELLO"));
        assert_eq!(pb.concat(), b"HELLO");
    }

    #[tokio::test]
    async fn drain_into_writes_in_order_then_empties() {
        let mut pb = PendingBytes::new();
        pb.push(Bytes::from_static(b"abc"));
        pb.push(Bytes::from_static(b"def"));
        let mut out = Vec::new();
        pb.drain_into(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
        assert!(pb.is_empty());

        // Draining again is a no-op: pending bytes are delivered exactly once.
        let mut out2 = Vec::new();
        pb.drain_into(&mut out2).await.unwrap();
        assert!(out2.is_empty());
    }
}
