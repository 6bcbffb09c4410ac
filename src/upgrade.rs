//! Raw-stream handoff after a 101 Switching Protocols response.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::io::BoxedIo;

/// The bidirectional byte stream of an upgraded connection.
///
/// Bytes the HTTP parser over-read before the switch are replayed first;
/// after that, reads and writes go straight to the transport. No HTTP
/// framing happens on this connection again.
pub struct Upgraded {
    io: BoxedIo,
    leftover: Bytes,
}

impl Upgraded {
    pub(crate) fn new(io: BoxedIo, leftover: Bytes) -> Upgraded {
        Upgraded { io, leftover }
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            buf.put_slice(&self.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded")
            .field("leftover", &self.leftover.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn leftover_bytes_replay_first() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut upgraded = Upgraded::new(BoxedIo::new(client), Bytes::from_static(b"early-"));

        tokio::spawn(async move {
            server.write_all(b"late").await.unwrap();
        });

        let mut out = vec![0u8; 10];
        upgraded.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"early-late");
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut upgraded = Upgraded::new(BoxedIo::new(client), Bytes::new());

        upgraded.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
