//! Buffered transport IO for the HTTP/1 engine.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::common::io::BoxedIo;
use crate::error::{Error, Result, TimeoutKind};

/// A status line or header block past this size is a protocol error.
pub(crate) const MAX_HEAD_SIZE: usize = 256 * 1024;

const INIT_BUFFER_SIZE: usize = 8 * 1024;

/// The transport plus read/write buffers for one HTTP/1 connection.
pub(crate) struct Buffered {
    io: BoxedIo,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration,
    /// EOF was observed; nothing more will arrive.
    eof: bool,
}

impl Buffered {
    pub(crate) fn new(io: BoxedIo, read_timeout: Duration, write_timeout: Duration) -> Buffered {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            read_timeout,
            write_timeout,
            eof: false,
        }
    }

    pub(crate) fn read_buf(&self) -> &BytesMut {
        &self.read_buf
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether unconsumed bytes are already buffered.
    pub(crate) fn has_buffered_input(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// Reads more bytes into the buffer. Returns the count, 0 at EOF.
    pub(crate) async fn fill(&mut self) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let read = tokio::time::timeout(self.read_timeout, self.io.read_buf(&mut self.read_buf))
            .await
            .map_err(|_| Error::new_timeout(TimeoutKind::Read))?
            .map_err(Error::new_io)?;
        trace!("read {} bytes", read);
        if read == 0 {
            self.eof = true;
        }
        Ok(read)
    }

    /// Takes up to `max` buffered bytes, filling first if empty.
    pub(crate) async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        if self.read_buf.is_empty() {
            self.fill().await?;
        }
        let n = self.read_buf.len().min(max);
        Ok(self.read_buf.split_to(n).freeze())
    }

    pub(crate) fn buffer(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Flushes everything buffered for write.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        while self.write_buf.has_remaining() {
            let fut = self.io.write_buf(&mut self.write_buf);
            let wrote = tokio::time::timeout(self.write_timeout, fut)
                .await
                .map_err(|_| Error::new_timeout(TimeoutKind::Write))?
                .map_err(Error::new_io)?;
            if wrote == 0 {
                return Err(Error::new_io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "transport refused bytes",
                )));
            }
        }
        tokio::time::timeout(self.write_timeout, self.io.flush())
            .await
            .map_err(|_| Error::new_timeout(TimeoutKind::Write))?
            .map_err(Error::new_io)?;
        Ok(())
    }

    /// Hands the raw transport and buffered leftovers to an upgrade.
    pub(crate) fn into_parts(self) -> (BoxedIo, Bytes) {
        (self.io, self.read_buf.freeze())
    }
}

impl std::fmt::Debug for Buffered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffered")
            .field("read_buf", &self.read_buf.len())
            .field("write_buf", &self.write_buf.len())
            .field("eof", &self.eof)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffered(mock: tokio_test::io::Mock) -> Buffered {
        Buffered::new(
            BoxedIo::new(mock),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn fill_reads_and_flags_eof() {
        let mock = tokio_test::io::Builder::new().read(b"hello").build();
        let mut io = buffered(mock);

        assert_eq!(io.fill().await.unwrap(), 5);
        assert_eq!(&io.read_buf()[..], b"hello");
        assert!(!io.is_eof());

        assert_eq!(io.fill().await.unwrap(), 0);
        assert!(io.is_eof());
        // Buffered bytes survive EOF discovery.
        assert!(io.has_buffered_input());
    }

    #[tokio::test]
    async fn flush_writes_everything_buffered() {
        let mock = tokio_test::io::Builder::new().write(b"GET / HTTP/1.1\r\n\r\n").build();
        let mut io = buffered(mock);
        io.buffer(b"GET / HTTP/1.1\r\n\r\n");
        io.flush().await.unwrap();
    }
}
