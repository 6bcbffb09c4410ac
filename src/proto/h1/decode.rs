//! Response body decoders: fixed length, chunked, and read-to-EOF.

use bytes::{Buf, Bytes};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::trace;

use crate::error::{Error, Result};

use super::io::Buffered;

/// Largest chunk-size line we accept before calling it a parse error.
const MAX_CHUNK_SIZE_LINE: usize = 256;

/// Decodes one response body off the buffered transport.
#[derive(Debug)]
pub(super) struct Decoder {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// Exactly this many bytes remain.
    Length(u64),
    /// Chunked transfer coding, with captured trailers.
    Chunked {
        state: ChunkedState,
        remaining: u64,
        trailers: Option<HeaderMap>,
    },
    /// No length information: the body runs to connection close.
    Eof(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    Body,
    BodyCr,
    Trailers,
    End,
}

impl Decoder {
    pub(super) fn length(len: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(len),
        }
    }

    pub(super) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Size,
                remaining: 0,
                trailers: None,
            },
        }
    }

    pub(super) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    pub(super) fn is_eof(&self) -> bool {
        match self.kind {
            Kind::Length(0) => true,
            Kind::Chunked { state, .. } => state == ChunkedState::End,
            Kind::Eof(done) => done,
            _ => false,
        }
    }

    /// Whether the connection can be reused once this body is done.
    pub(super) fn allows_reuse(&self) -> bool {
        !matches!(self.kind, Kind::Eof(_))
    }

    pub(super) fn take_trailers(&mut self) -> Option<HeaderMap> {
        match self.kind {
            Kind::Chunked { ref mut trailers, .. } => trailers.take(),
            _ => None,
        }
    }

    /// The next chunk of body bytes; empty means the body is complete.
    pub(super) async fn decode(&mut self, io: &mut Buffered) -> Result<Bytes> {
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Bytes::new());
                }
                let max = (*remaining).min(usize::MAX as u64) as usize;
                let chunk = io.read_chunk(max).await?;
                if chunk.is_empty() {
                    // EOF before Content-Length was satisfied.
                    return Err(Error::new_connection_closed());
                }
                *remaining -= chunk.len() as u64;
                Ok(chunk)
            }
            Kind::Chunked {
                ref mut state,
                ref mut remaining,
                ref mut trailers,
            } => loop {
                if *state == ChunkedState::End {
                    return Ok(Bytes::new());
                }
                if *state == ChunkedState::Body {
                    let max = (*remaining).min(usize::MAX as u64) as usize;
                    let chunk = io.read_chunk(max).await?;
                    if chunk.is_empty() {
                        return Err(Error::new_connection_closed());
                    }
                    *remaining -= chunk.len() as u64;
                    if *remaining == 0 {
                        *state = ChunkedState::BodyCr;
                    }
                    return Ok(chunk);
                }
                step_chunked(state, remaining, trailers, io).await?;
            },
            Kind::Eof(ref mut done) => {
                if *done {
                    return Ok(Bytes::new());
                }
                let chunk = io.read_chunk(usize::MAX).await?;
                if chunk.is_empty() {
                    *done = true;
                }
                Ok(chunk)
            }
        }
    }
}

/// Advances the chunked state machine through one framing token.
async fn step_chunked(
    state: &mut ChunkedState,
    remaining: &mut u64,
    trailers: &mut Option<HeaderMap>,
    io: &mut Buffered,
) -> Result<()> {
    match *state {
        ChunkedState::Size => {
            let line = read_line(io, MAX_CHUNK_SIZE_LINE).await?;
            let size_part = line
                .split(|b| *b == b';')
                .next()
                .unwrap_or(&[]);
            let text = std::str::from_utf8(size_part)
                .map_err(|_| Error::new_header())?
                .trim();
            let size = u64::from_str_radix(text, 16).map_err(|_| Error::new_header())?;
            trace!("chunk size: {}", size);
            *remaining = size;
            *state = if size == 0 {
                ChunkedState::Trailers
            } else {
                ChunkedState::Body
            };
            Ok(())
        }
        ChunkedState::BodyCr => {
            // The CRLF that terminates a chunk's data.
            let line = read_line(io, 2).await?;
            if !line.is_empty() {
                return Err(Error::new_header());
            }
            *state = ChunkedState::Size;
            Ok(())
        }
        ChunkedState::Trailers => {
            loop {
                let line = read_line(io, super::io::MAX_HEAD_SIZE).await?;
                if line.is_empty() {
                    break;
                }
                let map = trailers.get_or_insert_with(HeaderMap::new);
                if let Some(at) = line.iter().position(|b| *b == b':') {
                    let name = &line[..at];
                    let mut value = &line[at + 1..];
                    while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
                        value = &value[1..];
                    }
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name),
                        HeaderValue::from_bytes(value),
                    ) {
                        map.append(name, value);
                    }
                }
            }
            *state = ChunkedState::End;
            Ok(())
        }
        ChunkedState::Body | ChunkedState::End => {
            unreachable!("chunked state handled by caller: {:?}", state)
        }
    }
}

/// Reads one CRLF-terminated line, returning it without the terminator.
async fn read_line(io: &mut Buffered, max: usize) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        {
            let buf = io.read_buf_mut();
            while buf.has_remaining() {
                let byte = buf.get_u8();
                if byte == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(line);
                }
                line.push(byte);
                if line.len() > max {
                    return Err(Error::new_too_large());
                }
            }
        }
        if io.fill().await? == 0 {
            return Err(Error::new_connection_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::io::BoxedIo;
    use std::time::Duration;

    async fn buffered_from(bytes: &'static [u8]) -> Buffered {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(bytes).await.unwrap();
        });
        Buffered::new(
            BoxedIo::new(client),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    async fn drain(decoder: &mut Decoder, io: &mut Buffered) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = decoder.decode(io).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn fixed_length_body() {
        let mut io = buffered_from(b"hello world...ignored").await;
        let mut decoder = Decoder::length(11);
        let body = drain(&mut decoder, &mut io).await;
        assert_eq!(body, b"hello world");
        assert!(decoder.is_eof());
        assert!(decoder.allows_reuse());
    }

    #[tokio::test]
    async fn chunked_body_with_trailers() {
        let mut io =
            buffered_from(b"4\r\nwiki\r\n5\r\npedia\r\n0\r\nx-checksum: abc\r\n\r\n").await;
        let mut decoder = Decoder::chunked();
        let body = drain(&mut decoder, &mut io).await;
        assert_eq!(body, b"wikipedia");
        assert!(decoder.is_eof());

        let trailers = decoder.take_trailers().unwrap();
        assert_eq!(trailers.get("x-checksum").unwrap(), "abc");
    }

    #[tokio::test]
    async fn chunk_extensions_are_ignored() {
        let mut io = buffered_from(b"3;name=val\r\nabc\r\n0\r\n\r\n").await;
        let mut decoder = Decoder::chunked();
        let body = drain(&mut decoder, &mut io).await;
        assert_eq!(body, b"abc");
    }

    #[tokio::test]
    async fn eof_body_reads_to_close() {
        let mut io = buffered_from(b"all of it").await;
        let mut decoder = Decoder::eof();
        let body = drain(&mut decoder, &mut io).await;
        assert_eq!(body, b"all of it");
        assert!(decoder.is_eof());
        assert!(!decoder.allows_reuse());
    }

    #[tokio::test]
    async fn truncated_length_body_errors() {
        let mut io = buffered_from(b"short").await;
        let mut decoder = Decoder::length(100);
        let first = decoder.decode(&mut io).await.unwrap();
        assert_eq!(&first[..], b"short");
        let err = decoder.decode(&mut io).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn bad_chunk_size_is_a_header_error() {
        let mut io = buffered_from(b"zz\r\nabc\r\n0\r\n\r\n").await;
        let mut decoder = Decoder::chunked();
        let err = decoder.decode(&mut io).await.unwrap_err();
        assert!(err.is_protocol());
    }
}
