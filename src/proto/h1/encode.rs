//! Request body encoders: fixed length and chunked.

use bytes::BytesMut;

use crate::error::{Error, Result};

/// Frames outgoing body bytes into the write buffer.
#[derive(Debug)]
pub(super) struct Encoder {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// Identity framing with a known remaining length.
    Length(u64),
    Chunked,
}

impl Encoder {
    pub(super) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(super) fn chunked() -> Encoder {
        Encoder { kind: Kind::Chunked }
    }

    pub(super) fn encode(&mut self, chunk: &[u8], dst: &mut BytesMut) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if (chunk.len() as u64) > *remaining {
                    // Writing more than Content-Length promised corrupts
                    // the connection's framing.
                    return Err(Error::new_content_length());
                }
                *remaining -= chunk.len() as u64;
                dst.extend_from_slice(chunk);
                Ok(())
            }
            Kind::Chunked => {
                let mut size = [0u8; 16];
                let size = write_hex(chunk.len(), &mut size);
                dst.extend_from_slice(size);
                dst.extend_from_slice(b"\r\n");
                dst.extend_from_slice(chunk);
                dst.extend_from_slice(b"\r\n");
                Ok(())
            }
        }
    }

    /// Terminates the body. Short Content-Length bodies are an error.
    pub(super) fn finish(&mut self, dst: &mut BytesMut) -> Result<()> {
        match self.kind {
            Kind::Length(remaining) => {
                if remaining != 0 {
                    return Err(Error::new_content_length());
                }
                Ok(())
            }
            Kind::Chunked => {
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}

/// Formats a chunk size as lowercase hex into the scratch buffer.
fn write_hex(mut value: usize, scratch: &mut [u8; 16]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut at = scratch.len();
    loop {
        at -= 1;
        scratch[at] = DIGITS[value & 0xf];
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    &scratch[at..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_framing() {
        let mut enc = Encoder::chunked();
        let mut dst = BytesMut::new();
        enc.encode(b"hello, chunked world", &mut dst).unwrap();
        enc.finish(&mut dst).unwrap();
        assert_eq!(&dst[..], &b"14\r\nhello, chunked world\r\n0\r\n\r\n"[..]);
    }

    #[test]
    fn length_framing_checks_overrun() {
        let mut enc = Encoder::length(4);
        let mut dst = BytesMut::new();
        enc.encode(b"okay", &mut dst).unwrap();
        assert!(enc.encode(b"more", &mut dst).is_err());
        assert_eq!(&dst[..], b"okay");
        assert!(enc.finish(&mut dst).is_ok());
    }

    #[test]
    fn short_length_body_is_an_error() {
        let mut enc = Encoder::length(10);
        let mut dst = BytesMut::new();
        enc.encode(b"five!", &mut dst).unwrap();
        assert!(enc.finish(&mut dst).is_err());
    }
}
