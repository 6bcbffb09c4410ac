//! Transparent gzip inflation for response bodies.
//!
//! The bridge strips `Content-Encoding: gzip` and routes the body through
//! this streaming decoder. The gzip wrapper (header, CRC32/ISIZE trailer)
//! is handled here; the deflate stream itself goes through flate2.

use bytes::Bytes;
use flate2::{Decompress, FlushDecompress, Status};

use crate::error::{Error, Result};

const OUT_CHUNK: usize = 16 * 1024;

/// Incremental gzip stream decoder.
pub(crate) struct GzipDecoder {
    state: State,
    inflate: Decompress,
    /// Compressed bytes not yet consumed.
    pending: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Header,
    Deflate,
    /// Counts down the 8 trailer bytes (CRC32 + ISIZE), then ends.
    Trailer(usize),
    Done,
}

impl GzipDecoder {
    pub(crate) fn new() -> GzipDecoder {
        GzipDecoder {
            state: State::Header,
            inflate: Decompress::new(false),
            pending: Vec::new(),
        }
    }

    /// Feeds compressed bytes, returning any plaintext produced.
    pub(crate) fn decode(&mut self, input: &[u8]) -> Result<Vec<Bytes>> {
        self.pending.extend_from_slice(input);
        let mut out = Vec::new();

        loop {
            match self.state {
                State::Header => {
                    match strip_gzip_header(&self.pending)? {
                        Some(consumed) => {
                            self.pending.drain(..consumed);
                            self.state = State::Deflate;
                        }
                        None => return Ok(out),
                    }
                }
                State::Deflate => {
                    if self.pending.is_empty() {
                        return Ok(out);
                    }
                    let mut buf = vec![0u8; OUT_CHUNK];
                    let before_in = self.inflate.total_in();
                    let before_out = self.inflate.total_out();
                    let status = self
                        .inflate
                        .decompress(&self.pending, &mut buf, FlushDecompress::None)
                        .map_err(|e| Error::new_header().with(e))?;
                    let consumed = (self.inflate.total_in() - before_in) as usize;
                    let produced = (self.inflate.total_out() - before_out) as usize;
                    self.pending.drain(..consumed);
                    if produced > 0 {
                        buf.truncate(produced);
                        out.push(Bytes::from(buf));
                    }
                    match status {
                        Status::StreamEnd => {
                            self.state = State::Trailer(8);
                        }
                        Status::Ok | Status::BufError => {
                            if consumed == 0 && produced == 0 {
                                return Ok(out);
                            }
                        }
                    }
                }
                State::Trailer(ref mut remaining) => {
                    let take = self.pending.len().min(*remaining);
                    self.pending.drain(..take);
                    *remaining -= take;
                    if *remaining == 0 {
                        // Multi-member gzip streams continue with another
                        // header.
                        if self.pending.is_empty() {
                            self.state = State::Done;
                        } else {
                            self.inflate = Decompress::new(false);
                            self.state = State::Header;
                        }
                    }
                    if self.pending.is_empty() {
                        return Ok(out);
                    }
                }
                State::Done => return Ok(out),
            }
        }
    }

    /// Whether the stream ended cleanly at a member boundary.
    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state, State::Done) || matches!(self.state, State::Trailer(_))
    }
}

const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;

/// Parses the gzip member header, returning the byte count it occupies,
/// or `None` when more input is needed.
fn strip_gzip_header(input: &[u8]) -> Result<Option<usize>> {
    if input.len() < 10 {
        return Ok(None);
    }
    if input[0] != 0x1f || input[1] != 0x8b {
        return Err(Error::new_header());
    }
    if input[2] != 8 {
        // Only deflate compression exists in practice.
        return Err(Error::new_header());
    }
    let flags = input[3];
    let mut at = 10usize;

    if flags & FEXTRA != 0 {
        if input.len() < at + 2 {
            return Ok(None);
        }
        let extra_len = input[at] as usize | ((input[at + 1] as usize) << 8);
        at += 2 + extra_len;
        if input.len() < at {
            return Ok(None);
        }
    }
    for flag in [FNAME, FCOMMENT] {
        if flags & flag != 0 {
            match input[at..].iter().position(|b| *b == 0) {
                Some(end) => at += end + 1,
                None => return Ok(None),
            }
        }
    }
    if flags & FHCRC != 0 {
        at += 2;
        if input.len() < at {
            return Ok(None);
        }
    }
    Ok(Some(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn decode_all(decoder: &mut GzipDecoder, input: &[u8]) -> Vec<u8> {
        decoder
            .decode(input)
            .unwrap()
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect()
    }

    #[test]
    fn round_trip() {
        let plain = b"The quick brown fox jumps over the lazy dog".repeat(100);
        let compressed = gzip(&plain);
        let mut decoder = GzipDecoder::new();
        let out = decode_all(&mut decoder, &compressed);
        assert_eq!(out, plain);
        assert!(decoder.is_done());
    }

    #[test]
    fn byte_at_a_time() {
        let plain = b"stream me in tiny pieces";
        let compressed = gzip(plain);
        let mut decoder = GzipDecoder::new();
        let mut out = Vec::new();
        for byte in compressed {
            out.extend(decode_all(&mut decoder, &[byte]));
        }
        assert_eq!(out, plain);
        assert!(decoder.is_done());
    }

    #[test]
    fn rejects_garbage() {
        let mut decoder = GzipDecoder::new();
        assert!(decoder.decode(b"not gzip at all, sorry....").is_err());
    }

    #[test]
    fn gzip_with_filename_header() {
        let mut header = vec![0x1f, 0x8b, 8, FNAME, 0, 0, 0, 0, 0, 0xff];
        header.extend_from_slice(b"file.txt\0");
        let consumed = strip_gzip_header(&header).unwrap().unwrap();
        assert_eq!(consumed, header.len());
    }
}
