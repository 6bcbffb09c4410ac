//! Frame-level IO: a length-checked reader with CONTINUATION reassembly
//! and a buffered writer that owns the HPACK encoder.

mod framed_read;
mod framed_write;

pub(crate) use self::framed_read::{FramedRead, RecvError};
pub(crate) use self::framed_write::FramedWrite;

/// The client connection preface, sent before the first SETTINGS frame.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
