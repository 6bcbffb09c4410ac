//! HPACK header compression (RFC 7541).

mod decoder;
mod encoder;
mod huffman;
mod table;

pub(crate) use self::decoder::{Decoder, DecoderError};
pub(crate) use self::encoder::Encoder;
