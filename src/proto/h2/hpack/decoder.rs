use bytes::{Buf, Bytes};

use super::huffman::DecodeTree;
use super::table::DynamicTable;

/// Decodes header blocks, maintaining the dynamic table for the receive
/// direction of one connection.
#[derive(Debug)]
pub(crate) struct Decoder {
    table: DynamicTable,
    tree: DecodeTree,
    /// Upper bound for size updates, from our SETTINGS_HEADER_TABLE_SIZE.
    max_size_limit: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DecoderError {
    /// An index referenced a table slot that does not exist.
    InvalidTableIndex,
    /// A dynamic table size update appeared after a header field.
    SizeUpdateNotAtStart,
    /// A size update exceeded the limit we advertised.
    SizeUpdateTooLarge,
    /// A Huffman-coded string was malformed.
    InvalidHuffmanCode,
    /// A variable-length integer overflowed.
    IntegerOverflow,
    /// The block ended inside a field.
    NeedMore,
}

impl Decoder {
    pub(crate) fn new(max_size: usize) -> Decoder {
        Decoder {
            table: DynamicTable::new(max_size),
            tree: DecodeTree::new(),
            max_size_limit: max_size,
        }
    }

    /// Decodes one complete header block, emitting fields in order.
    pub(crate) fn decode<F>(&mut self, src: &mut Bytes, mut f: F) -> Result<(), DecoderError>
    where
        F: FnMut(Bytes, Bytes),
    {
        let mut saw_field = false;

        while !src.is_empty() {
            let byte = src[0];

            if byte & 0x80 == 0x80 {
                // Indexed header field.
                let index = decode_int(src, 7)? as usize;
                let (name, value) = self
                    .table
                    .get(index)
                    .ok_or(DecoderError::InvalidTableIndex)?;
                saw_field = true;
                f(name, value);
            } else if byte & 0xC0 == 0x40 {
                // Literal with incremental indexing.
                let (name, value) = self.decode_literal(src, 6)?;
                self.table.insert(name.clone(), value.clone());
                saw_field = true;
                f(name, value);
            } else if byte & 0xE0 == 0x20 {
                // Dynamic table size update; only legal before any field.
                if saw_field {
                    return Err(DecoderError::SizeUpdateNotAtStart);
                }
                let size = decode_int(src, 5)? as usize;
                if size > self.max_size_limit {
                    return Err(DecoderError::SizeUpdateTooLarge);
                }
                self.table.set_max_size(size);
            } else {
                // Literal without indexing (0x00) or never indexed (0x10).
                let (name, value) = self.decode_literal(src, 4)?;
                saw_field = true;
                f(name, value);
            }
        }

        Ok(())
    }

    /// Updates the limit advertised through SETTINGS_HEADER_TABLE_SIZE.
    #[allow(unused)]
    pub(crate) fn set_max_size_limit(&mut self, limit: usize) {
        self.max_size_limit = limit;
    }

    fn decode_literal(
        &mut self,
        src: &mut Bytes,
        prefix: u8,
    ) -> Result<(Bytes, Bytes), DecoderError> {
        let name_index = decode_int(src, prefix)? as usize;
        let name = if name_index == 0 {
            self.decode_string(src)?
        } else {
            self.table
                .get(name_index)
                .ok_or(DecoderError::InvalidTableIndex)?
                .0
        };
        let value = self.decode_string(src)?;
        Ok((name, value))
    }

    fn decode_string(&self, src: &mut Bytes) -> Result<Bytes, DecoderError> {
        if src.is_empty() {
            return Err(DecoderError::NeedMore);
        }
        let huffman = src[0] & 0x80 == 0x80;
        let len = decode_int(src, 7)? as usize;
        if src.len() < len {
            return Err(DecoderError::NeedMore);
        }
        let raw = src.split_to(len);
        if huffman {
            let mut out = Vec::with_capacity(len * 2);
            self.tree.decode(&raw, &mut out)?;
            Ok(Bytes::from(out))
        } else {
            Ok(raw)
        }
    }
}

/// Decodes an integer with an N-bit prefix (RFC 7541 §5.1).
pub(super) fn decode_int(src: &mut Bytes, prefix: u8) -> Result<u64, DecoderError> {
    debug_assert!((1..=8).contains(&prefix));
    if src.is_empty() {
        return Err(DecoderError::NeedMore);
    }

    let mask = (1u16 << prefix) as u64 - 1;
    let mut value = (src.get_u8() as u64) & mask;
    if value < mask {
        return Ok(value);
    }

    let mut shift = 0u32;
    loop {
        if src.is_empty() {
            return Err(DecoderError::NeedMore);
        }
        let byte = src.get_u8() as u64;
        value = value
            .checked_add((byte & 0x7f) << shift)
            .ok_or(DecoderError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 56 {
            return Err(DecoderError::IntegerOverflow);
        }
    }
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            DecoderError::InvalidTableIndex => "invalid HPACK table index",
            DecoderError::SizeUpdateNotAtStart => "table size update after header field",
            DecoderError::SizeUpdateTooLarge => "table size update over advertised limit",
            DecoderError::InvalidHuffmanCode => "invalid huffman coding",
            DecoderError::IntegerOverflow => "HPACK integer overflow",
            DecoderError::NeedMore => "truncated header block",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DecoderError {}
