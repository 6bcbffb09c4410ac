use bytes::{BufMut, Bytes, BytesMut};

use super::huffman;
use super::table::{DynamicTable, Match};

/// Encodes header blocks, maintaining the dynamic table for the send
/// direction of one connection.
#[derive(Debug)]
pub(crate) struct Encoder {
    table: DynamicTable,
    /// A pending maximum-size change, emitted at the start of the next block.
    size_update: Option<usize>,
}

impl Encoder {
    pub(crate) fn new(max_size: usize) -> Encoder {
        Encoder {
            table: DynamicTable::new(max_size),
            size_update: None,
        }
    }

    /// Applies the peer's SETTINGS_HEADER_TABLE_SIZE.
    ///
    /// The wire-visible size update precedes the next header block, as the
    /// ordering rules require.
    pub(crate) fn update_max_size(&mut self, max_size: usize) {
        if max_size != self.table.max_size() {
            self.size_update = Some(max_size);
            self.table.set_max_size(max_size);
        }
    }

    /// Encodes one header block from `(name, value, sensitive)` fields.
    ///
    /// Names must already be lowercase; HTTP/2 forbids uppercase on the wire.
    pub(crate) fn encode<'a, I>(&mut self, fields: I, dst: &mut BytesMut)
    where
        I: Iterator<Item = (&'a [u8], &'a [u8], bool)>,
    {
        if let Some(size) = self.size_update.take() {
            encode_int(size as u64, 5, 0x20, dst);
        }

        for (name, value, sensitive) in fields {
            if sensitive {
                // Literal never indexed: protects the value from inclusion
                // in the shared compression context.
                match self.table.find(name, value) {
                    Match::Full(index) | Match::Name(index) => {
                        encode_int(index as u64, 4, 0x10, dst);
                    }
                    Match::None => {
                        dst.put_u8(0x10);
                        encode_string(name, dst);
                    }
                }
                encode_string(value, dst);
                continue;
            }

            match self.table.find(name, value) {
                Match::Full(index) => {
                    encode_int(index as u64, 7, 0x80, dst);
                }
                Match::Name(index) => {
                    encode_int(index as u64, 6, 0x40, dst);
                    encode_string(value, dst);
                    self.table
                        .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
                }
                Match::None => {
                    dst.put_u8(0x40);
                    encode_string(name, dst);
                    encode_string(value, dst);
                    self.table
                        .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
                }
            }
        }
    }
}

/// Encodes an integer with an N-bit prefix under `mask` flag bits.
pub(super) fn encode_int(value: u64, prefix: u8, mask: u8, dst: &mut BytesMut) {
    let limit = (1u64 << prefix) - 1;
    if value < limit {
        dst.put_u8(mask | value as u8);
        return;
    }

    dst.put_u8(mask | limit as u8);
    let mut rem = value - limit;
    while rem >= 128 {
        dst.put_u8((rem % 128) as u8 | 0x80);
        rem /= 128;
    }
    dst.put_u8(rem as u8);
}

fn encode_string(src: &[u8], dst: &mut BytesMut) {
    let huffman_len = huffman::encoded_len(src);
    if huffman_len < src.len() {
        encode_int(huffman_len as u64, 7, 0x80, dst);
        huffman::encode(src, dst);
    } else {
        encode_int(src.len() as u64, 7, 0x00, dst);
        dst.extend_from_slice(src);
    }
}
