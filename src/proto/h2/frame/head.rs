use bytes::{BufMut, BytesMut};

/// The fixed 9-byte frame header: length (24), type (8), flags (8),
/// reserved bit plus stream identifier (32).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

/// A stream identifier with the reserved bit masked off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct StreamId(pub(crate) u32);

impl Head {
    pub(crate) fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Head {
        Head {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parses the 9-byte header. `src` must hold at least `HEADER_LEN` bytes.
    pub(crate) fn parse(src: &[u8]) -> Head {
        Head {
            kind: Kind::from(src[3]),
            flag: src[4],
            stream_id: StreamId::parse(&src[5..9]),
        }
    }

    /// The payload length announced by the header.
    pub(crate) fn payload_len(src: &[u8]) -> usize {
        ((src[0] as usize) << 16) | ((src[1] as usize) << 8) | (src[2] as usize)
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    pub(crate) fn flag(&self) -> u8 {
        self.flag
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn encode(&self, payload_len: usize, dst: &mut BytesMut) {
        debug_assert!(payload_len < 1 << 24);
        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind.into());
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.0);
    }
}

impl From<u8> for Kind {
    fn from(src: u8) -> Kind {
        match src {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            other => Kind::Unknown(other),
        }
    }
}

impl From<Kind> for u8 {
    fn from(src: Kind) -> u8 {
        match src {
            Kind::Data => 0,
            Kind::Headers => 1,
            Kind::Priority => 2,
            Kind::Reset => 3,
            Kind::Settings => 4,
            Kind::PushPromise => 5,
            Kind::Ping => 6,
            Kind::GoAway => 7,
            Kind::WindowUpdate => 8,
            Kind::Continuation => 9,
            Kind::Unknown(other) => other,
        }
    }
}

impl StreamId {
    pub(crate) const CONNECTION: StreamId = StreamId(0);

    /// Masks off the reserved high bit.
    pub(crate) fn parse(src: &[u8]) -> StreamId {
        let raw = ((src[0] as u32) << 24) | ((src[1] as u32) << 16) | ((src[2] as u32) << 8)
            | (src[3] as u32);
        StreamId(raw & 0x7FFF_FFFF)
    }

    pub(crate) fn is_connection(&self) -> bool {
        self.0 == 0
    }

    /// Client-initiated streams carry odd identifiers.
    pub(crate) fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }
}

impl From<u32> for StreamId {
    fn from(src: u32) -> StreamId {
        StreamId(src)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn head_round_trip() {
        let mut buf = BytesMut::new();
        let head = Head::new(Kind::Headers, 0x5, StreamId(7));
        head.encode(1234, &mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        assert_eq!(Head::payload_len(&buf), 1234);
        let parsed = Head::parse(&buf);
        assert_eq!(parsed.kind(), Kind::Headers);
        assert_eq!(parsed.flag(), 0x5);
        assert_eq!(parsed.stream_id(), StreamId(7));
    }

    #[test]
    fn reserved_bit_masked() {
        let id = StreamId::parse(&[0x80, 0, 0, 3]);
        assert_eq!(id, StreamId(3));
    }
}
