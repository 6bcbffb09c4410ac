use bytes::{Bytes, BytesMut};

use super::{util, Error, Head, Kind, StreamId};

const END_STREAM: u8 = 0x1;
const PADDED: u8 = 0x8;

/// A DATA frame carrying a slice of a request or response body.
#[derive(Debug)]
pub(crate) struct Data {
    stream_id: StreamId,
    data: Bytes,
    flags: u8,
    /// Padding octets counted against flow control on receive.
    pad_len: u32,
}

impl Data {
    pub(crate) fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Data {
        Data {
            stream_id,
            data,
            flags: if end_stream { END_STREAM } else { 0 },
            pad_len: 0,
        }
    }

    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<Data, Error> {
        if head.stream_id().is_connection() {
            return Err(Error::InvalidStreamId);
        }

        let flags = head.flag();
        let total = payload.len() as u32;

        if flags & PADDED == PADDED {
            util::strip_padding(&mut payload)?;
        }

        Ok(Data {
            stream_id: head.stream_id(),
            pad_len: total - payload.len() as u32,
            data: payload,
            flags: flags & END_STREAM,
        })
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn is_end_stream(&self) -> bool {
        self.flags & END_STREAM == END_STREAM
    }

    /// Bytes charged to the flow-control windows, padding included.
    pub(crate) fn flow_len(&self) -> u32 {
        self.data.len() as u32 + self.pad_len
    }

    pub(crate) fn payload(&self) -> &Bytes {
        &self.data
    }

    pub(crate) fn into_payload(self) -> Bytes {
        self.data
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::Data, self.flags, self.stream_id);
        head.encode(self.data.len(), dst);
        dst.extend_from_slice(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn data_round_trip() {
        let mut buf = BytesMut::new();
        Data::new(StreamId(3), Bytes::from_static(b"body"), true).encode(&mut buf);

        let head = Head::parse(&buf);
        let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..]);
        let frame = Data::load(head, payload).unwrap();

        assert_eq!(frame.stream_id(), StreamId(3));
        assert!(frame.is_end_stream());
        assert_eq!(frame.flow_len(), 4);
        assert_eq!(&frame.payload()[..], b"body");
    }

    #[test]
    fn rejects_stream_zero() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Data, 0, StreamId::CONNECTION).encode(2, &mut buf);
        let head = Head::parse(&buf);
        assert!(matches!(
            Data::load(head, Bytes::from_static(b"xx")),
            Err(Error::InvalidStreamId)
        ));
    }

    #[test]
    fn padding_counts_toward_flow_window() {
        // PADDED flag, pad length 3: one length octet, "ab", three pad bytes.
        let mut buf = BytesMut::new();
        Head::new(Kind::Data, PADDED, StreamId(1)).encode(6, &mut buf);
        let head = Head::parse(&buf);
        let frame = Data::load(head, Bytes::from_static(&[3, b'a', b'b', 0, 0, 0])).unwrap();
        assert_eq!(&frame.payload()[..], b"ab");
        assert_eq!(frame.flow_len(), 6);
    }
}
