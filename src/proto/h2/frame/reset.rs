use bytes::{BufMut, BytesMut};

use super::{Error, Head, Kind, Reason, StreamId};

/// An RST_STREAM frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reset {
    stream_id: StreamId,
    reason: Reason,
}

impl Reset {
    pub(crate) fn new(stream_id: StreamId, reason: Reason) -> Reset {
        Reset { stream_id, reason }
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Reset, Error> {
        if head.stream_id().is_connection() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }
        let reason = ((payload[0] as u32) << 24)
            | ((payload[1] as u32) << 16)
            | ((payload[2] as u32) << 8)
            | (payload[3] as u32);
        Ok(Reset {
            stream_id: head.stream_id(),
            reason: reason.into(),
        })
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn reason(&self) -> Reason {
        self.reason
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        Head::new(Kind::Reset, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn reset_round_trip() {
        let mut buf = BytesMut::new();
        Reset::new(StreamId(5), Reason::REFUSED_STREAM).encode(&mut buf);
        let head = Head::parse(&buf);
        let frame = Reset::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(frame.stream_id(), StreamId(5));
        assert_eq!(frame.reason(), Reason::REFUSED_STREAM);
    }
}
