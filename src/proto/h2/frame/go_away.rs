use bytes::{BufMut, Bytes, BytesMut};

use super::{Error, Head, Kind, Reason, StreamId};

/// A GOAWAY frame: last processed stream, error code, debug data.
#[derive(Debug, Clone)]
pub(crate) struct GoAway {
    last_stream_id: StreamId,
    reason: Reason,
    debug_data: Bytes,
}

impl GoAway {
    pub(crate) fn new(last_stream_id: StreamId, reason: Reason) -> GoAway {
        GoAway {
            last_stream_id,
            reason,
            debug_data: Bytes::new(),
        }
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<GoAway, Error> {
        if !head.stream_id().is_connection() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() < 8 {
            return Err(Error::BadFrameSize);
        }

        let last_stream_id = StreamId::parse(&payload[0..4]);
        let reason = ((payload[4] as u32) << 24)
            | ((payload[5] as u32) << 16)
            | ((payload[6] as u32) << 8)
            | (payload[7] as u32);

        Ok(GoAway {
            last_stream_id,
            reason: reason.into(),
            debug_data: payload.slice(8..),
        })
    }

    pub(crate) fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    pub(crate) fn reason(&self) -> Reason {
        self.reason
    }

    #[allow(unused)]
    pub(crate) fn debug_data(&self) -> &Bytes {
        &self.debug_data
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::GoAway, 0, StreamId::CONNECTION);
        head.encode(8 + self.debug_data.len(), dst);
        dst.put_u32(self.last_stream_id.0);
        dst.put_u32(self.reason.into());
        dst.extend_from_slice(&self.debug_data);
    }
}
