use bytes::{BufMut, BytesMut};

use super::{Error, Head, Kind, StreamId};

/// A WINDOW_UPDATE frame granting flow-control credit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowUpdate {
    stream_id: StreamId,
    increment: u32,
}

impl WindowUpdate {
    pub(crate) fn new(stream_id: StreamId, increment: u32) -> WindowUpdate {
        debug_assert!(increment > 0);
        WindowUpdate {
            stream_id,
            increment,
        }
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<WindowUpdate, Error> {
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }
        // Reserved bit is ignored.
        let increment = (((payload[0] as u32) << 24)
            | ((payload[1] as u32) << 16)
            | ((payload[2] as u32) << 8)
            | (payload[3] as u32))
            & 0x7FFF_FFFF;

        if increment == 0 {
            return Err(Error::ZeroWindowIncrement);
        }

        Ok(WindowUpdate {
            stream_id: head.stream_id(),
            increment,
        })
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn increment(&self) -> u32 {
        self.increment
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        Head::new(Kind::WindowUpdate, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.increment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn window_update_round_trip() {
        let mut buf = BytesMut::new();
        WindowUpdate::new(StreamId::CONNECTION, 65_535).encode(&mut buf);
        let head = Head::parse(&buf);
        let frame = WindowUpdate::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(frame.stream_id(), StreamId::CONNECTION);
        assert_eq!(frame.increment(), 65_535);
    }

    #[test]
    fn zero_increment_is_an_error() {
        let mut buf = BytesMut::new();
        Head::new(Kind::WindowUpdate, 0, StreamId(1)).encode(4, &mut buf);
        let head = Head::parse(&buf);
        assert!(matches!(
            WindowUpdate::load(head, &[0, 0, 0, 0]),
            Err(Error::ZeroWindowIncrement)
        ));
    }
}
