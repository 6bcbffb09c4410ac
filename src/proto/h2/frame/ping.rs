use bytes::BytesMut;

use super::{Error, Head, Kind, StreamId};

const ACK: u8 = 0x1;

/// A PING frame with its opaque 8-byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ping {
    ack: bool,
    payload: [u8; 8],
}

impl Ping {
    pub(crate) fn new(payload: [u8; 8]) -> Ping {
        Ping {
            ack: false,
            payload,
        }
    }

    pub(crate) fn pong(payload: [u8; 8]) -> Ping {
        Ping { ack: true, payload }
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Ping, Error> {
        if !head.stream_id().is_connection() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 8 {
            return Err(Error::BadFrameSize);
        }
        let mut bytes = [0; 8];
        bytes.copy_from_slice(payload);
        Ok(Ping {
            ack: head.flag() & ACK == ACK,
            payload: bytes,
        })
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.ack
    }

    pub(crate) fn payload(&self) -> &[u8; 8] {
        &self.payload
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let flags = if self.ack { ACK } else { 0 };
        Head::new(Kind::Ping, flags, StreamId::CONNECTION).encode(8, dst);
        dst.extend_from_slice(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn ping_round_trip() {
        let mut buf = BytesMut::new();
        Ping::new(*b"courier!").encode(&mut buf);
        let head = Head::parse(&buf);
        let frame = Ping::load(head, &buf[HEADER_LEN..]).unwrap();
        assert!(!frame.is_ack());
        assert_eq!(frame.payload(), b"courier!");
    }

    #[test]
    fn payload_must_be_eight_bytes() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Ping, 0, StreamId::CONNECTION).encode(4, &mut buf);
        let head = Head::parse(&buf);
        assert!(matches!(
            Ping::load(head, &[0, 1, 2, 3]),
            Err(Error::BadFrameSize)
        ));
    }
}
