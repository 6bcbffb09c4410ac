use bytes::{BufMut, Bytes, BytesMut};

use super::{Error, Head, Kind, Reason, StreamId, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE};

const ACK: u8 = 0x1;

const HEADER_TABLE_SIZE: u16 = 1;
const ENABLE_PUSH: u16 = 2;
const MAX_CONCURRENT_STREAMS: u16 = 3;
const INITIAL_WINDOW_SIZE: u16 = 4;
const MAX_FRAME_SIZE: u16 = 5;
const MAX_HEADER_LIST_SIZE: u16 = 6;

/// A SETTINGS frame. Unset fields are absent from the wire image.
#[derive(Debug, Default, Clone)]
pub(crate) struct Settings {
    flags: u8,
    header_table_size: Option<u32>,
    enable_push: Option<u32>,
    max_concurrent_streams: Option<u32>,
    initial_window_size: Option<u32>,
    max_frame_size: Option<u32>,
    max_header_list_size: Option<u32>,
}

impl Settings {
    pub(crate) fn ack() -> Settings {
        Settings {
            flags: ACK,
            ..Settings::default()
        }
    }

    /// The settings block this client sends right after the preface.
    pub(crate) fn initial(initial_window_size: u32) -> Settings {
        Settings {
            enable_push: Some(0),
            initial_window_size: Some(initial_window_size),
            ..Settings::default()
        }
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Settings, Error> {
        debug_assert_eq!(head.kind(), Kind::Settings);

        if !head.stream_id().is_connection() {
            return Err(Error::InvalidStreamId);
        }

        if head.flag() & ACK == ACK {
            // An ACK settings frame carries no payload.
            if !payload.is_empty() {
                return Err(Error::BadFrameSize);
            }
            return Ok(Settings::ack());
        }

        if payload.len() % 6 != 0 {
            return Err(Error::BadFrameSize);
        }

        let mut settings = Settings::default();

        for chunk in payload.chunks(6) {
            let id = ((chunk[0] as u16) << 8) | chunk[1] as u16;
            let value = ((chunk[2] as u32) << 24)
                | ((chunk[3] as u32) << 16)
                | ((chunk[4] as u32) << 8)
                | (chunk[5] as u32);

            match id {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(Error::InvalidSettingValue(Reason::PROTOCOL_ERROR));
                    }
                    settings.enable_push = Some(value);
                }
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(Error::InvalidSettingValue(Reason::FLOW_CONTROL_ERROR));
                    }
                    settings.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    if !(16_384..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(Error::InvalidSettingValue(Reason::PROTOCOL_ERROR));
                    }
                    settings.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                // Unknown identifiers must be ignored.
                _ => {}
            }
        }

        Ok(settings)
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.flags & ACK == ACK
    }

    pub(crate) fn header_table_size(&self) -> Option<u32> {
        self.header_table_size
    }

    pub(crate) fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub(crate) fn initial_window_size(&self) -> Option<u32> {
        self.initial_window_size
    }

    pub(crate) fn max_frame_size(&self) -> Option<u32> {
        self.max_frame_size
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let mut payload = BytesMut::new();
        let mut push = |id: u16, value: Option<u32>| {
            if let Some(value) = value {
                payload.put_u16(id);
                payload.put_u32(value);
            }
        };
        push(HEADER_TABLE_SIZE, self.header_table_size);
        push(ENABLE_PUSH, self.enable_push);
        push(MAX_CONCURRENT_STREAMS, self.max_concurrent_streams);
        push(INITIAL_WINDOW_SIZE, self.initial_window_size);
        push(MAX_FRAME_SIZE, self.max_frame_size);
        push(MAX_HEADER_LIST_SIZE, self.max_header_list_size);

        let head = Head::new(Kind::Settings, self.flags, StreamId::CONNECTION);
        head.encode(payload.len(), dst);
        dst.extend_from_slice(&payload);
    }
}

#[allow(unused)]
pub(crate) fn load_payload(payload: Bytes) -> Result<Settings, Error> {
    let head = Head::new(Kind::Settings, 0, StreamId::CONNECTION);
    Settings::load(head, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    fn round_trip(settings: &Settings) -> Settings {
        let mut buf = BytesMut::new();
        settings.encode(&mut buf);
        let head = Head::parse(&buf);
        Settings::load(head, &buf[HEADER_LEN..]).unwrap()
    }

    #[test]
    fn initial_block_round_trip() {
        let parsed = round_trip(&Settings::initial(1 << 24));
        assert_eq!(parsed.initial_window_size(), Some(1 << 24));
        assert!(!parsed.is_ack());
    }

    #[test]
    fn enable_push_must_be_boolean() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Settings, 0, StreamId::CONNECTION).encode(6, &mut buf);
        buf.put_u16(ENABLE_PUSH);
        buf.put_u32(2);
        let head = Head::parse(&buf);
        assert!(Settings::load(head, &buf[HEADER_LEN..]).is_err());
    }

    #[test]
    fn window_size_capped_at_2_31() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Settings, 0, StreamId::CONNECTION).encode(6, &mut buf);
        buf.put_u16(INITIAL_WINDOW_SIZE);
        buf.put_u32(1 << 31);
        let head = Head::parse(&buf);
        let err = Settings::load(head, &buf[HEADER_LEN..]).unwrap_err();
        assert_eq!(err.reason(), Reason::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn unknown_identifier_ignored() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Settings, 0, StreamId::CONNECTION).encode(6, &mut buf);
        buf.put_u16(0x99);
        buf.put_u32(7);
        let head = Head::parse(&buf);
        assert!(Settings::load(head, &buf[HEADER_LEN..]).is_ok());
    }
}
