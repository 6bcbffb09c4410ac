use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::proto::h2::frame::{self, Frame, Head, Kind, Reason, StreamId, HEADER_LEN};
use crate::proto::h2::hpack;

// 16 MB "sane default" shared with the wider h2 ecosystem.
const DEFAULT_MAX_HEADER_BLOCK_SIZE: usize = 16 << 20;

/// Reads typed frames off the transport.
///
/// Owns the connection's HPACK decoder: header blocks are reassembled from
/// CONTINUATION frames here, so the decoder only ever sees complete blocks.
pub(crate) struct FramedRead<T> {
    io: T,
    buf: BytesMut,
    max_frame_size: u32,
    max_header_block_size: usize,
    hpack: hpack::Decoder,
    partial: Option<Partial>,
}

/// A headers frame still waiting for CONTINUATION frames.
struct Partial {
    frame: Continuable,
    buf: BytesMut,
}

enum Continuable {
    Headers(frame::Headers),
    PushPromise(frame::PushPromise),
}

/// Failures surfaced by the reader, split by blast radius.
#[derive(Debug)]
pub(crate) enum RecvError {
    /// The whole connection is broken; send GOAWAY with this code.
    Connection(Reason),
    /// One stream is broken; send RST_STREAM with this code.
    Stream { id: StreamId, reason: Reason },
    /// Transport failure.
    Io(io::Error),
}

impl From<io::Error> for RecvError {
    fn from(src: io::Error) -> RecvError {
        RecvError::Io(src)
    }
}

impl<T> FramedRead<T>
where
    T: AsyncRead + Unpin,
{
    pub(crate) fn new(io: T, header_table_size: usize) -> FramedRead<T> {
        FramedRead {
            io,
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_block_size: DEFAULT_MAX_HEADER_BLOCK_SIZE,
            hpack: hpack::Decoder::new(header_table_size),
            partial: None,
        }
    }

    /// Raises the frame-size limit after we advertise a larger SETTINGS
    /// value.
    pub(crate) fn set_max_frame_size(&mut self, val: u32) {
        debug_assert!((frame::DEFAULT_MAX_FRAME_SIZE..=frame::MAX_MAX_FRAME_SIZE).contains(&val));
        self.max_frame_size = val;
    }

    /// The next complete frame, or `None` on clean EOF.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>, RecvError> {
        loop {
            if let Some(frame) = self.try_decode()? {
                debug!("received; frame={:?}", frame);
                return Ok(Some(frame));
            }

            if 0 == self.io.read_buf(&mut self.buf).await? {
                return if self.buf.is_empty() && self.partial.is_none() {
                    Ok(None)
                } else {
                    Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed mid-frame").into())
                };
            }
        }
    }

    /// Decodes one frame from the buffer, if a full one has arrived.
    /// `Ok(None)` means more bytes are needed or the frame was absorbed
    /// (unknown type, PRIORITY, partial header block).
    fn try_decode(&mut self) -> Result<Option<Frame>, RecvError> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }

            let payload_len = Head::payload_len(&self.buf);
            if payload_len as u32 > self.max_frame_size {
                debug!("frame over max_frame_size; len={}", payload_len);
                return Err(RecvError::Connection(Reason::FRAME_SIZE_ERROR));
            }
            if self.buf.len() < HEADER_LEN + payload_len {
                return Ok(None);
            }

            let head = Head::parse(&self.buf);
            let _ = self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(payload_len).freeze();
            trace!("decoding frame; kind={:?} len={}", head.kind(), payload_len);

            if self.partial.is_some() && head.kind() != Kind::Continuation {
                debug!("expected CONTINUATION, got {:?}", head.kind());
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }

            let frame = match head.kind() {
                Kind::Data => frame::Data::load(head, payload)
                    .map_err(|e| RecvError::Connection(e.reason()))?
                    .into(),
                Kind::Headers => {
                    let (headers, block) = frame::Headers::load(head, payload)
                        .map_err(|e| RecvError::Connection(e.reason()))?;
                    match self.begin_block(Continuable::Headers(headers), block)? {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
                Kind::PushPromise => {
                    let (push, block) = frame::PushPromise::load(head, payload)
                        .map_err(|e| RecvError::Connection(e.reason()))?;
                    match self.begin_block(Continuable::PushPromise(push), block)? {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
                Kind::Priority => {
                    // Parsed for validity, then dropped.
                    frame::Priority::load(head, &payload)
                        .map_err(|e| RecvError::Connection(e.reason()))?;
                    continue;
                }
                Kind::Reset => frame::Reset::load(head, &payload)
                    .map_err(|e| RecvError::Connection(e.reason()))?
                    .into(),
                Kind::Settings => frame::Settings::load(head, &payload)
                    .map_err(|e| RecvError::Connection(e.reason()))?
                    .into(),
                Kind::Ping => frame::Ping::load(head, &payload)
                    .map_err(|e| RecvError::Connection(e.reason()))?
                    .into(),
                Kind::GoAway => frame::GoAway::load(head, payload)
                    .map_err(|e| RecvError::Connection(e.reason()))?
                    .into(),
                Kind::WindowUpdate => {
                    frame::WindowUpdate::load(head, &payload).map_err(|e| match e {
                        // A zero increment on a stream is a stream error;
                        // on the connection it is a connection error.
                        frame::Error::ZeroWindowIncrement if !head.stream_id().is_connection() => {
                            RecvError::Stream {
                                id: head.stream_id(),
                                reason: Reason::PROTOCOL_ERROR,
                            }
                        }
                        other => RecvError::Connection(other.reason()),
                    })?
                    .into()
                }
                Kind::Continuation => {
                    let mut partial = match self.partial.take() {
                        Some(partial) => partial,
                        None => {
                            debug!("unexpected CONTINUATION frame");
                            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
                        }
                    };
                    if partial.stream_id() != head.stream_id() {
                        debug!("CONTINUATION stream id mismatch");
                        return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
                    }

                    partial.buf.extend_from_slice(&payload);
                    if partial.buf.len() > self.max_header_block_size {
                        return Err(RecvError::Connection(Reason::COMPRESSION_ERROR));
                    }

                    let end_of_headers = head.flag() & frame::END_HEADERS != 0;
                    if !end_of_headers {
                        self.partial = Some(partial);
                        continue;
                    }

                    let mut block = partial.buf.freeze();
                    self.finish_block(partial.frame, &mut block)?
                }
                Kind::Unknown(_) => {
                    // Unknown frame types are ignored for forward
                    // compatibility.
                    continue;
                }
            };

            return Ok(Some(frame));
        }
    }

    fn begin_block(
        &mut self,
        frame: Continuable,
        block: Bytes,
    ) -> Result<Option<Frame>, RecvError> {
        if block.len() > self.max_header_block_size {
            return Err(RecvError::Connection(Reason::COMPRESSION_ERROR));
        }
        if frame.is_end_headers() {
            let mut block = block;
            return self.finish_block(frame, &mut block).map(Some);
        }
        self.partial = Some(Partial {
            frame,
            buf: BytesMut::from(&block[..]),
        });
        Ok(None)
    }

    fn finish_block(&mut self, frame: Continuable, block: &mut Bytes) -> Result<Frame, RecvError> {
        match frame {
            Continuable::Headers(mut headers) => {
                headers.set_end_headers();
                headers
                    .load_hpack(block, &mut self.hpack)
                    .map_err(|e| match e {
                        frame::Error::MalformedHeaderBlock => RecvError::Stream {
                            id: headers.stream_id(),
                            reason: Reason::PROTOCOL_ERROR,
                        },
                        other => RecvError::Connection(other.reason()),
                    })?;
                Ok(headers.into())
            }
            Continuable::PushPromise(mut push) => {
                push.set_end_headers();
                push.load_hpack(block, &mut self.hpack)
                    .map_err(|e| RecvError::Connection(e.reason()))?;
                Ok(push.into())
            }
        }
    }
}

impl Partial {
    fn stream_id(&self) -> StreamId {
        self.frame.stream_id()
    }
}

impl Continuable {
    fn stream_id(&self) -> StreamId {
        match self {
            Continuable::Headers(h) => h.stream_id(),
            Continuable::PushPromise(p) => p.stream_id(),
        }
    }

    fn is_end_headers(&self) -> bool {
        match self {
            Continuable::Headers(h) => h.is_end_headers(),
            Continuable::PushPromise(p) => p.is_end_headers(),
        }
    }
}
