use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::proto::h2::frame::{self, StreamId};
use crate::proto::h2::hpack;

use super::PREFACE;

/// Writes frames to the transport.
///
/// One instance exists per connection, behind an async mutex: holding the
/// lock for the duration of a write is what serializes outgoing frames, and
/// what keeps a header block's CONTINUATION frames contiguous.
pub(crate) struct FramedWrite<T> {
    io: T,
    buf: BytesMut,
    hpack: hpack::Encoder,
    max_frame_size: u32,
}

impl<T> FramedWrite<T>
where
    T: AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T, header_table_size: usize) -> FramedWrite<T> {
        FramedWrite {
            io,
            buf: BytesMut::with_capacity(8 * 1024),
            hpack: hpack::Encoder::new(header_table_size),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Applies the peer's SETTINGS as they affect the write path.
    pub(crate) fn apply_settings(&mut self, settings: &frame::Settings) {
        if let Some(size) = settings.max_frame_size() {
            self.max_frame_size = size;
        }
        if let Some(size) = settings.header_table_size() {
            self.hpack.update_max_size(size as usize);
        }
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// The connection preface plus our initial SETTINGS.
    pub(crate) async fn write_preface(&mut self, settings: &frame::Settings) -> io::Result<()> {
        trace!("writing client preface");
        self.buf.extend_from_slice(PREFACE);
        settings.encode(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn write_settings(&mut self, settings: &frame::Settings) -> io::Result<()> {
        settings.encode(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn write_headers(&mut self, headers: frame::Headers) -> io::Result<()> {
        let max = self.max_frame_size as usize;
        headers.encode(&mut self.hpack, &mut self.buf, max);
        self.flush().await
    }

    pub(crate) async fn write_data(&mut self, data: frame::Data) -> io::Result<()> {
        debug_assert!(data.payload().len() <= self.max_frame_size as usize);
        data.encode(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn write_ping(&mut self, ping: frame::Ping) -> io::Result<()> {
        ping.encode(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn write_reset(&mut self, reset: frame::Reset) -> io::Result<()> {
        reset.encode(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn write_go_away(&mut self, go_away: &frame::GoAway) -> io::Result<()> {
        go_away.encode(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn write_window_update(
        &mut self,
        stream_id: StreamId,
        increment: u32,
    ) -> io::Result<()> {
        frame::WindowUpdate::new(stream_id, increment).encode(&mut self.buf);
        self.flush().await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.io.write_all_buf(&mut self.buf).await?;
        self.io.flush().await
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }

    #[cfg(test)]
    pub(crate) fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }
}
