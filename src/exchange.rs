//! A single request/response pair bound to a pooled connection.

use std::sync::Arc;

use bytes::Bytes;
use http::header::HeaderMap;
use tracing::trace;

use crate::error::Result;
use crate::event::EventListener;
use crate::pool::{CallMarker, Pool, PooledConnection};
use crate::proto::h2::connection::H2Cancel;
use crate::proto::{Codec, RequestHead, ResponseHead};

/// Cancels whichever protocol engine the exchange runs on.
#[derive(Clone)]
pub(crate) enum ExchangeCancel {
    H1 {
        cell: crate::proto::h1::CancelCell,
        socket: crate::proto::h1::H1Socket,
    },
    H2(H2Cancel),
}

impl ExchangeCancel {
    pub(crate) fn cancel(&self) {
        match self {
            // HTTP/1 cancellation closes the socket and aborts any
            // pending IO wait.
            ExchangeCancel::H1 { cell, socket } => {
                cell.cancel();
                socket.close();
            }
            // HTTP/2 cancellation resets the stream.
            ExchangeCancel::H2(handle) => handle.cancel(),
        }
    }
}

/// One-shot: drives exactly one request/response, then releases the
/// connection back to the pool (when the protocol permits reuse).
pub(crate) struct Exchange {
    codec: Codec,
    conn: Arc<PooledConnection>,
    pool: Pool,
    marker: Arc<CallMarker>,
    events: Arc<dyn EventListener>,
    call_id: u64,
    released: bool,
}

impl Exchange {
    pub(crate) fn new(
        codec: Codec,
        conn: Arc<PooledConnection>,
        pool: Pool,
        marker: Arc<CallMarker>,
        events: Arc<dyn EventListener>,
        call_id: u64,
    ) -> Exchange {
        Exchange {
            codec,
            conn,
            pool,
            marker,
            events,
            call_id,
            released: false,
        }
    }

    pub(crate) fn connection(&self) -> &Arc<PooledConnection> {
        &self.conn
    }

    pub(crate) fn codec_ref(&self) -> &Codec {
        &self.codec
    }

    pub(crate) fn cancel_handle(&self) -> ExchangeCancel {
        match self.codec {
            Codec::H1(ref h1) => ExchangeCancel::H1 {
                cell: h1.cancel_cell(),
                socket: h1.socket_handle(),
            },
            Codec::H2(ref h2) => ExchangeCancel::H2(h2.cancel_handle()),
        }
    }

    pub(crate) async fn write_request_head(
        &mut self,
        head: RequestHead<'_>,
        end_stream: bool,
    ) -> Result<()> {
        self.codec.write_request_head(head, end_stream).await
    }

    pub(crate) async fn write_data(&mut self, chunk: Bytes, end_stream: bool) -> Result<()> {
        self.codec.write_data(chunk, end_stream).await
    }

    pub(crate) async fn finish_body(&mut self) -> Result<()> {
        self.codec.finish_body().await
    }

    pub(crate) async fn read_response_head(&mut self) -> Result<ResponseHead> {
        self.codec.read_response_head().await
    }

    pub(crate) async fn read_data(&mut self) -> Result<Option<Bytes>> {
        self.codec.read_data().await
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.codec.take_trailers()
    }

    /// Takes the raw transport after a 101 response (HTTP/1 only).
    pub(crate) fn take_upgrade(&mut self) -> Option<crate::upgrade::Upgraded> {
        match self.codec {
            Codec::H1(ref mut h1) => h1
                .take_upgrade()
                .map(|(io, leftover)| crate::upgrade::Upgraded::new(io, leftover)),
            Codec::H2(_) => None,
        }
    }

    /// Tears down the in-flight exchange without waiting.
    pub(crate) fn cancel(&self) {
        self.codec.cancel();
    }

    /// Returns the connection to the pool. Idempotent; also runs on drop.
    pub(crate) fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let reusable = self.codec.is_reusable();
        trace!(
            "releasing connection {} (reusable={})",
            self.conn.id,
            reusable
        );
        self.pool.release(&self.conn, &self.marker, reusable);
        self.events.connection_released(self.call_id, self.conn.id);
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.release();
    }
}

/// Streams a response body off an exchange, releasing the connection once
/// the body completes (or poisoning it when dropped early).
pub(crate) struct BodyReader {
    exchange: Exchange,
    complete: bool,
    bytes_read: u64,
    trailers: Option<HeaderMap>,
}

impl BodyReader {
    pub(crate) fn new(exchange: Exchange) -> BodyReader {
        BodyReader {
            exchange,
            complete: false,
            bytes_read: 0,
            trailers: None,
        }
    }

    pub(crate) async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.complete {
            return Ok(None);
        }
        match self.exchange.read_data().await {
            Ok(Some(chunk)) => {
                self.bytes_read += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.complete = true;
                self.trailers = self.exchange.take_trailers();
                let call_id = self.exchange.call_id;
                self.exchange.events.response_body_end(call_id, self.bytes_read);
                self.exchange.release();
                Ok(None)
            }
            Err(err) => {
                self.complete = true;
                self.exchange.cancel();
                self.exchange.release();
                Err(err)
            }
        }
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        if !self.complete {
            // The body was abandoned mid-read; the transport cannot be
            // reused with half a body in flight.
            self.exchange.cancel();
        }
    }
}
