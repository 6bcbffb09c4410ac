//! The one-exchange-at-a-time HTTP/1 connection state machine.
//!
//! State progresses IDLE → writing request head → writing body → reading
//! response head → reading body → IDLE. The transport lives in a shared
//! slot: taken when an exchange begins, returned when the exchange ends
//! reusable, dropped when it does not.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, CONNECTION};
use http::Method;
use tracing::{debug, trace};

use crate::common::io::BoxedIo;
use crate::error::{Error, Result};
use crate::proto::{RequestHead, ResponseHead};

use super::decode::Decoder;
use super::encode::Encoder;
use super::io::{Buffered, MAX_HEAD_SIZE};
use super::role;

/// Cancellation state shared between an exchange and its cancel handles.
///
/// The notify half wakes IO waits immediately instead of letting them run
/// to their timeouts.
#[derive(Clone)]
pub(crate) struct CancelCell {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelCell {
    fn new() -> CancelCell {
        CancelCell {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Runs `fut`, aborting with a cancellation error the moment this
    /// cell cancels.
    pub(crate) async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_canceled() {
            return Err(Error::new_canceled());
        }
        tokio::select! {
            biased;
            _ = notified => Err(Error::new_canceled()),
            result = fut => result,
        }
    }
}

/// The pooled transport slot for one HTTP/1 connection.
///
/// Empty while an exchange is in flight; `close` poisons it for good.
#[derive(Clone)]
pub(crate) struct H1Socket {
    slot: Arc<Mutex<Option<Buffered>>>,
    healthy: Arc<AtomicBool>,
}

impl H1Socket {
    pub(crate) fn new(io: Buffered) -> H1Socket {
        H1Socket {
            slot: Arc::new(Mutex::new(Some(io))),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Takes the transport for a new exchange; `None` if busy or closed.
    pub(crate) fn take(&self) -> Option<Buffered> {
        if !self.is_healthy() {
            return None;
        }
        self.slot.lock().unwrap().take()
    }

    /// An idle socket holds its transport and is still healthy.
    pub(crate) fn is_idle(&self) -> bool {
        self.is_healthy() && self.slot.lock().unwrap().is_some()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        let _ = self.slot.lock().unwrap().take();
    }

    fn put_back(&self, io: Buffered) {
        if self.is_healthy() {
            *self.slot.lock().unwrap() = Some(io);
        }
    }
}

#[derive(Debug)]
enum Writing {
    Init,
    Body(Encoder),
    Done,
}

#[derive(Debug)]
enum Reading {
    Init,
    Body(Decoder),
    Done,
    Upgrade,
}

/// One request/response pair on an HTTP/1 connection.
pub(crate) struct H1Exchange {
    io: Option<Buffered>,
    socket: H1Socket,
    writing: Writing,
    reading: Reading,
    method: Option<Method>,
    keep_alive: bool,
    trailers: Option<HeaderMap>,
    canceled: CancelCell,
    upgrade: Option<(BoxedIo, Bytes)>,
}

impl H1Exchange {
    /// Starts an exchange on the socket's transport. Fails if another
    /// exchange holds it.
    pub(crate) fn new(socket: H1Socket) -> Option<H1Exchange> {
        let io = socket.take()?;
        Some(H1Exchange {
            io: Some(io),
            socket,
            writing: Writing::Init,
            reading: Reading::Init,
            method: None,
            keep_alive: true,
            trailers: None,
            canceled: CancelCell::new(),
            upgrade: None,
        })
    }

    fn check_canceled(&self) -> Result<()> {
        if self.canceled.is_canceled() {
            Err(Error::new_canceled())
        } else {
            Ok(())
        }
    }

    fn io_mut(&mut self) -> Result<&mut Buffered> {
        self.io.as_mut().ok_or_else(Error::new_connection_closed)
    }

    pub(crate) async fn write_request_head(
        &mut self,
        head: RequestHead<'_>,
        end_stream: bool,
    ) -> Result<()> {
        debug_assert!(matches!(self.writing, Writing::Init));
        self.check_canceled()?;

        self.method = Some(head.method.clone());
        if wants_close(head.headers) {
            self.keep_alive = false;
        }

        // Framing for the body follows from the headers the bridge set.
        let encoder = if end_stream {
            None
        } else if let Some(len) = head
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(Encoder::length(len))
        } else {
            Some(Encoder::chunked())
        };

        let mut dst = BytesMut::new();
        role::encode_request_head(&head, &mut dst);
        let cancel = self.canceled.clone();
        let io = self.io_mut()?;
        io.buffer(&dst);
        cancel.guard(io.flush()).await?;

        self.writing = match encoder {
            Some(encoder) => Writing::Body(encoder),
            None => Writing::Done,
        };
        trace!("wrote request head; end_stream={}", end_stream);
        Ok(())
    }

    pub(crate) async fn write_data(&mut self, chunk: Bytes, end_stream: bool) -> Result<()> {
        self.check_canceled()?;

        let mut scratch = BytesMut::new();
        match self.writing {
            Writing::Body(ref mut encoder) => {
                encoder.encode(&chunk, &mut scratch)?;
                if end_stream {
                    encoder.finish(&mut scratch)?;
                }
            }
            _ => return Err(Error::new_closed()),
        }

        let cancel = self.canceled.clone();
        let io = self.io_mut()?;
        io.buffer(&scratch);
        cancel.guard(io.flush()).await?;
        if end_stream {
            self.writing = Writing::Done;
        }
        Ok(())
    }

    pub(crate) async fn finish_body(&mut self) -> Result<()> {
        match self.writing {
            Writing::Done => Ok(()),
            Writing::Body(_) => self.write_data(Bytes::new(), true).await,
            Writing::Init => Err(Error::new_closed()),
        }
    }

    /// Reads the next response head: informational heads are returned as
    /// they arrive, and the body decoder arms only on the final one.
    pub(crate) async fn read_response_head(&mut self) -> Result<ResponseHead> {
        debug_assert!(matches!(self.reading, Reading::Init));
        self.check_canceled()?;

        let cancel = self.canceled.clone();
        let head = loop {
            let io = self.io_mut()?;
            if let Some(head) = role::parse_response_head(io.read_buf_mut())? {
                break head;
            }
            if io.read_buf().len() > MAX_HEAD_SIZE {
                return Err(Error::new_too_large());
            }
            if cancel.guard(io.fill()).await? == 0 {
                debug!("connection closed while reading response head");
                return Err(Error::new_connection_closed());
            }
        };

        if head.is_informational() && head.status.as_u16() != 101 {
            // 1xx: another head follows on the same stream.
            return Ok(head);
        }

        if wants_close(&head.headers) {
            self.keep_alive = false;
        }

        let method = self.method.clone().unwrap_or(Method::GET);
        match role::response_body(&head, &method)? {
            role::ResponseBody::Decode(decoder) => {
                if !decoder.allows_reuse() {
                    self.keep_alive = false;
                }
                self.reading = Reading::Body(decoder);
            }
            role::ResponseBody::Empty => {
                self.reading = Reading::Done;
            }
            role::ResponseBody::Upgrade => {
                // The codec guarantees no further HTTP framing happens on
                // this connection.
                self.keep_alive = false;
                self.reading = Reading::Upgrade;
                if let Some(io) = self.io.take() {
                    self.upgrade = Some(io.into_parts());
                }
            }
        }

        Ok(head)
    }

    pub(crate) async fn read_data(&mut self) -> Result<Option<Bytes>> {
        self.check_canceled()?;

        match self.reading {
            Reading::Body(_) => (),
            Reading::Done | Reading::Upgrade => return Ok(None),
            Reading::Init => return Err(Error::new_closed()),
        }

        let (chunk, finished, reusable) = {
            let cancel = self.canceled.clone();
            let decoder = match self.reading {
                Reading::Body(ref mut decoder) => decoder,
                _ => unreachable!(),
            };
            // Split borrows: decoder state and io live side by side.
            let io = match self.io {
                Some(ref mut io) => io,
                None => return Err(Error::new_connection_closed()),
            };
            let chunk = cancel.guard(decoder.decode(io)).await?;
            let finished = chunk.is_empty();
            (chunk, finished, decoder.allows_reuse())
        };

        if finished {
            if let Reading::Body(ref mut decoder) = self.reading {
                self.trailers = decoder.take_trailers();
            }
            if !reusable {
                self.keep_alive = false;
            }
            self.reading = Reading::Done;
            return Ok(None);
        }
        Ok(Some(chunk))
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    /// Takes the raw transport after a 101 response.
    pub(crate) fn take_upgrade(&mut self) -> Option<(BoxedIo, Bytes)> {
        self.upgrade.take()
    }

    /// The socket handle, used by cancel plumbing outside the exchange.
    pub(crate) fn socket_handle(&self) -> H1Socket {
        self.socket.clone()
    }

    /// The cancel cell, shared with out-of-band cancel handles.
    pub(crate) fn cancel_cell(&self) -> CancelCell {
        self.canceled.clone()
    }

    /// Poisons the exchange: pending IO aborts, the flag is observed
    /// before every further step, and the socket never returns to the
    /// pool.
    pub(crate) fn cancel(&self) {
        self.canceled.cancel();
        self.socket.close();
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.keep_alive
            && !self.canceled.is_canceled()
            && matches!(self.writing, Writing::Done)
            && matches!(self.reading, Reading::Done)
            && self.io.as_ref().map(|io| !io.is_eof()).unwrap_or(false)
    }
}

impl Drop for H1Exchange {
    fn drop(&mut self) {
        if self.is_reusable() {
            if let Some(io) = self.io.take() {
                // Leftover bytes here would desynchronize the next
                // exchange; poison instead of pooling.
                if io.has_buffered_input() {
                    debug!("unexpected bytes after exchange; closing connection");
                    self.socket.close();
                } else {
                    self.socket.put_back(io);
                }
                return;
            }
        }
        self.socket.close();
    }
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn socket_pair() -> (H1Socket, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let buffered = Buffered::new(
            crate::common::io::BoxedIo::new(client),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        (H1Socket::new(buffered), server)
    }

    fn get_head(uri: &http::Uri, headers: &HeaderMap) -> RequestHead<'static> {
        // Tests only: leak to simplify lifetimes.
        let method: &'static Method = Box::leak(Box::new(Method::GET));
        let uri: &'static http::Uri = Box::leak(Box::new(uri.clone()));
        let headers: &'static HeaderMap = Box::leak(Box::new(headers.clone()));
        RequestHead {
            method,
            uri,
            headers,
            absolute_form: false,
        }
    }

    #[tokio::test]
    async fn full_exchange_returns_socket_to_slot() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (socket, mut server) = socket_pair();
        let mut exchange = H1Exchange::new(socket.clone()).unwrap();
        // Slot is empty while the exchange is alive.
        assert!(!socket.is_idle());

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET / HTTP/1.1\r\n"));
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
                .await
                .unwrap();
            server
        });

        let uri: http::Uri = "http://example.com/".parse().unwrap();
        let headers = HeaderMap::new();
        exchange
            .write_request_head(get_head(&uri, &headers), true)
            .await
            .unwrap();

        let head = exchange.read_response_head().await.unwrap();
        assert_eq!(head.status, http::StatusCode::OK);
        assert_eq!(&exchange.read_data().await.unwrap().unwrap()[..], b"hi");
        assert!(exchange.read_data().await.unwrap().is_none());

        assert!(exchange.is_reusable());
        drop(exchange);
        assert!(socket.is_idle());
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connection_close_poisons_the_slot() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (socket, mut server) = socket_pair();
        let mut exchange = H1Exchange::new(socket.clone()).unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            server
        });

        let uri: http::Uri = "http://example.com/".parse().unwrap();
        let headers = HeaderMap::new();
        exchange
            .write_request_head(get_head(&uri, &headers), true)
            .await
            .unwrap();
        let _ = exchange.read_response_head().await.unwrap();
        assert!(exchange.read_data().await.unwrap().is_none());

        assert!(!exchange.is_reusable());
        drop(exchange);
        assert!(!socket.is_idle());
        assert!(!socket.is_healthy());
    }

    #[tokio::test]
    async fn informational_heads_precede_the_real_one() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (socket, mut server) = socket_pair();
        let mut exchange = H1Exchange::new(socket).unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(
                    b"HTTP/1.1 103 Early Hints\r\nlink: </style.css>; rel=preload\r\n\r\n\
                      HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
                )
                .await
                .unwrap();
            server
        });

        let uri: http::Uri = "http://example.com/".parse().unwrap();
        let headers = HeaderMap::new();
        exchange
            .write_request_head(get_head(&uri, &headers), true)
            .await
            .unwrap();

        let hints = exchange.read_response_head().await.unwrap();
        assert_eq!(hints.status.as_u16(), 103);
        let real = exchange.read_response_head().await.unwrap();
        assert_eq!(real.status.as_u16(), 200);
    }

    #[tokio::test]
    async fn upgrade_hands_back_raw_io() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (socket, mut server) = socket_pair();
        let mut exchange = H1Exchange::new(socket.clone()).unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nupgrade: echo\r\n\r\nraw-bytes")
                .await
                .unwrap();
            server
        });

        let uri: http::Uri = "http://example.com/".parse().unwrap();
        let headers = HeaderMap::new();
        exchange
            .write_request_head(get_head(&uri, &headers), true)
            .await
            .unwrap();

        let head = exchange.read_response_head().await.unwrap();
        assert_eq!(head.status.as_u16(), 101);
        let (mut io, leftover) = exchange.take_upgrade().unwrap();

        // Any bytes the parser over-read come along with the raw stream.
        let mut raw = Vec::from(&leftover[..]);
        let mut buf = [0u8; 64];
        while raw.len() < 9 {
            let n = io.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&raw[..], b"raw-bytes");

        assert!(!exchange.is_reusable());
        drop(exchange);
        assert!(!socket.is_healthy());
    }
}
