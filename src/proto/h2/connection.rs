//! The multiplexed HTTP/2 client connection.
//!
//! One reader task per connection dispatches incoming frames into the
//! shared stream map. Writers — request exchanges, the keep-alive pinger,
//! and the reader itself when it acks — serialize through one async mutex
//! around the framed writer. Lock order is strict: the stream-map mutex is
//! never held across an await, and never acquired while holding the writer.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::HeaderMap;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, trace, warn};

use crate::common::io::BoxedIo;
use crate::error::{Error, Result, TimeoutKind};
use crate::proto::h2::codec::{FramedRead, FramedWrite, RecvError};
use crate::proto::h2::flow::FlowControl;
use crate::proto::h2::frame::{
    self, Frame, Pseudo, Reason, StreamId, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_SETTINGS_HEADER_TABLE_SIZE,
};
use crate::proto::h2::ping;
use crate::proto::h2::streams::{Store, Stream};
use crate::proto::{RequestHead, ResponseHead};

/// Inbound window for the whole connection; 16 MiB keeps transfers from
/// stalling on the default 64 KiB.
pub(crate) const DEFAULT_CONN_WINDOW: u32 = 16 * 1024 * 1024;

/// Inbound window advertised per stream.
pub(crate) const DEFAULT_STREAM_WINDOW: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct H2Config {
    pub(crate) conn_window: u32,
    pub(crate) stream_window: u32,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
}

impl Default for H2Config {
    fn default() -> H2Config {
        H2Config {
            conn_window: DEFAULT_CONN_WINDOW,
            stream_window: DEFAULT_STREAM_WINDOW,
            ping_interval: None,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Why the connection stopped accepting work.
#[derive(Debug, Clone, Copy)]
pub(super) enum Closed {
    Io(io::ErrorKind),
    GoAway(Reason),
    /// A keep-alive ping went unanswered past the degraded window.
    Degraded,
    /// We shut down gracefully.
    Shutdown,
}

pub(super) struct State {
    pub(super) streams: Store,
    next_stream_id: u32,
    /// The peer's GOAWAY cutoff, once received.
    goaway_received: Option<StreamId>,
    goaway_sent: bool,
    pub(super) closed: Option<Closed>,
    /// Connection-level outbound window.
    send_flow: FlowControl,
    /// Connection-level inbound window as we advertised it.
    recv_flow: FlowControl,
    /// Consumed inbound bytes not yet returned via WINDOW_UPDATE.
    recv_unacked: u32,
    peer_initial_window: u32,
    peer_max_frame: u32,
    peer_max_concurrent: Option<u32>,
    /// Set while a keep-alive ping awaits its ack past one interval.
    pub(super) degraded: bool,
    pub(super) ping_outstanding: Option<[u8; 8]>,
}

pub(super) struct Shared {
    pub(super) state: Mutex<State>,
    pub(super) writer: AsyncMutex<FramedWrite<WriteHalf<BoxedIo>>>,
    /// Wakes tasks blocked on outbound window capacity.
    pub(super) window_notify: Notify,
    pub(super) config: H2Config,
}

/// Handle to a live HTTP/2 connection. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Writes the preface and spawns the reader (and optional pinger)
    /// tasks. Requests may start immediately; the peer's SETTINGS are
    /// applied as they arrive.
    pub(crate) async fn handshake(io: BoxedIo, config: H2Config) -> Result<Connection> {
        let (read_half, write_half) = tokio::io::split(io);

        let mut writer = FramedWrite::new(write_half, DEFAULT_SETTINGS_HEADER_TABLE_SIZE);
        let mut reader = FramedRead::new(read_half, DEFAULT_SETTINGS_HEADER_TABLE_SIZE);
        reader.set_max_frame_size(frame::DEFAULT_MAX_FRAME_SIZE);

        let settings = frame::Settings::initial(config.stream_window);
        writer
            .write_preface(&settings)
            .await
            .map_err(Error::new_io)?;
        if config.conn_window > DEFAULT_INITIAL_WINDOW_SIZE {
            writer
                .write_window_update(
                    StreamId::CONNECTION,
                    config.conn_window - DEFAULT_INITIAL_WINDOW_SIZE,
                )
                .await
                .map_err(Error::new_io)?;
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                streams: Store::default(),
                next_stream_id: 1,
                goaway_received: None,
                goaway_sent: false,
                closed: None,
                send_flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE),
                recv_flow: FlowControl::new(config.conn_window),
                recv_unacked: 0,
                peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
                peer_max_frame: frame::DEFAULT_MAX_FRAME_SIZE,
                peer_max_concurrent: None,
                degraded: false,
                ping_outstanding: None,
            }),
            writer: AsyncMutex::new(writer),
            window_notify: Notify::new(),
            config: config.clone(),
        });

        tokio::spawn(read_loop(shared.clone(), reader));
        if let Some(interval) = config.ping_interval {
            tokio::spawn(ping::run(shared.clone(), interval));
        }

        Ok(Connection { shared })
    }

    /// A new exchange bound to this connection. The stream opens when the
    /// request head is written.
    pub(crate) fn new_exchange(&self) -> StreamExchange {
        StreamExchange {
            shared: self.shared.clone(),
            id: Arc::new(Mutex::new(None)),
            local_closed: false,
            owns_stream: true,
        }
    }

    /// Whether a new exchange may start: healthy, no GOAWAY either way,
    /// and below the peer's concurrency cap.
    pub(crate) fn can_take_new_exchange(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        if state.closed.is_some()
            || state.goaway_received.is_some()
            || state.goaway_sent
            || state.degraded
        {
            return false;
        }
        match state.peer_max_concurrent {
            Some(max) => (state.streams.len() as u32) < max,
            None => true,
        }
    }

    /// Healthy means: not closed, no GOAWAY received, and any outstanding
    /// keep-alive ping still inside its grace window.
    pub(crate) fn is_healthy(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.closed.is_none() && state.goaway_received.is_none() && !state.degraded
    }

    pub(crate) fn active_streams(&self) -> usize {
        self.shared.state.lock().unwrap().streams.len()
    }

    /// Marks the connection as accepting no new exchanges.
    pub(crate) fn set_no_new_exchanges(&self) {
        self.shared.state.lock().unwrap().goaway_sent = true;
    }

    /// Graceful shutdown: GOAWAY with NO_ERROR, then close the transport
    /// once no streams remain.
    pub(crate) async fn shutdown(&self) {
        let (last_good, idle) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed.is_none() {
                state.closed = Some(Closed::Shutdown);
            }
            state.goaway_sent = true;
            let last = state.next_stream_id.saturating_sub(2);
            (StreamId(last), state.streams.is_empty())
        };

        let mut writer = self.shared.writer.lock().await;
        let frame = frame::GoAway::new(last_good, Reason::NO_ERROR);
        if writer.write_go_away(&frame).await.is_ok() && idle {
            let _ = writer.shutdown().await;
        }
    }
}

// ===== reader task =====

async fn read_loop(shared: Arc<Shared>, mut reader: FramedRead<ReadHalf<BoxedIo>>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if let Err(err) = handle_frame(&shared, frame).await {
                    connection_error(&shared, err).await;
                    return;
                }
            }
            Ok(None) => {
                trace!("h2 connection: clean EOF");
                fail_connection(&shared, Closed::Io(io::ErrorKind::UnexpectedEof));
                return;
            }
            Err(RecvError::Stream { id, reason }) => {
                debug!("h2 stream error; id={} reason={}", id, reason);
                reset_stream_inbound(&shared, id, reason).await;
            }
            Err(RecvError::Connection(reason)) => {
                connection_error(&shared, reason).await;
                return;
            }
            Err(RecvError::Io(err)) => {
                debug!("h2 read error: {}", err);
                fail_connection(&shared, Closed::Io(err.kind()));
                return;
            }
        }
    }
}

/// Handles one inbound frame. An `Err` is a connection-level failure.
async fn handle_frame(shared: &Arc<Shared>, frame: Frame) -> std::result::Result<(), Reason> {
    match frame {
        Frame::Settings(settings) => {
            if settings.is_ack() {
                return Ok(());
            }
            {
                let mut state = shared.state.lock().unwrap();
                if let Some(max) = settings.max_concurrent_streams() {
                    state.peer_max_concurrent = Some(max);
                }
                if let Some(size) = settings.max_frame_size() {
                    state.peer_max_frame = size;
                }
                if let Some(window) = settings.initial_window_size() {
                    // The delta applies to every open stream's send window.
                    let delta = window as i64 - state.peer_initial_window as i64;
                    state.peer_initial_window = window;
                    state.streams.for_each(|stream| {
                        stream.send_flow.adjust(delta);
                    });
                }
            }
            shared.window_notify.notify_waiters();

            let mut writer = shared.writer.lock().await;
            writer.apply_settings(&settings);
            writer
                .write_settings(&frame::Settings::ack())
                .await
                .map_err(|_| Reason::INTERNAL_ERROR)?;
        }

        Frame::Ping(ping) => {
            if ping.is_ack() {
                let mut state = shared.state.lock().unwrap();
                if state.ping_outstanding.as_ref() == Some(ping.payload()) {
                    state.ping_outstanding = None;
                    state.degraded = false;
                }
            } else {
                let pong = frame::Ping::pong(*ping.payload());
                let mut writer = shared.writer.lock().await;
                writer
                    .write_ping(pong)
                    .await
                    .map_err(|_| Reason::INTERNAL_ERROR)?;
            }
        }

        Frame::Headers(headers) => {
            let stream_id = headers.stream_id();
            let end_stream = headers.is_end_stream();
            let trailers = headers.is_trailers();
            let (pseudo, fields) = headers.into_parts();

            let mut state = shared.state.lock().unwrap();
            let stream = match state.streams.get_mut(stream_id) {
                Some(stream) if stream.reset.is_none() => stream,
                // Late frames on reset or unknown streams are dropped.
                _ => return Ok(()),
            };

            if trailers {
                if stream.heads.is_empty() {
                    // Trailers before any response head.
                    return Err(Reason::PROTOCOL_ERROR);
                }
                stream.trailers = Some(fields);
                stream.remote_closed = true;
            } else {
                let status = match pseudo.status() {
                    Some(status) => status,
                    None => return Err(Reason::PROTOCOL_ERROR),
                };
                stream.heads.push_back(ResponseHead {
                    status,
                    reason: None,
                    headers: fields,
                });
                if end_stream {
                    stream.remote_closed = true;
                }
            }
            stream.notify.notify_waiters();
        }

        Frame::Data(data) => {
            let flow_len = data.flow_len();
            let stream_id = data.stream_id();
            let end_stream = data.is_end_stream();

            let update = {
                let mut state = shared.state.lock().unwrap();
                state
                    .recv_flow
                    .shrink(flow_len)
                    .map_err(|_| Reason::FLOW_CONTROL_ERROR)?;

                let delivered = match state.streams.get_mut(stream_id) {
                    Some(stream) if stream.reset.is_none() => {
                        if stream.recv_flow.shrink(flow_len).is_err() {
                            return Err(Reason::FLOW_CONTROL_ERROR);
                        }
                        stream.recv_buf.push_back(data.into_payload());
                        stream.buffered_flow += flow_len;
                        if end_stream {
                            stream.remote_closed = true;
                        }
                        stream.notify.notify_waiters();
                        true
                    }
                    _ => false,
                };

                if delivered {
                    None
                } else {
                    // Data for a dead stream still consumed connection
                    // window; credit it straight back.
                    state.recv_unacked += flow_len;
                    pending_conn_update(&mut state, shared.config.conn_window)
                }
            };

            if let Some(increment) = update {
                send_conn_window_update(shared, increment).await;
            }
        }

        Frame::WindowUpdate(update) => {
            let mut state = shared.state.lock().unwrap();
            if update.stream_id().is_connection() {
                state
                    .send_flow
                    .grow(update.increment())
                    .map_err(|reason| reason)?;
            } else if let Some(stream) = state.streams.get_mut(update.stream_id()) {
                if stream.send_flow.grow(update.increment()).is_err() {
                    stream.apply_reset(Reason::FLOW_CONTROL_ERROR);
                }
            }
            drop(state);
            shared.window_notify.notify_waiters();
        }

        Frame::Reset(reset) => {
            let update = {
                let mut state = shared.state.lock().unwrap();
                if let Some(stream) = state.streams.get_mut(reset.stream_id()) {
                    stream.apply_reset(reset.reason());
                    discard_buffered(&mut state, reset.stream_id(), shared.config.conn_window)
                } else {
                    None
                }
            };
            if let Some(increment) = update {
                send_conn_window_update(shared, increment).await;
            }
        }

        Frame::GoAway(go_away) => {
            debug!(
                "received GOAWAY; last_stream_id={} reason={}",
                go_away.last_stream_id(),
                go_away.reason()
            );
            let mut state = shared.state.lock().unwrap();
            state.goaway_received = Some(go_away.last_stream_id());

            // Streams above the cutoff were never processed; they are safe
            // to retry on another connection. Streams at or below it keep
            // running whatever the reason code: no new exchanges start
            // (`goaway_received` is set), and the reader proceeds.
            for id in state.streams.above(go_away.last_stream_id()) {
                if let Some(stream) = state.streams.get_mut(id) {
                    stream.apply_reset(Reason::REFUSED_STREAM);
                }
            }
            drop(state);
            shared.window_notify.notify_waiters();
        }

        Frame::PushPromise(push) => {
            // Server push is not surfaced; refuse the reserved stream.
            let reset = frame::Reset::new(push.promised_id(), Reason::CANCEL);
            let mut writer = shared.writer.lock().await;
            writer
                .write_reset(reset)
                .await
                .map_err(|_| Reason::INTERNAL_ERROR)?;
        }

        Frame::Priority(_) => {}
    }

    Ok(())
}

/// Peer committed a connection error: GOAWAY, then fail everything.
async fn connection_error(shared: &Arc<Shared>, reason: Reason) {
    warn!("h2 connection error; reason={}", reason);
    let last_good = {
        let state = shared.state.lock().unwrap();
        StreamId(state.next_stream_id.saturating_sub(2))
    };
    let frame = frame::GoAway::new(last_good, reason);
    {
        let mut writer = shared.writer.lock().await;
        let _ = writer.write_go_away(&frame).await;
        let _ = writer.shutdown().await;
    }
    fail_connection(shared, Closed::GoAway(reason));
}

/// Marks the connection dead and wakes every waiter.
pub(super) fn fail_connection(shared: &Arc<Shared>, closed: Closed) {
    let mut state = shared.state.lock().unwrap();
    if state.closed.is_none() {
        state.closed = Some(closed);
    }
    state.streams.for_each(|stream| {
        stream.notify.notify_waiters();
    });
    drop(state);
    shared.window_notify.notify_waiters();
}

async fn reset_stream_inbound(shared: &Arc<Shared>, id: StreamId, reason: Reason) {
    {
        let mut state = shared.state.lock().unwrap();
        if let Some(stream) = state.streams.get_mut(id) {
            stream.apply_reset(reason);
        }
    }
    let reset = frame::Reset::new(id, reason);
    let mut writer = shared.writer.lock().await;
    let _ = writer.write_reset(reset).await;
}

/// Credits the connection window for a dead stream's buffered bytes so
/// unrelated streams keep making progress. Returns a WINDOW_UPDATE
/// increment when the half-window threshold is crossed.
fn discard_buffered(state: &mut State, id: StreamId, conn_window: u32) -> Option<u32> {
    let freed = match state.streams.get_mut(id) {
        Some(stream) => {
            let freed = stream.buffered_flow;
            stream.recv_buf.clear();
            stream.buffered_flow = 0;
            freed
        }
        None => 0,
    };
    if freed == 0 {
        return None;
    }
    state.recv_unacked += freed;
    pending_conn_update(state, conn_window)
}

/// Connection-level WINDOW_UPDATE bookkeeping: send a refill once half the
/// window has been consumed.
fn pending_conn_update(state: &mut State, conn_window: u32) -> Option<u32> {
    if state.recv_unacked > conn_window / 2 {
        let increment = state.recv_unacked;
        state.recv_unacked = 0;
        if state.recv_flow.grow(increment).is_err() {
            return None;
        }
        Some(increment)
    } else {
        None
    }
}

async fn send_conn_window_update(shared: &Arc<Shared>, increment: u32) {
    let mut writer = shared.writer.lock().await;
    let _ = writer
        .write_window_update(StreamId::CONNECTION, increment)
        .await;
}

fn closed_error(closed: Closed) -> Error {
    match closed {
        Closed::Io(kind) => Error::new_io(io::Error::new(kind, "h2 connection failed")),
        // The peer violated the wire rules; that is never retriable.
        Closed::GoAway(reason) if reason == Reason::COMPRESSION_ERROR => Error::new_compression(),
        Closed::GoAway(reason) if reason != Reason::NO_ERROR => Error::new_frame(),
        Closed::GoAway(_) | Closed::Shutdown => Error::new_connection_closed(),
        Closed::Degraded => Error::new_stream_reset(Reason::PROTOCOL_ERROR),
    }
}

// ===== impl StreamExchange =====

/// One request/response pair multiplexed onto the connection.
pub(crate) struct StreamExchange {
    shared: Arc<Shared>,
    /// Shared with [`H2Cancel`] handles so a cancel can reach the stream
    /// after the exchange moved into a response body.
    id: Arc<Mutex<Option<StreamId>>>,
    local_closed: bool,
    /// Only the owning exchange reaps the stream; duplex writer clones
    /// must not.
    owns_stream: bool,
}

/// A clonable cancel handle for one HTTP/2 exchange.
#[derive(Clone)]
pub(crate) struct H2Cancel {
    shared: Arc<Shared>,
    id: Arc<Mutex<Option<StreamId>>>,
}

impl H2Cancel {
    /// Resets the stream with CANCEL, waking anything blocked on it.
    pub(crate) fn cancel(&self) {
        let id = match *self.id.lock().unwrap() {
            Some(id) => id,
            None => return,
        };
        reset_stream_local(&self.shared, id, Reason::CANCEL);
    }
}

/// Applies a local reset and spawns the RST_STREAM write.
fn reset_stream_local(shared: &Arc<Shared>, id: StreamId, reason: Reason) {
    let update = {
        let mut state = shared.state.lock().unwrap();
        match state.streams.get_mut(id) {
            Some(stream) if !stream.is_closed() => {
                stream.apply_reset(reason);
                discard_buffered(&mut state, id, shared.config.conn_window)
            }
            _ => return,
        }
    };
    shared.window_notify.notify_waiters();

    let shared = shared.clone();
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            {
                let mut writer = shared.writer.lock().await;
                let _ = writer.write_reset(frame::Reset::new(id, reason)).await;
            }
            if let Some(increment) = update {
                send_conn_window_update(&shared, increment).await;
            }
        });
    }
}

impl StreamExchange {
    pub(crate) async fn write_request_head(
        &mut self,
        head: RequestHead<'_>,
        end_stream: bool,
    ) -> Result<()> {
        debug_assert!(self.current_id().is_none(), "request head written twice");

        let (id, headers) = {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(closed) = state.closed {
                return Err(closed_error(closed));
            }
            if state.goaway_received.is_some() || state.goaway_sent {
                // Too late to open a stream here; retriable elsewhere.
                return Err(Error::new_stream_reset(Reason::REFUSED_STREAM));
            }
            if let Some(max) = state.peer_max_concurrent {
                if state.streams.len() as u32 >= max {
                    return Err(Error::new_stream_reset(Reason::REFUSED_STREAM));
                }
            }

            let id = StreamId(state.next_stream_id);
            state.next_stream_id += 2;

            let mut stream = Stream::new(
                id,
                state.peer_initial_window,
                self.shared.config.stream_window,
            );
            stream.local_closed = end_stream;
            state.streams.insert(stream);

            let mut pseudo = Pseudo::request(head.method.clone(), head.uri);
            if pseudo.authority.is_none() {
                pseudo.authority = head
                    .uri
                    .host()
                    .map(|h| Bytes::copy_from_slice(h.as_bytes()));
            }

            let mut fields = HeaderMap::with_capacity(head.headers.len());
            for (name, value) in head.headers.iter() {
                // Connection-specific headers do not survive HTTP/2.
                if is_connection_level(name) {
                    continue;
                }
                fields.append(name.clone(), value.clone());
            }

            let mut headers = frame::Headers::request(id, pseudo, fields);
            if end_stream {
                headers.set_end_stream();
            }
            (id, headers)
        };

        *self.id.lock().unwrap() = Some(id);
        self.local_closed = end_stream;
        trace!("opening stream; id={}", id);

        let write = async {
            let mut writer = self.shared.writer.lock().await;
            writer.write_headers(headers).await
        };
        match tokio::time::timeout(self.shared.config.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                fail_connection(&self.shared, Closed::Io(err.kind()));
                Err(Error::new_io(err))
            }
            Err(_) => Err(Error::new_timeout(TimeoutKind::Write)),
        }
    }

    pub(crate) async fn write_data(&mut self, mut chunk: Bytes, end_stream: bool) -> Result<()> {
        let id = self.current_id().expect("body before request head");

        loop {
            // Waiting on flow control is a suspension point; a concurrent
            // cancel resets the stream and the wait observes it.
            enum Step {
                Ready(usize),
                Wait,
            }

            let n = loop {
                let notified = self.shared.window_notify.notified();
                tokio::pin!(notified);

                let step = {
                    let mut state = self.shared.state.lock().unwrap();
                    if let Some(closed) = state.closed {
                        return Err(closed_error(closed));
                    }
                    let peer_max_frame = state.peer_max_frame;
                    let conn_available = state.send_flow.available();
                    let stream = match state.streams.get_mut(id) {
                        Some(stream) => stream,
                        None => return Err(Error::new_stream_reset(Reason::CANCEL)),
                    };
                    if let Some(reason) = stream.reset {
                        return Err(Error::new_stream_reset(reason));
                    }

                    let n = chunk
                        .len()
                        .min(conn_available as usize)
                        .min(stream.send_flow.available() as usize)
                        .min(peer_max_frame as usize);

                    if n > 0 || chunk.is_empty() {
                        if n > 0 {
                            stream.send_flow.shrink(n as u32).expect("checked available");
                            state.send_flow.shrink(n as u32).expect("checked available");
                        }
                        Step::Ready(n)
                    } else {
                        notified.as_mut().enable();
                        Step::Wait
                    }
                };

                match step {
                    Step::Ready(n) => break n,
                    Step::Wait => {
                        match tokio::time::timeout(self.shared.config.write_timeout, notified)
                            .await
                        {
                            Ok(()) => continue,
                            Err(_) => return Err(Error::new_timeout(TimeoutKind::Write)),
                        }
                    }
                }
            };

            let payload = chunk.split_to(n);
            let last = chunk.is_empty();
            let frame = frame::Data::new(id, payload, end_stream && last);

            let write = async {
                let mut writer = self.shared.writer.lock().await;
                writer.write_data(frame).await
            };
            match tokio::time::timeout(self.shared.config.write_timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    fail_connection(&self.shared, Closed::Io(err.kind()));
                    return Err(Error::new_io(err));
                }
                Err(_) => return Err(Error::new_timeout(TimeoutKind::Write)),
            }

            if last {
                if end_stream {
                    self.local_closed = true;
                    let mut state = self.shared.state.lock().unwrap();
                    if let Some(stream) = state.streams.get_mut(id) {
                        stream.local_closed = true;
                    }
                }
                return Ok(());
            }
        }
    }

    pub(crate) async fn finish_body(&mut self) -> Result<()> {
        if self.local_closed {
            return Ok(());
        }
        self.write_data(Bytes::new(), true).await
    }

    pub(crate) async fn read_response_head(&mut self) -> Result<ResponseHead> {
        let id = self.current_id().expect("response head before request head");

        let notify = {
            let mut state = self.shared.state.lock().unwrap();
            match state.streams.get_mut(id) {
                Some(stream) => stream.notify.clone(),
                None => return Err(Error::new_stream_reset(Reason::CANCEL)),
            }
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);

            {
                let mut state = self.shared.state.lock().unwrap();
                let closed = state.closed;
                let stream = match state.streams.get_mut(id) {
                    Some(stream) => stream,
                    None => return Err(Error::new_stream_reset(Reason::CANCEL)),
                };
                if let Some(head) = stream.heads.pop_front() {
                    return Ok(head);
                }
                if let Some(reason) = stream.reset {
                    return Err(Error::new_stream_reset(reason));
                }
                if let Some(closed) = closed {
                    return Err(closed_error(closed));
                }
                if stream.remote_closed {
                    return Err(Error::new_connection_closed());
                }

                // Arm the wakeup before releasing the lock, so a head
                // landing in between is not missed.
                notified.as_mut().enable();
            }

            match tokio::time::timeout(self.shared.config.read_timeout, notified).await {
                Ok(()) => continue,
                Err(_) => return Err(Error::new_timeout(TimeoutKind::Read)),
            }
        }
    }

    pub(crate) async fn read_data(&mut self) -> Result<Option<Bytes>> {
        let id = self.current_id().expect("body before request head");

        enum Step {
            Chunk(Bytes, Option<u32>, Option<u32>),
            Done(Result<Option<Bytes>>),
            Wait,
        }

        let notify = {
            let mut state = self.shared.state.lock().unwrap();
            match state.streams.get_mut(id) {
                Some(stream) => stream.notify.clone(),
                None => return Err(Error::new_stream_reset(Reason::CANCEL)),
            }
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);

            let step = {
                let mut state = self.shared.state.lock().unwrap();
                let closed = state.closed;
                let conn_window = self.shared.config.conn_window;
                let stream_window = self.shared.config.stream_window;

                let stream = match state.streams.get_mut(id) {
                    Some(stream) => stream,
                    None => return Err(Error::new_stream_reset(Reason::CANCEL)),
                };

                if let Some(chunk) = stream.recv_buf.pop_front() {
                    let flow_len = chunk.len() as u32;
                    stream.buffered_flow = stream.buffered_flow.saturating_sub(flow_len);
                    stream.recv_unacked += flow_len;

                    // Refill the stream window at the half-way mark.
                    let stream_update =
                        if !stream.remote_closed && stream.recv_unacked > stream_window / 2 {
                            let increment = stream.recv_unacked;
                            stream.recv_unacked = 0;
                            let _ = stream.recv_flow.grow(increment);
                            Some(increment)
                        } else {
                            None
                        };

                    state.recv_unacked += flow_len;
                    let conn_update = pending_conn_update(&mut state, conn_window);
                    Step::Chunk(chunk, stream_update, conn_update)
                } else if let Some(reason) = stream.reset {
                    Step::Done(Err(Error::new_stream_reset(reason)))
                } else if stream.remote_closed {
                    Step::Done(Ok(None))
                } else if let Some(closed) = closed {
                    Step::Done(Err(closed_error(closed)))
                } else {
                    // Arm the wakeup before releasing the lock, so a chunk
                    // landing in between is not missed.
                    notified.as_mut().enable();
                    Step::Wait
                }
            };

            let (chunk, stream_update, conn_update) = match step {
                Step::Chunk(chunk, stream_update, conn_update) => {
                    (chunk, stream_update, conn_update)
                }
                Step::Done(result) => return result,
                Step::Wait => {
                    match tokio::time::timeout(self.shared.config.read_timeout, notified).await {
                        Ok(()) => continue,
                        Err(_) => return Err(Error::new_timeout(TimeoutKind::Read)),
                    }
                }
            };

            if stream_update.is_some() || conn_update.is_some() {
                let mut writer = self.shared.writer.lock().await;
                if let Some(increment) = conn_update {
                    let _ = writer
                        .write_window_update(StreamId::CONNECTION, increment)
                        .await;
                }
                if let Some(increment) = stream_update {
                    let _ = writer.write_window_update(id, increment).await;
                }
            }
            return Ok(Some(chunk));
        }
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        let id = self.current_id()?;
        let mut state = self.shared.state.lock().unwrap();
        let stream = state.streams.get_mut(id)?;
        stream.trailers.take()
    }

    /// Resets the stream with CANCEL. Callable from any context.
    pub(crate) fn cancel(&self) {
        self.reset(Reason::CANCEL);
    }

    pub(crate) fn reset(&self, reason: Reason) {
        if let Some(id) = self.current_id() {
            reset_stream_local(&self.shared, id, reason);
        }
    }

    /// A non-owning handle for pumping a duplex request body while the
    /// owner reads the response.
    pub(crate) fn writer_clone(&self) -> StreamExchange {
        StreamExchange {
            shared: self.shared.clone(),
            id: self.id.clone(),
            local_closed: false,
            owns_stream: false,
        }
    }

    /// A cancel handle that stays valid wherever the exchange moves.
    pub(crate) fn cancel_handle(&self) -> H2Cancel {
        H2Cancel {
            shared: self.shared.clone(),
            id: self.id.clone(),
        }
    }

    fn current_id(&self) -> Option<StreamId> {
        *self.id.lock().unwrap()
    }

    /// The connection outlives the exchange; reuse is a property of the
    /// connection, checked by the pool.
    pub(crate) fn is_reusable(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.closed.is_none() && state.goaway_received.is_none()
    }

    /// Removes the stream from the store, resetting it first if either
    /// side is still open.
    pub(crate) fn release(&mut self) {
        if !self.owns_stream {
            return;
        }
        let id = match self.current_id() {
            Some(id) => id,
            None => return,
        };
        let open = {
            let mut state = self.shared.state.lock().unwrap();
            state
                .streams
                .get_mut(id)
                .map(|s| !s.is_closed())
                .unwrap_or(false)
        };
        if open {
            self.cancel();
        }
        let mut state = self.shared.state.lock().unwrap();
        state.streams.remove(id);
        *self.id.lock().unwrap() = None;
    }
}

impl Drop for StreamExchange {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_connection_level(name: &http::header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade" | "host"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::codec::{FramedRead, FramedWrite, PREFACE};
    use crate::proto::h2::hpack;
    use http::{HeaderMap as Fields, Method, StatusCode, Uri};
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf as TokioReadHalf, WriteHalf as TokioWriteHalf};

    struct Peer {
        reader: FramedRead<TokioReadHalf<DuplexStream>>,
        writer: FramedWrite<TokioWriteHalf<DuplexStream>>,
    }

    /// The scripted server half: consumes the preface and the client's
    /// SETTINGS, acks them, and sends an empty SETTINGS of its own.
    async fn accept(io: DuplexStream) -> Peer {
        let (mut read_half, write_half) = tokio::io::split(io);

        let mut preface = [0u8; 24];
        read_half.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface[..], PREFACE);

        let mut reader = FramedRead::new(read_half, DEFAULT_SETTINGS_HEADER_TABLE_SIZE);
        let mut writer = FramedWrite::new(write_half, DEFAULT_SETTINGS_HEADER_TABLE_SIZE);

        match reader.read_frame().await.unwrap().unwrap() {
            Frame::Settings(settings) => assert!(!settings.is_ack()),
            other => panic!("expected client SETTINGS, got {:?}", other),
        }
        writer.write_settings(&frame::Settings::ack()).await.unwrap();
        writer
            .write_settings(&frame::Settings::default())
            .await
            .unwrap();

        Peer { reader, writer }
    }

    impl Peer {
        /// Next frame that is not connection housekeeping.
        async fn next_frame(&mut self) -> Frame {
            loop {
                match self.reader.read_frame().await.unwrap().unwrap() {
                    Frame::Settings(s) if s.is_ack() => continue,
                    Frame::Settings(_) => {
                        self.writer
                            .write_settings(&frame::Settings::ack())
                            .await
                            .unwrap();
                    }
                    frame => return frame,
                }
            }
        }

        async fn respond(&mut self, stream_id: StreamId, status: StatusCode, end_stream: bool) {
            let mut pseudo = Pseudo::default();
            pseudo.status = Some(status);
            let mut headers = frame::Headers::request(stream_id, pseudo, Fields::new());
            if end_stream {
                headers.set_end_stream();
            }
            let mut encoder = hpack::Encoder::new(4096);
            let mut dst = bytes::BytesMut::new();
            headers.encode(&mut encoder, &mut dst, 16_384);
            self.writer_raw(&dst).await;
        }

        async fn writer_raw(&mut self, bytes: &[u8]) {
            use tokio::io::AsyncWriteExt;
            // Writes a pre-encoded frame image, bypassing the typed API.
            let io = self.writer.io_mut();
            io.write_all(bytes).await.unwrap();
            io.flush().await.unwrap();
        }
    }

    async fn connected(config: H2Config) -> (Connection, Peer) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(accept(server_io));
        let conn = Connection::handshake(BoxedIo::new(client_io), config)
            .await
            .unwrap();
        let mut peer = server.await.unwrap();
        // The client's initial connection WINDOW_UPDATE, if any.
        if DEFAULT_CONN_WINDOW > DEFAULT_INITIAL_WINDOW_SIZE {
            match peer.next_frame().await {
                Frame::WindowUpdate(update) => {
                    assert!(update.stream_id().is_connection());
                }
                other => panic!("expected WINDOW_UPDATE, got {:?}", other),
            }
        }
        (conn, peer)
    }

    fn get_head<'a>(method: &'a Method, uri: &'a Uri, headers: &'a Fields) -> RequestHead<'a> {
        RequestHead {
            method,
            uri,
            headers,
            absolute_form: false,
        }
    }

    #[tokio::test]
    async fn response_round_trip() {
        let (conn, mut peer) = connected(H2Config::default()).await;

        let mut exchange = conn.new_exchange();
        let method = Method::GET;
        let uri: Uri = "https://example.com/".parse().unwrap();
        let headers = Fields::new();
        exchange
            .write_request_head(get_head(&method, &uri, &headers), true)
            .await
            .unwrap();

        let stream_id = match peer.next_frame().await {
            Frame::Headers(h) => {
                assert!(h.is_end_stream());
                h.stream_id()
            }
            other => panic!("expected HEADERS, got {:?}", other),
        };
        assert_eq!(stream_id, StreamId(1));

        peer.respond(stream_id, StatusCode::OK, false).await;
        let mut dst = bytes::BytesMut::new();
        frame::Data::new(stream_id, Bytes::from_static(b"body"), true).encode(&mut dst);
        peer.writer_raw(&dst).await;

        let head = exchange.read_response_head().await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(&exchange.read_data().await.unwrap().unwrap()[..], b"body");
        assert!(exchange.read_data().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refused_stream_reset_surfaces_code() {
        let (conn, mut peer) = connected(H2Config::default()).await;

        let mut exchange = conn.new_exchange();
        let method = Method::GET;
        let uri: Uri = "https://example.com/".parse().unwrap();
        let headers = Fields::new();
        exchange
            .write_request_head(get_head(&method, &uri, &headers), true)
            .await
            .unwrap();

        let stream_id = match peer.next_frame().await {
            Frame::Headers(h) => h.stream_id(),
            other => panic!("expected HEADERS, got {:?}", other),
        };
        let mut dst = bytes::BytesMut::new();
        frame::Reset::new(stream_id, Reason::REFUSED_STREAM).encode(&mut dst);
        peer.writer_raw(&dst).await;

        let err = exchange.read_response_head().await.unwrap_err();
        assert_eq!(err.stream_reset_code(), Some(Reason::REFUSED_STREAM.into()));
    }

    #[tokio::test]
    async fn goaway_fails_streams_above_cutoff() {
        let (conn, mut peer) = connected(H2Config::default()).await;

        let method = Method::GET;
        let uri: Uri = "https://example.com/".parse().unwrap();
        let headers = Fields::new();

        let mut exchanges = Vec::new();
        for _ in 0..4 {
            let mut exchange = conn.new_exchange();
            exchange
                .write_request_head(get_head(&method, &uri, &headers), true)
                .await
                .unwrap();
            exchanges.push(exchange);
        }
        // Streams 1, 3, 5, 7 are open.
        for _ in 0..4 {
            match peer.next_frame().await {
                Frame::Headers(_) => {}
                other => panic!("expected HEADERS, got {:?}", other),
            }
        }

        let mut dst = bytes::BytesMut::new();
        frame::GoAway::new(StreamId(3), Reason::NO_ERROR).encode(&mut dst);
        peer.writer_raw(&dst).await;
        peer.respond(StreamId(1), StatusCode::OK, true).await;
        peer.respond(StreamId(3), StatusCode::OK, true).await;

        let head = exchanges[0].read_response_head().await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        let head = exchanges[1].read_response_head().await.unwrap();
        assert_eq!(head.status, StatusCode::OK);

        // Streams above the cutoff fail as refused, hence retriable on a
        // new connection.
        for exchange in exchanges.iter_mut().skip(2) {
            let err = exchange.read_response_head().await.unwrap_err();
            assert_eq!(err.stream_reset_code(), Some(Reason::REFUSED_STREAM.into()));
        }

        // And no new exchange may start.
        assert!(!conn.can_take_new_exchange());
    }

    #[tokio::test]
    async fn goaway_with_error_reason_keeps_low_streams_running() {
        let (conn, mut peer) = connected(H2Config::default()).await;

        let method = Method::GET;
        let uri: Uri = "https://example.com/".parse().unwrap();
        let headers = Fields::new();

        let mut exchanges = Vec::new();
        for _ in 0..2 {
            let mut exchange = conn.new_exchange();
            exchange
                .write_request_head(get_head(&method, &uri, &headers), true)
                .await
                .unwrap();
            exchanges.push(exchange);
        }
        // Streams 1 and 3 are open.
        for _ in 0..2 {
            match peer.next_frame().await {
                Frame::Headers(_) => {}
                other => panic!("expected HEADERS, got {:?}", other),
            }
        }

        // GOAWAY with an error code and cutoff 1: stream 3 is refused,
        // stream 1 keeps going on the same connection.
        let mut dst = bytes::BytesMut::new();
        frame::GoAway::new(StreamId(1), Reason::ENHANCE_YOUR_CALM).encode(&mut dst);
        peer.writer_raw(&dst).await;

        let err = exchanges[1].read_response_head().await.unwrap_err();
        assert_eq!(err.stream_reset_code(), Some(Reason::REFUSED_STREAM.into()));

        // The surviving stream still completes, body and all.
        peer.respond(StreamId(1), StatusCode::OK, false).await;
        let mut dst = bytes::BytesMut::new();
        frame::Data::new(StreamId(1), Bytes::from_static(b"still here"), true).encode(&mut dst);
        peer.writer_raw(&dst).await;

        let head = exchanges[0].read_response_head().await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(
            &exchanges[0].read_data().await.unwrap().unwrap()[..],
            b"still here"
        );
        assert!(exchanges[0].read_data().await.unwrap().is_none());

        // No new exchanges on this connection, but it was not failed.
        assert!(!conn.can_take_new_exchange());
    }

    #[tokio::test]
    async fn data_respects_peer_window_and_max_frame() {
        let (conn, mut peer) = connected(H2Config::default()).await;

        // Shrink the client's send window to 4 bytes: a raw SETTINGS
        // frame with INITIAL_WINDOW_SIZE (id 4) = 4.
        use bytes::BufMut;
        let mut settings_dst = bytes::BytesMut::new();
        frame::Head::new(frame::Kind::Settings, 0, StreamId::CONNECTION)
            .encode(6, &mut settings_dst);
        settings_dst.put_u16(4);
        settings_dst.put_u32(4);
        peer.writer_raw(&settings_dst).await;

        // Give the settings a moment to apply before opening the stream.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut exchange = conn.new_exchange();
        let method = Method::POST;
        let uri: Uri = "https://example.com/upload".parse().unwrap();
        let headers = Fields::new();
        exchange
            .write_request_head(get_head(&method, &uri, &headers), false)
            .await
            .unwrap();

        let writer_task = {
            let mut writer = exchange.writer_clone();
            tokio::spawn(async move { writer.write_data(Bytes::from_static(b"12345678"), true).await })
        };

        let mut received = Vec::new();
        let mut frames = 0;
        while received.len() < 8 {
            match peer.next_frame().await {
                Frame::Headers(_) => continue,
                Frame::Data(data) => {
                    assert!(data.payload().len() <= 4);
                    frames += 1;
                    received.extend_from_slice(data.payload());
                    // Pace the writer with stream and connection credit.
                    let mut dst = bytes::BytesMut::new();
                    frame::WindowUpdate::new(data.stream_id(), 4).encode(&mut dst);
                    frame::WindowUpdate::new(StreamId::CONNECTION, 4).encode(&mut dst);
                    peer.writer_raw(&dst).await;
                }
                Frame::WindowUpdate(_) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }

        assert_eq!(&received[..], b"12345678");
        assert!(frames >= 2, "a tiny window must split the body");
        writer_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn push_promise_is_reset_with_cancel() {
        let (conn, mut peer) = connected(H2Config::default()).await;

        let mut exchange = conn.new_exchange();
        let method = Method::GET;
        let uri: Uri = "https://example.com/".parse().unwrap();
        let headers = Fields::new();
        exchange
            .write_request_head(get_head(&method, &uri, &headers), true)
            .await
            .unwrap();
        let stream_id = match peer.next_frame().await {
            Frame::Headers(h) => h.stream_id(),
            other => panic!("expected HEADERS, got {:?}", other),
        };

        // PUSH_PROMISE for stream 2 with an empty header block.
        use bytes::BufMut;
        let mut dst = bytes::BytesMut::new();
        frame::Head::new(frame::Kind::PushPromise, 0x4, stream_id).encode(4, &mut dst);
        dst.put_u32(2);
        peer.writer_raw(&dst).await;

        match peer.next_frame().await {
            Frame::Reset(reset) => {
                assert_eq!(reset.stream_id(), StreamId(2));
                assert_eq!(reset.reason(), Reason::CANCEL);
            }
            other => panic!("expected RST_STREAM for the push, got {:?}", other),
        }

        peer.respond(stream_id, StatusCode::OK, true).await;
        assert_eq!(
            exchange.read_response_head().await.unwrap().status,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn discarded_stream_credits_connection_window() {
        // A small advertised connection window makes the refill
        // observable with little data.
        let config = H2Config {
            conn_window: 64,
            stream_window: 64,
            ..H2Config::default()
        };
        let (conn, mut peer) = {
            let (client_io, server_io) = tokio::io::duplex(256 * 1024);
            let server = tokio::spawn(accept(server_io));
            let conn = Connection::handshake(BoxedIo::new(client_io), config)
                .await
                .unwrap();
            (conn, server.await.unwrap())
        };

        let mut exchange = conn.new_exchange();
        let method = Method::GET;
        let uri: Uri = "https://example.com/".parse().unwrap();
        let headers = Fields::new();
        exchange
            .write_request_head(get_head(&method, &uri, &headers), true)
            .await
            .unwrap();
        let stream_id = match peer.next_frame().await {
            Frame::Headers(h) => h.stream_id(),
            other => panic!("expected HEADERS, got {:?}", other),
        };

        // 40 buffered bytes the client will never read.
        peer.respond(stream_id, StatusCode::OK, false).await;
        let mut dst = bytes::BytesMut::new();
        frame::Data::new(stream_id, Bytes::from(vec![0u8; 40]), false).encode(&mut dst);
        peer.writer_raw(&dst).await;

        let _ = exchange.read_response_head().await.unwrap();
        exchange.cancel();

        // The discard must credit the connection window even though the
        // stream never delivered the bytes.
        loop {
            match peer.next_frame().await {
                Frame::WindowUpdate(update) if update.stream_id().is_connection() => {
                    assert_eq!(update.increment(), 40);
                    break;
                }
                Frame::Reset(_) | Frame::WindowUpdate(_) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_pings_degrade_and_fail() {
        let config = H2Config {
            ping_interval: Some(std::time::Duration::from_millis(100)),
            ..H2Config::default()
        };
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(accept(server_io));
        let conn = Connection::handshake(BoxedIo::new(client_io), config)
            .await
            .unwrap();
        let mut peer = server.await.unwrap();

        assert!(conn.is_healthy());

        // The peer reads the ping but never acks. One interval marks the
        // connection degraded, the grace window fails it.
        match peer.next_frame().await {
            Frame::WindowUpdate(_) => match peer.next_frame().await {
                Frame::Ping(ping) => assert!(!ping.is_ack()),
                other => panic!("expected PING, got {:?}", other),
            },
            Frame::Ping(ping) => assert!(!ping.is_ack()),
            other => panic!("expected PING, got {:?}", other),
        }

        let mut waited = 0;
        while conn.is_healthy() && waited < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            waited += 1;
        }
        assert!(!conn.is_healthy());
    }
}
