//! Per-stream state and the connection's stream store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use slab::Slab;
use tokio::sync::Notify;

use crate::proto::h2::flow::FlowControl;
use crate::proto::h2::frame::{Reason, StreamId};
use crate::proto::ResponseHead;

/// Stream lifecycle: IDLE streams are not stored; insertion opens them.
///
/// `local_closed` and `remote_closed` cover the two half-closed states;
/// both set means CLOSED and the slot is reaped once the reader drains it.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,

    /// Our permission to send, replenished by peer WINDOW_UPDATEs.
    pub(crate) send_flow: FlowControl,

    /// What we advertised to the peer for this stream.
    pub(crate) recv_flow: FlowControl,

    /// Bytes consumed by the reader but not yet returned to the peer via
    /// WINDOW_UPDATE.
    pub(crate) recv_unacked: u32,

    /// Response heads in arrival order; informational responses queue ahead
    /// of the final response.
    pub(crate) heads: VecDeque<ResponseHead>,

    /// Buffered DATA payloads not yet taken by the reader.
    pub(crate) recv_buf: VecDeque<Bytes>,

    /// Flow-controlled size of `recv_buf` plus padding, still charged
    /// against the connection window.
    pub(crate) buffered_flow: u32,

    pub(crate) trailers: Option<HeaderMap>,

    /// We sent END_STREAM.
    pub(crate) local_closed: bool,

    /// Peer sent END_STREAM.
    pub(crate) remote_closed: bool,

    /// Reset code, peer-sent or locally applied. Terminal.
    pub(crate) reset: Option<Reason>,

    /// Wakes any task blocked on this stream's heads, data, or trailers.
    pub(crate) notify: Arc<Notify>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, send_window: u32, recv_window: u32) -> Stream {
        Stream {
            id,
            send_flow: FlowControl::new(send_window),
            recv_flow: FlowControl::new(recv_window),
            recv_unacked: 0,
            heads: VecDeque::new(),
            recv_buf: VecDeque::new(),
            buffered_flow: 0,
            trailers: None,
            local_closed: false,
            remote_closed: false,
            reset: None,
            notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.reset.is_some() || (self.local_closed && self.remote_closed)
    }

    /// Applies a reset and wakes waiters. Buffered data is discarded by the
    /// caller so the connection window can be credited.
    pub(crate) fn apply_reset(&mut self, reason: Reason) {
        if self.reset.is_none() {
            self.reset = Some(reason);
        }
        self.notify.notify_waiters();
    }
}

/// The stream store: a slab of live streams indexed by stream id.
#[derive(Debug, Default)]
pub(crate) struct Store {
    slab: Slab<Stream>,
    ids: HashMap<StreamId, usize>,
}

impl Store {
    pub(crate) fn insert(&mut self, stream: Stream) {
        let id = stream.id;
        let key = self.slab.insert(stream);
        self.ids.insert(id, key);
    }

    pub(crate) fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        let key = *self.ids.get(&id)?;
        self.slab.get_mut(key)
    }

    pub(crate) fn remove(&mut self, id: StreamId) -> Option<Stream> {
        let key = self.ids.remove(&id)?;
        Some(self.slab.remove(key))
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub(crate) fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Stream),
    {
        for (_, stream) in self.slab.iter_mut() {
            f(stream);
        }
    }

    /// Streams with ids above the GOAWAY cutoff, in no particular order.
    pub(crate) fn above(&self, last_stream_id: StreamId) -> Vec<StreamId> {
        self.ids
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_insert_lookup_remove() {
        let mut store = Store::default();
        store.insert(Stream::new(StreamId(1), 65_535, 65_535));
        store.insert(Stream::new(StreamId(3), 65_535, 65_535));

        assert_eq!(store.len(), 2);
        assert!(store.get_mut(StreamId(1)).is_some());
        assert!(store.get_mut(StreamId(5)).is_none());

        let removed = store.remove(StreamId(1)).unwrap();
        assert_eq!(removed.id, StreamId(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn above_goaway_cutoff() {
        let mut store = Store::default();
        for id in [1u32, 3, 5, 7] {
            store.insert(Stream::new(StreamId(id), 65_535, 65_535));
        }
        let mut above = store.above(StreamId(3));
        above.sort();
        assert_eq!(above, [StreamId(5), StreamId(7)]);
    }

    #[test]
    fn reset_is_terminal_and_sticky() {
        let mut stream = Stream::new(StreamId(1), 65_535, 65_535);
        stream.apply_reset(Reason::REFUSED_STREAM);
        stream.apply_reset(Reason::CANCEL);
        assert_eq!(stream.reset, Some(Reason::REFUSED_STREAM));
        assert!(stream.is_closed());
    }
}
