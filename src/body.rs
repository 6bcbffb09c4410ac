//! Request bodies.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_channel::mpsc;
use futures_core::Stream;
use futures_util::future::poll_fn;
use futures_util::StreamExt;

use crate::error::{Error, Result};

type BoxStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A request body.
///
/// Bodies built from in-memory bytes are replayable and may be re-sent on
/// retries and follow-ups. Channel-backed bodies are one-shot: once their
/// chunks have been taken they cannot be produced again, so the retry engine
/// refuses to replay them.
#[derive(Clone)]
pub struct Body {
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Full(Bytes),
    Channel {
        rx: Arc<Mutex<Option<mpsc::Receiver<Result<Bytes>>>>>,
        length: Option<u64>,
        duplex: bool,
    },
    Streamed {
        stream: Arc<Mutex<Option<BoxStream>>>,
        length: Option<u64>,
    },
}

/// Write half of a channel-backed body.
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl Body {
    /// An empty, replayable body.
    pub fn empty() -> Body {
        Body {
            kind: Kind::Full(Bytes::new()),
        }
    }

    /// A streaming one-shot body with an optional known length.
    ///
    /// A `None` length is sent chunked over HTTP/1.
    pub fn channel(length: Option<u64>) -> (BodySender, Body) {
        Body::streaming(length, false)
    }

    /// A duplex body: the caller keeps writing while the response streams.
    ///
    /// Only valid over HTTP/2; an HTTP/1 exchange rejects it.
    pub fn duplex() -> (BodySender, Body) {
        Body::streaming(None, true)
    }

    fn streaming(length: Option<u64>, duplex: bool) -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(8);
        let body = Body {
            kind: Kind::Channel {
                rx: Arc::new(Mutex::new(Some(rx))),
                length,
                duplex,
            },
        };
        (BodySender { tx }, body)
    }

    /// A one-shot body fed by a stream of chunks.
    pub fn wrap_stream<S>(stream: S, length: Option<u64>) -> Body
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Body {
            kind: Kind::Streamed {
                stream: Arc::new(Mutex::new(Some(Box::pin(stream)))),
                length,
            },
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, Kind::Channel { .. } | Kind::Streamed { .. })
    }

    pub fn is_duplex(&self) -> bool {
        matches!(self.kind, Kind::Channel { duplex: true, .. })
    }

    /// The length to advertise, when known up front.
    pub fn content_length(&self) -> Option<u64> {
        match self.kind {
            Kind::Full(ref bytes) => Some(bytes.len() as u64),
            Kind::Channel { length, .. } | Kind::Streamed { length, .. } => length,
        }
    }

    /// Takes the chunk source for writing this body out.
    ///
    /// Returns `None` for a one-shot body whose source was already taken.
    pub(crate) fn into_chunks(self) -> Option<BodyChunks> {
        match self.kind {
            Kind::Full(bytes) => Some(BodyChunks::Full(Some(bytes))),
            Kind::Channel { rx, .. } => {
                let rx = rx.lock().unwrap().take()?;
                Some(BodyChunks::Channel(rx))
            }
            Kind::Streamed { stream, .. } => {
                let stream = stream.lock().unwrap().take()?;
                Some(BodyChunks::Streamed(stream))
            }
        }
    }

    /// Whether this body can still be written out (again).
    pub(crate) fn is_replayable(&self) -> bool {
        match self.kind {
            Kind::Full(_) => true,
            Kind::Channel { ref rx, .. } => rx.lock().unwrap().is_some(),
            Kind::Streamed { ref stream, .. } => stream.lock().unwrap().is_some(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body {
            kind: Kind::Full(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Full(ref bytes) => f.debug_tuple("Body").field(&bytes.len()).finish(),
            Kind::Channel { duplex, .. } => f
                .debug_struct("Body")
                .field("streaming", &true)
                .field("duplex", &duplex)
                .finish(),
            Kind::Streamed { .. } => f
                .debug_struct("Body")
                .field("streaming", &true)
                .field("duplex", &false)
                .finish(),
        }
    }
}

impl BodySender {
    /// Sends one chunk, waiting for channel capacity.
    pub async fn send(&mut self, chunk: Bytes) -> Result<()> {
        poll_fn(|cx| self.tx.poll_ready(cx))
            .await
            .map_err(|_| Error::new_closed())?;
        self.tx
            .start_send(Ok(chunk))
            .map_err(|_| Error::new_closed())
    }

    /// Aborts the body; the exchange fails with the given error.
    pub async fn abort(mut self, err: Error) {
        if poll_fn(|cx| self.tx.poll_ready(cx)).await.is_ok() {
            let _ = self.tx.start_send(Err(err));
        }
    }
}

pub(crate) enum BodyChunks {
    Full(Option<Bytes>),
    Channel(mpsc::Receiver<Result<Bytes>>),
    Streamed(BoxStream),
}

impl BodyChunks {
    /// The next chunk, or `None` at the end of the body.
    pub(crate) async fn next(&mut self) -> Result<Option<Bytes>> {
        let next = match self {
            BodyChunks::Full(bytes) => return Ok(bytes.take().filter(|b| !b.is_empty())),
            BodyChunks::Channel(rx) => rx.next().await,
            BodyChunks::Streamed(stream) => stream.next().await,
        };
        match next {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}
