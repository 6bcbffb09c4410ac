//! The immutable response record and its consume-once body.

use std::fmt;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue};
use http::StatusCode;

use crate::config::Protocol;
use crate::connect::tls::Handshake;
use crate::decoder::GzipDecoder;
use crate::error::{Error, Result};
use crate::exchange::BodyReader;
use crate::request::Request;
use crate::upgrade::Upgraded;

/// An HTTP response.
///
/// The body streams from the connection and is consumed at most once;
/// closing (dropping) it releases the underlying exchange.
pub struct Response {
    status: StatusCode,
    reason: Option<Bytes>,
    protocol: Protocol,
    headers: HeaderMap,
    body: ResponseBody,
    handshake: Option<Handshake>,
    sent_at: Instant,
    received_at: Instant,
    /// The request that produced this response, after engine rewrites.
    request: Request,
    /// Redirects and auth retries that led here, most recent first.
    prior_response: Option<Box<Response>>,
    upgrade: Option<Upgraded>,
}

pub(crate) struct ResponseParts {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<Bytes>,
    pub(crate) protocol: Protocol,
    pub(crate) headers: HeaderMap,
    pub(crate) body: ResponseBody,
    pub(crate) handshake: Option<Handshake>,
    pub(crate) sent_at: Instant,
    pub(crate) received_at: Instant,
    pub(crate) request: Request,
    pub(crate) upgrade: Option<Upgraded>,
}

impl Response {
    pub(crate) fn from_parts(parts: ResponseParts) -> Response {
        Response {
            status: parts.status,
            reason: parts.reason,
            protocol: parts.protocol,
            headers: parts.headers,
            body: parts.body,
            handshake: parts.handshake,
            sent_at: parts.sent_at,
            received_at: parts.received_at,
            request: parts.request,
            prior_response: None,
            upgrade: parts.upgrade,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The reason phrase as received. HTTP/2 responses have none; HTTP/1
    /// responses fall back to the canonical phrase for the code.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The request that produced this response, including engine-added
    /// headers.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The response that triggered the follow-up leading here.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    pub(crate) fn set_prior_response(&mut self, prior: Response) {
        self.prior_response = Some(Box::new(prior));
    }

    /// How many responses precede this one in the follow-up chain.
    pub fn prior_response_count(&self) -> usize {
        let mut count = 0;
        let mut at = self.prior_response.as_deref();
        while let Some(prior) = at {
            count += 1;
            at = prior.prior_response.as_deref();
        }
        count
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Consumes the body into one buffer.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        self.body.bytes().await
    }

    /// Consumes the body as UTF-8 text.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::new_unreadable_body().with(e))
    }

    /// Trailers, once the body has been fully consumed.
    pub fn trailers(&mut self) -> Result<Option<HeaderMap>> {
        self.body.trailers()
    }

    /// For 101 responses: the raw bidirectional stream.
    pub fn take_upgrade(&mut self) -> Option<Upgraded> {
        self.upgrade.take()
    }

    /// Strips the consumable state for storage in a prior-response chain.
    pub(crate) fn into_prior(mut self) -> Response {
        self.body = ResponseBody::unreadable();
        self.upgrade = None;
        self
    }

    /// Routes the body through the gzip decoder, dropping the framing
    /// headers that no longer describe what the caller will read.
    pub(crate) fn into_inflated(mut self) -> Response {
        let body = std::mem::replace(&mut self.body, ResponseBody::unreadable());
        self.body = body.into_gzip();
        self.headers.remove(http::header::CONTENT_ENCODING);
        self.headers.remove(http::header::CONTENT_LENGTH);
        self
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("protocol", &self.protocol)
            .field("headers", &self.headers)
            .finish()
    }
}

/// A consume-once response body.
pub struct ResponseBody {
    kind: BodyKind,
    /// Trailers rescued before the reader is discarded.
    stashed_trailers: Option<HeaderMap>,
}

enum BodyKind {
    Empty,
    Full(Option<Bytes>),
    Stream(BodyReader),
    Gzip {
        inner: BodyReader,
        decoder: GzipDecoder,
        /// Plaintext decoded ahead of what the caller consumed.
        ready: std::collections::VecDeque<Bytes>,
        done: bool,
    },
    /// A body made unreadable by prior-response rehydration.
    Unreadable,
}

impl ResponseBody {
    pub(crate) fn empty() -> ResponseBody {
        ResponseBody {
            kind: BodyKind::Empty,
            stashed_trailers: None,
        }
    }

    pub(crate) fn full(bytes: Bytes) -> ResponseBody {
        ResponseBody {
            kind: BodyKind::Full(Some(bytes)),
            stashed_trailers: None,
        }
    }

    pub(crate) fn stream(reader: BodyReader) -> ResponseBody {
        ResponseBody {
            kind: BodyKind::Stream(reader),
            stashed_trailers: None,
        }
    }

    pub(crate) fn gzip(reader: BodyReader) -> ResponseBody {
        ResponseBody {
            kind: BodyKind::Gzip {
                inner: reader,
                decoder: GzipDecoder::new(),
                ready: std::collections::VecDeque::new(),
                done: false,
            },
            stashed_trailers: None,
        }
    }

    pub(crate) fn unreadable() -> ResponseBody {
        ResponseBody {
            kind: BodyKind::Unreadable,
            stashed_trailers: None,
        }
    }

    /// Wraps a streamed body in the gzip decoder; other kinds pass
    /// through unchanged.
    pub(crate) fn into_gzip(self) -> ResponseBody {
        match self.kind {
            BodyKind::Stream(reader) => ResponseBody::gzip(reader),
            kind => ResponseBody {
                kind,
                stashed_trailers: self.stashed_trailers,
            },
        }
    }

    /// The next chunk, or `None` at the end of the body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match self.kind {
            BodyKind::Empty => Ok(None),
            BodyKind::Full(ref mut bytes) => Ok(bytes.take().filter(|b| !b.is_empty())),
            BodyKind::Stream(ref mut reader) => reader.chunk().await,
            BodyKind::Gzip {
                ref mut inner,
                ref mut decoder,
                ref mut ready,
                ref mut done,
            } => loop {
                if let Some(chunk) = ready.pop_front() {
                    return Ok(Some(chunk));
                }
                if *done {
                    return Ok(None);
                }
                match inner.chunk().await? {
                    Some(compressed) => {
                        ready.extend(decoder.decode(&compressed)?);
                    }
                    None => {
                        *done = true;
                        if !decoder.is_done() {
                            return Err(Error::new_connection_closed());
                        }
                    }
                }
            },
            BodyKind::Unreadable => Err(Error::new_unreadable_body()),
        }
    }

    /// Consumes the whole body into one buffer. A second call fails with
    /// an unreadable-body error.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        match self.kind {
            BodyKind::Unreadable => return Err(Error::new_unreadable_body()),
            BodyKind::Empty => {
                self.kind = BodyKind::Unreadable;
                return Ok(Bytes::new());
            }
            _ => (),
        }

        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        self.stash_trailers();
        self.kind = BodyKind::Unreadable;
        Ok(out.freeze())
    }

    fn stash_trailers(&mut self) {
        let reader = match self.kind {
            BodyKind::Stream(ref mut reader) => reader,
            BodyKind::Gzip { ref mut inner, .. } => inner,
            _ => return,
        };
        if reader.is_complete() {
            self.stashed_trailers = reader.take_trailers();
        }
    }

    pub(crate) fn trailers(&mut self) -> Result<Option<HeaderMap>> {
        if let Some(trailers) = self.stashed_trailers.take() {
            return Ok(Some(trailers));
        }
        match self.kind {
            BodyKind::Stream(ref mut reader) => {
                if !reader.is_complete() {
                    return Err(Error::new_unreadable_body());
                }
                Ok(reader.take_trailers())
            }
            BodyKind::Gzip { ref mut inner, .. } => {
                if !inner.is_complete() {
                    return Err(Error::new_unreadable_body());
                }
                Ok(inner.take_trailers())
            }
            _ => Ok(None),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            BodyKind::Empty => "Empty",
            BodyKind::Full(_) => "Full",
            BodyKind::Stream(_) => "Stream",
            BodyKind::Gzip { .. } => "Gzip",
            BodyKind::Unreadable => "Unreadable",
        };
        f.debug_tuple("ResponseBody").field(&kind).finish()
    }
}
