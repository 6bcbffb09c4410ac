//! Wire protocol engines.
//!
//! The HTTP/1 and HTTP/2 engines expose the same capability set — write
//! request head, stream request body, read response head, stream response
//! body, cancel — through the [`Codec`] sum type; the call layer treats
//! them uniformly.

use bytes::Bytes;
use http::header::HeaderMap;
use http::{Method, StatusCode, Uri};

use crate::error::Result;

pub(crate) mod h1;
pub(crate) mod h2;

/// A parsed response head, before any body bytes.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    /// The reason phrase exactly as received; HTTP/2 has none.
    pub(crate) reason: Option<Bytes>,
    pub(crate) headers: HeaderMap,
}

impl ResponseHead {
    pub(crate) fn is_informational(&self) -> bool {
        self.status.is_informational()
    }
}

/// The request head handed to a codec, plus the form the target should be
/// written in (HTTP/1 proxies see the absolute URI).
pub(crate) struct RequestHead<'a> {
    pub(crate) method: &'a Method,
    pub(crate) uri: &'a Uri,
    pub(crate) headers: &'a HeaderMap,
    pub(crate) absolute_form: bool,
}

/// One in-flight exchange's protocol engine.
pub(crate) enum Codec {
    H1(h1::H1Exchange),
    H2(h2::connection::StreamExchange),
}

impl Codec {
    /// Writes the request head. With `end_stream` the request has no body.
    pub(crate) async fn write_request_head(
        &mut self,
        head: RequestHead<'_>,
        end_stream: bool,
    ) -> Result<()> {
        match self {
            Codec::H1(h1) => h1.write_request_head(head, end_stream).await,
            Codec::H2(h2) => h2.write_request_head(head, end_stream).await,
        }
    }

    /// Writes one body chunk; `end_stream` marks the last.
    pub(crate) async fn write_data(&mut self, chunk: Bytes, end_stream: bool) -> Result<()> {
        match self {
            Codec::H1(h1) => h1.write_data(chunk, end_stream).await,
            Codec::H2(h2) => h2.write_data(chunk, end_stream).await,
        }
    }

    /// Finishes a body without a final chunk.
    pub(crate) async fn finish_body(&mut self) -> Result<()> {
        match self {
            Codec::H1(h1) => h1.finish_body().await,
            Codec::H2(h2) => h2.finish_body().await,
        }
    }

    /// The next response head. Informational responses are surfaced one at
    /// a time; the caller decides whether to skip or act on them.
    pub(crate) async fn read_response_head(&mut self) -> Result<ResponseHead> {
        match self {
            Codec::H1(h1) => h1.read_response_head().await,
            Codec::H2(h2) => h2.read_response_head().await,
        }
    }

    /// The next body chunk, or `None` at the end of the body.
    pub(crate) async fn read_data(&mut self) -> Result<Option<Bytes>> {
        match self {
            Codec::H1(h1) => h1.read_data().await,
            Codec::H2(h2) => h2.read_data().await,
        }
    }

    /// Trailers, available once `read_data` returned `None`.
    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        match self {
            Codec::H1(h1) => h1.take_trailers(),
            Codec::H2(h2) => h2.take_trailers(),
        }
    }

    /// Tears the exchange down: HTTP/2 resets the stream with CANCEL,
    /// HTTP/1 poisons the connection so it cannot be pooled.
    pub(crate) fn cancel(&self) {
        match self {
            Codec::H1(h1) => h1.cancel(),
            Codec::H2(h2) => h2.cancel(),
        }
    }

    /// Whether the transport may carry another exchange after this one.
    pub(crate) fn is_reusable(&self) -> bool {
        match self {
            Codec::H1(h1) => h1.is_reusable(),
            Codec::H2(h2) => h2.is_reusable(),
        }
    }
}
