//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use crate::proto::h2::frame::Reason;

/// Result type often returned from methods that can have courier `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while executing a call.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    /// Failures on earlier routes of the same call, kept for diagnosis.
    suppressed: Vec<Error>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The peer violated the wire protocol. Never retriable.
    Parse(Parse),
    /// A multiplexed stream was reset, locally or by the peer.
    StreamReset(Reason),
    /// The underlying socket reached EOF mid-exchange.
    ConnectionClosed,
    /// One of the configured deadlines expired.
    Timeout(TimeoutKind),
    /// TLS handshake or certification failure.
    Tls,
    /// The user requested cancellation, or a deadline canceled the call.
    Canceled,
    /// Addressing or routing failure; the message names the addresses tried.
    Connect,
    /// A response body was read more than once, or after rehydration.
    UnreadableBody,
    /// The follow-up cap was exceeded.
    TooManyFollowUps(u32),
    /// An `io::Error` on a network stream.
    Io,
    /// An internal channel closed before its message was delivered.
    ChannelClosed,
    /// The caller misused the API.
    User(User),
}

#[derive(Debug)]
pub(crate) enum Parse {
    StatusLine,
    Version,
    Header,
    ContentLength,
    TransferEncoding,
    /// Status line or header block over the size cap.
    TooLarge,
    /// An HTTP/2 frame violated its framing rules.
    Frame,
    /// HPACK decoding failed.
    Compression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    Call,
    Connect,
    Read,
    Write,
}

#[derive(Debug)]
pub(crate) enum User {
    /// A duplex request body was used over HTTP/1.
    DuplexNotSupported,
    /// Request URI scheme was not http or https.
    UnsupportedScheme,
    /// A one-shot request body was needed a second time.
    BodyNotReplayable,
    /// The call was executed twice.
    AlreadyExecuted,
    /// The dispatcher was shut down before the call could run.
    ExecutorShutdown,
}

// Sentinel type placed in the cause chain by deadline expiry.
#[derive(Debug)]
pub(crate) struct TimedOut(pub(crate) TimeoutKind);

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Attach a failure from a previous route attempt.
    pub(crate) fn with_suppressed(mut self, prior: Error) -> Error {
        self.inner.suppressed.push(prior);
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// Returns true if the peer or this engine violated the wire protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if a multiplexed stream was reset.
    pub fn is_stream_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamReset(_))
    }

    /// The HTTP/2 error code carried by a stream reset, if any.
    pub fn stream_reset_code(&self) -> Option<u32> {
        match self.inner.kind {
            Kind::StreamReset(reason) => Some(reason.into()),
            _ => None,
        }
    }

    /// Returns true if the socket closed before the exchange completed.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionClosed)
    }

    /// Returns true if any of the configured deadlines expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_)) || self.find_source::<TimedOut>().is_some()
    }

    /// Returns true if this was a TLS handshake or certification failure.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if this was an addressing or routing failure.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if a response body was consumed more than once.
    pub fn is_unreadable_body(&self) -> bool {
        matches!(self.inner.kind, Kind::UnreadableBody)
    }

    /// Failures from routes tried before the one that produced this error.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Cause> {
        self.inner.cause
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }

    pub(crate) fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self.inner.kind {
            Kind::Timeout(kind) => Some(kind),
            _ => self.find_source::<TimedOut>().map(|t| t.0),
        }
    }

    // Constructors used throughout the engine.

    pub(crate) fn new_status_line() -> Error {
        Error::new(Kind::Parse(Parse::StatusLine))
    }

    pub(crate) fn new_version() -> Error {
        Error::new(Kind::Parse(Parse::Version))
    }

    pub(crate) fn new_header() -> Error {
        Error::new(Kind::Parse(Parse::Header))
    }

    pub(crate) fn new_content_length() -> Error {
        Error::new(Kind::Parse(Parse::ContentLength))
    }

    pub(crate) fn new_transfer_encoding() -> Error {
        Error::new(Kind::Parse(Parse::TransferEncoding))
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_frame() -> Error {
        Error::new(Kind::Parse(Parse::Frame))
    }

    pub(crate) fn new_compression() -> Error {
        Error::new(Kind::Parse(Parse::Compression))
    }

    pub(crate) fn new_stream_reset(reason: Reason) -> Error {
        Error::new(Kind::StreamReset(reason))
    }

    pub(crate) fn new_connection_closed() -> Error {
        Error::new(Kind::ConnectionClosed)
    }

    pub(crate) fn new_timeout(kind: TimeoutKind) -> Error {
        Error::new(Kind::Timeout(kind)).with(TimedOut(kind))
    }

    pub(crate) fn new_tls<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_unreadable_body() -> Error {
        Error::new(Kind::UnreadableBody)
    }

    pub(crate) fn new_too_many_follow_ups(count: u32) -> Error {
        Error::new(Kind::TooManyFollowUps(count))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_user_duplex() -> Error {
        Error::new(Kind::User(User::DuplexNotSupported))
    }

    pub(crate) fn new_user_scheme() -> Error {
        Error::new(Kind::User(User::UnsupportedScheme))
    }

    pub(crate) fn new_user_body_not_replayable() -> Error {
        Error::new(Kind::User(User::BodyNotReplayable))
    }

    pub(crate) fn new_user_already_executed() -> Error {
        Error::new(Kind::User(User::AlreadyExecuted))
    }

    pub(crate) fn new_executor_shutdown() -> Error {
        Error::new(Kind::User(User::ExecutorShutdown))
    }

    /// Wraps a collaborator failure as a TLS handshake error. For
    /// [`TlsConnector`](crate::connect::tls::TlsConnector) implementations.
    pub fn tls<E: Into<Cause>>(cause: E) -> Error {
        Error::new_tls(cause)
    }

    /// Wraps a collaborator failure as an addressing/connect error. For
    /// [`Dns`](crate::collab::Dns) implementations.
    pub fn connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new_connect(cause)
    }

    /// The error's standalone message, without the message from the cause.
    pub fn message(&self) -> impl fmt::Display + '_ {
        Description(self)
    }

    fn description(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Parse(Parse::StatusLine) => f.write_str("invalid HTTP status line"),
            Kind::Parse(Parse::Version) => f.write_str("invalid HTTP version"),
            Kind::Parse(Parse::Header) => f.write_str("invalid HTTP header"),
            Kind::Parse(Parse::ContentLength) => f.write_str("invalid content-length"),
            Kind::Parse(Parse::TransferEncoding) => f.write_str("unexpected transfer-encoding"),
            Kind::Parse(Parse::TooLarge) => f.write_str("message head is too large"),
            Kind::Parse(Parse::Frame) => f.write_str("malformed HTTP/2 frame"),
            Kind::Parse(Parse::Compression) => f.write_str("HPACK decoding failed"),
            Kind::StreamReset(reason) => write!(f, "stream reset: {}", reason),
            Kind::ConnectionClosed => f.write_str("connection closed before exchange completed"),
            Kind::Timeout(TimeoutKind::Call) => f.write_str("call timed out"),
            Kind::Timeout(TimeoutKind::Connect) => f.write_str("connect timed out"),
            Kind::Timeout(TimeoutKind::Read) => f.write_str("read timed out"),
            Kind::Timeout(TimeoutKind::Write) => f.write_str("write timed out"),
            Kind::Tls => f.write_str("TLS handshake failed"),
            Kind::Canceled => f.write_str("call was canceled"),
            Kind::Connect => f.write_str("error trying to connect"),
            Kind::UnreadableBody => f.write_str("response body is unreadable"),
            Kind::TooManyFollowUps(n) => write!(f, "Too many follow-up requests: {}", n),
            Kind::Io => f.write_str("connection error"),
            Kind::ChannelClosed => f.write_str("channel closed"),
            Kind::User(User::DuplexNotSupported) => {
                f.write_str("duplex request bodies require HTTP/2")
            }
            Kind::User(User::UnsupportedScheme) => f.write_str("url scheme must be http or https"),
            Kind::User(User::BodyNotReplayable) => {
                f.write_str("one-shot request body cannot be replayed")
            }
            Kind::User(User::AlreadyExecuted) => f.write_str("call has already been executed"),
            Kind::User(User::ExecutorShutdown) => f.write_str("dispatcher executor is shut down"),
        }
    }
}

struct Description<'a>(&'a Error);

impl fmt::Display for Description<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.description(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("courier::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        if !self.inner.suppressed.is_empty() {
            f.field(&self.inner.suppressed);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            self.description(f)?;
            write!(f, ": {}", cause)
        } else {
            self.description(f)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Error::new_header(),
            httparse::Error::Status => Error::new_status_line(),
            httparse::Error::TooManyHeaders => Error::new_too_large(),
            httparse::Error::Version => Error::new_version(),
        }
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

// ===== impl TimedOut =====

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TimeoutKind::Call => f.write_str("call timed out"),
            TimeoutKind::Connect => f.write_str("connect timed out"),
            TimeoutKind::Read => f.write_str("read timed out"),
            TimeoutKind::Write => f.write_str("write timed out"),
        }
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn timeout_finds_sentinel() {
        let err = Error::new_timeout(TimeoutKind::Read);
        assert!(err.is_timeout());
        assert_eq!(err.timeout_kind(), Some(TimeoutKind::Read));
    }

    #[test]
    fn suppressed_attach() {
        let first = Error::new_connect(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused 10.0.0.1:443",
        ));
        let surfaced = Error::new_connection_closed().with_suppressed(first);
        assert_eq!(surfaced.suppressed().len(), 1);
        assert!(surfaced.suppressed()[0].is_connect());
    }
}
