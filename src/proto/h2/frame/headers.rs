use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};

use crate::proto::h2::hpack;

#[cfg(test)]
use super::HEADER_LEN;
use super::{util, Error, Head, Kind, StreamId};

pub(crate) const END_STREAM: u8 = 0x1;
pub(crate) const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;

/// A HEADERS frame: request heads, response heads, or trailers.
#[derive(Debug)]
pub(crate) struct Headers {
    stream_id: StreamId,
    pseudo: Pseudo,
    fields: HeaderMap,
    flags: u8,
}

/// The pseudo-header fields, kept apart from regular fields because they
/// must be written first.
#[derive(Debug, Default)]
pub(crate) struct Pseudo {
    pub(crate) method: Option<Method>,
    pub(crate) scheme: Option<Bytes>,
    pub(crate) authority: Option<Bytes>,
    pub(crate) path: Option<Bytes>,
    pub(crate) status: Option<StatusCode>,
}

/// A PUSH_PROMISE frame. The engine decodes it to keep HPACK state in sync,
/// then refuses the promised stream.
#[derive(Debug)]
pub(crate) struct PushPromise {
    stream_id: StreamId,
    promised_id: StreamId,
    flags: u8,
}

impl Headers {
    pub(crate) fn request(stream_id: StreamId, pseudo: Pseudo, fields: HeaderMap) -> Headers {
        Headers {
            stream_id,
            pseudo,
            fields,
            flags: END_HEADERS,
        }
    }

    pub(crate) fn trailers(stream_id: StreamId, fields: HeaderMap) -> Headers {
        Headers {
            stream_id,
            pseudo: Pseudo::default(),
            fields,
            flags: END_HEADERS | END_STREAM,
        }
    }

    /// Parses the frame header and strips padding and priority info,
    /// returning the frame plus the raw header-block fragment.
    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<(Headers, Bytes), Error> {
        if head.stream_id().is_connection() {
            return Err(Error::InvalidStreamId);
        }
        let flags = head.flag();

        if flags & PADDED == PADDED {
            util::strip_padding(&mut payload)?;
        }
        if flags & PRIORITY == PRIORITY {
            if payload.len() < 5 {
                return Err(Error::BadFrameSize);
            }
            let _ = payload.split_to(5);
        }

        let headers = Headers {
            stream_id: head.stream_id(),
            pseudo: Pseudo::default(),
            fields: HeaderMap::new(),
            flags: flags & (END_STREAM | END_HEADERS),
        };
        Ok((headers, payload))
    }

    /// Decodes the assembled header block into pseudo and regular fields.
    ///
    /// Enforces the receive-side rules: pseudo-headers precede regular
    /// fields, appear at most once, and names are lowercase.
    pub(crate) fn load_hpack(
        &mut self,
        block: &mut Bytes,
        decoder: &mut hpack::Decoder,
    ) -> Result<(), Error> {
        let mut malformed = false;
        let mut saw_regular = false;
        let pseudo = &mut self.pseudo;
        let fields = &mut self.fields;

        decoder.decode(block, |name, value| {
            if name.is_empty() {
                malformed = true;
                return;
            }
            if name.iter().any(|b| b.is_ascii_uppercase()) {
                malformed = true;
                return;
            }

            if name[0] == b':' {
                if saw_regular {
                    malformed = true;
                    return;
                }
                let slot = &name[1..];
                let ok = match slot {
                    b"method" => set_once(
                        &mut pseudo.method,
                        Method::from_bytes(&value).ok(),
                    ),
                    b"scheme" => set_once(&mut pseudo.scheme, Some(value)),
                    b"authority" => set_once(&mut pseudo.authority, Some(value)),
                    b"path" => set_once(&mut pseudo.path, Some(value)),
                    b"status" => set_once(
                        &mut pseudo.status,
                        std::str::from_utf8(&value)
                            .ok()
                            .and_then(|s| s.parse::<u16>().ok())
                            .and_then(|code| StatusCode::from_u16(code).ok()),
                    ),
                    _ => false,
                };
                if !ok {
                    malformed = true;
                }
            } else {
                saw_regular = true;
                match (
                    HeaderName::from_bytes(&name),
                    HeaderValue::from_maybe_shared(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        fields.append(name, value);
                    }
                    _ => malformed = true,
                }
            }
        })?;

        if malformed {
            return Err(Error::MalformedHeaderBlock);
        }
        Ok(())
    }

    /// Trailers carry no pseudo-header fields.
    pub(crate) fn is_trailers(&self) -> bool {
        self.pseudo.method.is_none() && self.pseudo.status.is_none()
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn is_end_headers(&self) -> bool {
        self.flags & END_HEADERS == END_HEADERS
    }

    pub(crate) fn set_end_headers(&mut self) {
        self.flags |= END_HEADERS;
    }

    pub(crate) fn is_end_stream(&self) -> bool {
        self.flags & END_STREAM == END_STREAM
    }

    pub(crate) fn set_end_stream(&mut self) {
        self.flags |= END_STREAM;
    }

    pub(crate) fn into_parts(self) -> (Pseudo, HeaderMap) {
        (self.pseudo, self.fields)
    }

    /// Encodes the block, splitting across HEADERS and CONTINUATION frames
    /// so no frame exceeds `max_frame_size`. The block is contiguous: no
    /// other frame may interleave.
    pub(crate) fn encode(
        self,
        encoder: &mut hpack::Encoder,
        dst: &mut BytesMut,
        max_frame_size: usize,
    ) {
        let mut block = BytesMut::new();
        let stream_id = self.stream_id;
        let flags = self.flags & END_STREAM;

        encoder.encode(
            self.pseudo
                .fields()
                .map(|(n, v)| (n, v, false))
                .chain(self.fields.iter().map(|(name, value)| {
                    (
                        name.as_str().as_bytes(),
                        value.as_bytes(),
                        value.is_sensitive() || is_sensitive_name(name),
                    )
                })),
            &mut block,
        );

        let mut block = block.freeze();
        let mut first = true;
        loop {
            let chunk = block.split_to(block.len().min(max_frame_size));
            let done = block.is_empty();
            let kind = if first { Kind::Headers } else { Kind::Continuation };
            let mut frame_flags = if first { flags } else { 0 };
            if done {
                frame_flags |= END_HEADERS;
            }
            Head::new(kind, frame_flags, stream_id).encode(chunk.len(), dst);
            dst.extend_from_slice(&chunk);
            first = false;
            if done {
                break;
            }
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match (slot.is_none(), value) {
        (true, Some(value)) => {
            *slot = Some(value);
            true
        }
        _ => false,
    }
}

fn is_sensitive_name(name: &HeaderName) -> bool {
    *name == http::header::AUTHORIZATION
        || *name == http::header::PROXY_AUTHORIZATION
        || *name == http::header::COOKIE
        || *name == http::header::SET_COOKIE
}

// ===== impl Pseudo =====

impl Pseudo {
    pub(crate) fn request(method: Method, uri: &Uri) -> Pseudo {
        let path = uri
            .path_and_query()
            .map(|pq| Bytes::copy_from_slice(pq.as_str().as_bytes()))
            .unwrap_or_else(|| Bytes::from_static(b"/"));

        Pseudo {
            method: Some(method),
            scheme: uri
                .scheme_str()
                .map(|s| Bytes::copy_from_slice(s.as_bytes())),
            authority: uri
                .authority()
                .map(|a| Bytes::copy_from_slice(a.as_str().as_bytes())),
            path: Some(path),
            status: None,
        }
    }

    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Pseudo fields in canonical order: method, scheme, authority, path
    /// for requests; status for responses. Always ahead of regular fields.
    fn fields(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        let mut out: Vec<(&[u8], &[u8])> = Vec::with_capacity(4);
        if let Some(ref method) = self.method {
            out.push((b":method", method.as_str().as_bytes()));
        }
        if let Some(ref scheme) = self.scheme {
            out.push((b":scheme", scheme));
        }
        if let Some(ref authority) = self.authority {
            out.push((b":authority", authority));
        }
        if let Some(ref path) = self.path {
            out.push((b":path", path));
        }
        if let Some(ref status) = self.status {
            out.push((b":status", status.as_str().as_bytes()));
        }
        out.into_iter()
    }
}

// ===== impl PushPromise =====

impl PushPromise {
    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<(PushPromise, Bytes), Error> {
        if head.stream_id().is_connection() {
            return Err(Error::InvalidStreamId);
        }
        let flags = head.flag();
        if flags & PADDED == PADDED {
            util::strip_padding(&mut payload)?;
        }
        if payload.len() < 4 {
            return Err(Error::BadFrameSize);
        }
        let promised_id = StreamId::parse(&payload.split_to(4));

        let push = PushPromise {
            stream_id: head.stream_id(),
            promised_id,
            flags: flags & END_HEADERS,
        };
        Ok((push, payload))
    }

    /// Decodes and discards the promised request's header block, keeping
    /// the connection's HPACK state consistent.
    pub(crate) fn load_hpack(
        &mut self,
        block: &mut Bytes,
        decoder: &mut hpack::Decoder,
    ) -> Result<(), Error> {
        decoder.decode(block, |_, _| {})?;
        Ok(())
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn promised_id(&self) -> StreamId {
        self.promised_id
    }

    pub(crate) fn is_end_headers(&self) -> bool {
        self.flags & END_HEADERS == END_HEADERS
    }

    pub(crate) fn set_end_headers(&mut self) {
        self.flags |= END_HEADERS;
    }
}
