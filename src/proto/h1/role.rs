//! HTTP/1 head parsing and encoding for the client role.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use tracing::trace;

use crate::error::{Error, Result};
use crate::proto::{RequestHead, ResponseHead};

use super::decode::Decoder;

const MAX_HEADERS: usize = 100;
const AVERAGE_HEADER_SIZE: usize = 30;

/// Parses a response head from the buffer, consuming it on success.
///
/// Header values are taken leniently, byte for byte; names must be valid
/// tokens, which httparse enforces. `Ok(None)` means more bytes are needed.
pub(crate) fn parse_response_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    trace!("Response.parse([Header; {}], [u8; {}])", MAX_HEADERS, buf.len());

    let (len, status, reason, header_count) = match res.parse(buf)? {
        httparse::Status::Complete(len) => {
            let code = res.code.expect("complete parse has code");
            let status = StatusCode::from_u16(code).map_err(|_| Error::new_status_line())?;
            let reason = res
                .reason
                .filter(|r| Some(*r) != status.canonical_reason())
                .map(|r| Bytes::copy_from_slice(r.as_bytes()));
            match res.version {
                Some(0) | Some(1) => (),
                _ => return Err(Error::new_version()),
            }
            (len, status, reason, res.headers.len())
        }
        httparse::Status::Partial => return Ok(None),
    };

    let mut map = HeaderMap::with_capacity(header_count);
    for header in res.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::new_header())?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|_| Error::new_header())?;
        map.append(name, value);
    }

    let _ = buf.split_to(len);
    Ok(Some(ResponseHead {
        status,
        reason,
        headers: map,
    }))
}

/// Encodes the request line and headers.
pub(super) fn encode_request_head(head: &RequestHead<'_>, dst: &mut BytesMut) {
    dst.reserve(50 + head.headers.len() * AVERAGE_HEADER_SIZE);

    dst.extend_from_slice(head.method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    if head.absolute_form {
        dst.extend_from_slice(head.uri.to_string().as_bytes());
    } else {
        let target = head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        dst.extend_from_slice(target.as_bytes());
    }
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in head.headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

/// What follows a final response head on the wire.
#[derive(Debug)]
pub(super) enum ResponseBody {
    /// A body framed by the contained decoder.
    Decode(Decoder),
    /// No body, and the connection stays usable.
    Empty,
    /// 101: the connection leaves HTTP entirely.
    Upgrade,
}

/// RFC 7230 §3.3.3, from the client's point of view.
pub(super) fn response_body(head: &ResponseHead, method: &Method) -> Result<ResponseBody> {
    match head.status.as_u16() {
        101 => return Ok(ResponseBody::Upgrade),
        100..=199 => return Ok(ResponseBody::Empty),
        204 | 304 => return Ok(ResponseBody::Empty),
        _ => (),
    }

    // HEAD responses never carry a body, whatever the headers claim.
    if *method == Method::HEAD {
        return Ok(ResponseBody::Empty);
    }
    if *method == Method::CONNECT && head.status.is_success() {
        return Ok(ResponseBody::Upgrade);
    }

    if let Some(te) = head.headers.get(http::header::TRANSFER_ENCODING) {
        let te = te.to_str().map_err(|_| Error::new_transfer_encoding())?;
        let chunked_last = te
            .split(',')
            .map(str::trim)
            .last()
            .map(|coding| coding.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        if chunked_last {
            return Ok(ResponseBody::Decode(Decoder::chunked()));
        }
        // Transfer-Encoding without a final chunked coding: length is
        // unknowable, read until close.
        return Ok(ResponseBody::Decode(Decoder::eof()));
    }

    if head.headers.contains_key(http::header::CONTENT_LENGTH) {
        let len = content_length(&head.headers)?;
        if len == 0 {
            return Ok(ResponseBody::Empty);
        }
        return Ok(ResponseBody::Decode(Decoder::length(len)));
    }

    // No framing information: the body runs until the peer closes.
    Ok(ResponseBody::Decode(Decoder::eof()))
}

/// All Content-Length values must agree and parse as decimal.
fn content_length(headers: &HeaderMap) -> Result<u64> {
    let mut result: Option<u64> = None;
    for value in headers.get_all(http::header::CONTENT_LENGTH) {
        let text = value.to_str().map_err(|_| Error::new_content_length())?;
        for part in text.split(',') {
            let parsed: u64 = part
                .trim()
                .parse()
                .map_err(|_| Error::new_content_length())?;
            match result {
                Some(prev) if prev != parsed => return Err(Error::new_content_length()),
                _ => result = Some(parsed),
            }
        }
    }
    result.ok_or_else(Error::new_content_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    fn parse(bytes: &[u8]) -> Result<Option<ResponseHead>> {
        let mut buf = BytesMut::from(bytes);
        parse_response_head(&mut buf)
    }

    #[test]
    fn parses_simple_response() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        // Canonical reasons are not stored.
        assert!(head.reason.is_none());
        assert_eq!(head.headers.get("content-length").unwrap(), "3");
    }

    #[test]
    fn preserves_uncommon_reason_phrase() {
        let head = parse(b"HTTP/1.1 200 Absolutely Fine\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.reason.as_deref(), Some(&b"Absolutely Fine"[..]));
    }

    #[test]
    fn partial_head_asks_for_more() {
        assert!(parse(b"HTTP/1.1 200 OK\r\nContent-").unwrap().is_none());
    }

    #[test]
    fn lenient_header_value_bytes() {
        let head = parse(b"HTTP/1.1 200 OK\r\nx-odd: v\xc3\xa4lue\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            head.headers.get("x-odd").unwrap().as_bytes(),
            "v\u{e4}lue".as_bytes()
        );
    }

    #[test]
    fn encodes_origin_form_request() {
        let uri: Uri = "http://example.com/path?q=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());
        let mut dst = BytesMut::new();
        encode_request_head(
            &RequestHead {
                method: &Method::GET,
                uri: &uri,
                headers: &headers,
                absolute_form: false,
            },
            &mut dst,
        );
        assert_eq!(
            &dst[..],
            &b"GET /path?q=1 HTTP/1.1\r\nhost: example.com\r\n\r\n"[..]
        );
    }

    #[test]
    fn head_never_has_a_body() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(matches!(
            response_body(&head, &Method::HEAD).unwrap(),
            ResponseBody::Empty
        ));
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(response_body(&head, &Method::GET).is_err());
    }

    #[test]
    fn chunked_beats_content_length() {
        let head = parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(matches!(
            response_body(&head, &Method::GET).unwrap(),
            ResponseBody::Decode(_)
        ));
    }

    #[test]
    fn no_length_means_read_to_eof() {
        let head = parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap().unwrap();
        match response_body(&head, &Method::GET).unwrap() {
            ResponseBody::Decode(decoder) => assert!(!decoder.allows_reuse()),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
