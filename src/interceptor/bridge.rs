//! Bridges application intent to wire mechanics: synthesized headers on
//! the way out, cookies and transparent gzip on the way back.

use http::header::{
    HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, COOKIE, HOST, RANGE, SET_COOKIE,
    TRANSFER_ENCODING, USER_AGENT,
};
use tracing::trace;

use crate::common::BoxFuture;
use crate::error::Result;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

/// Conditional-request validators from an external cache, attached as a
/// request tag. The bridge turns them into `If-None-Match` /
/// `If-Modified-Since` headers when none are present.
#[derive(Debug, Clone, Default)]
pub struct CacheValidator {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

pub(crate) struct Bridge;

impl Interceptor for Bridge {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.ctx();
            let request = chain.request();
            let mut builder = request.to_builder();

            if request.header("host").is_none() {
                let host = host_header(request.uri());
                builder = builder.set_header(HOST, host);
            }

            // Ask for gzip only when the caller expressed no preference;
            // a Range request must not be re-coded.
            let transparent_gzip = request.header("accept-encoding").is_none()
                && request.headers().get(RANGE).is_none();
            if transparent_gzip {
                builder = builder.set_header(ACCEPT_ENCODING, "gzip");
            }

            if request.header("connection").is_none() {
                builder = builder.set_header(CONNECTION, "Keep-Alive");
            }
            if request.header("user-agent").is_none() {
                builder =
                    builder.set_header(USER_AGENT, ctx.client.config.user_agent.as_str());
            }

            if let Some(cookie) = ctx.client.cookie_jar.load(request.uri()) {
                builder = builder.set_header(COOKIE, cookie);
            }

            // Body framing headers.
            match request.body() {
                Some(body) => match body.content_length() {
                    Some(length) => {
                        builder = builder
                            .set_header(CONTENT_LENGTH, length.to_string().as_str())
                            .remove_header("transfer-encoding");
                    }
                    None => {
                        builder = builder
                            .set_header(TRANSFER_ENCODING, "chunked")
                            .remove_header("content-length");
                    }
                },
                None => {
                    builder = builder
                        .remove_header("content-length")
                        .remove_header("transfer-encoding");
                }
            }

            // Conditional-request synthesis for a caller-provided cache.
            if let Some(validator) = request.tag::<CacheValidator>() {
                if request.header("if-none-match").is_none() {
                    if let Some(ref etag) = validator.etag {
                        builder = builder.set_header("if-none-match", etag.as_str());
                    }
                }
                if request.header("if-modified-since").is_none() {
                    if let Some(ref date) = validator.last_modified {
                        builder = builder.set_header("if-modified-since", date.as_str());
                    }
                }
            }

            let network_request = builder.build()?;
            let uri = network_request.uri().clone();
            let mut response = chain.proceed(network_request).await?;

            // Deliver cookies before anything can fail.
            let set_cookies: Vec<HeaderValue> = response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .cloned()
                .collect();
            if !set_cookies.is_empty() {
                ctx.client.cookie_jar.save(&uri, set_cookies);
            }

            if transparent_gzip && is_gzipped(&response) {
                trace!("inflating gzip response body");
                response = response.into_inflated();
            }

            Ok(response)
        })
    }
}

fn is_gzipped(response: &Response) -> bool {
    response
        .header("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

fn host_header(uri: &http::Uri) -> String {
    let host = uri.host().unwrap_or_default();
    match uri.port_u16() {
        Some(port) if Some(port) != default_port(uri) => format!("{}:{}", host, port),
        _ => host.to_string(),
    }
}

fn default_port(uri: &http::Uri) -> Option<u16> {
    match uri.scheme_str() {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_keeps_non_default_port() {
        assert_eq!(
            host_header(&"http://a.example:8080/".parse().unwrap()),
            "a.example:8080"
        );
        assert_eq!(host_header(&"http://a.example/".parse().unwrap()), "a.example");
        assert_eq!(
            host_header(&"https://a.example:443/".parse().unwrap()),
            "a.example"
        );
    }
}
