//! Retries and follow-ups: the only place that decides whether a failure
//! is tried again or a server response spawns a new request.

use http::{Method, StatusCode, Uri};
use tracing::{debug, trace};

use crate::common::BoxFuture;
use crate::error::{Error, Result};
use crate::interceptor::{Chain, Interceptor};
use crate::proto::h2::Reason;
use crate::request::Request;
use crate::response::Response;

/// The 21st follow-up fails.
const MAX_FOLLOW_UPS: u32 = 20;

pub(crate) struct RetryAndFollowUp;

impl Interceptor for RetryAndFollowUp {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.ctx();
            let mut request = chain.request().clone();
            let mut prior: Option<Response> = None;
            let mut follow_up_count: u32 = 0;
            let mut suppressed: Vec<Error> = Vec::new();

            loop {
                ctx.check_canceled()?;
                // Each attempt transmits its body anew.
                ctx.request_body_sent
                    .store(false, std::sync::atomic::Ordering::SeqCst);

                let attempt = chain.duplicate();
                let mut response = match attempt.proceed(request.clone()).await {
                    Ok(response) => response,
                    Err(err) => {
                        if ctx.is_canceled() {
                            return Err(Error::new_canceled());
                        }
                        let retriable = is_recoverable(&err, &request, ctx).await;
                        ctx.events().retry_decision(ctx.call_id, retriable);
                        if !retriable {
                            let mut err = err;
                            for prior_err in suppressed {
                                err = err.with_suppressed(prior_err);
                            }
                            return Err(err);
                        }
                        debug!("retrying after: {}", err);
                        // A fresh connection next time around, and a fresh
                        // route sequence: the database remembers what just
                        // failed and demotes it.
                        *ctx.held_connection.lock().unwrap() = None;
                        *ctx.planner.lock().await = None;
                        suppressed.push(err);
                        continue;
                    }
                };

                if let Some(prior) = prior.take() {
                    response.set_prior_response(prior);
                }

                let follow_up = follow_up_request(&response, &request, ctx)?;
                let next = match follow_up {
                    Some(next) => next,
                    None => return Ok(response),
                };

                follow_up_count += 1;
                if follow_up_count > MAX_FOLLOW_UPS {
                    return Err(Error::new_too_many_follow_ups(follow_up_count));
                }

                ctx.events().follow_up_decision(ctx.call_id, next.uri());
                trace!(
                    "follow-up {} of {}: {} {}",
                    follow_up_count,
                    MAX_FOLLOW_UPS,
                    next.method(),
                    next.uri()
                );

                // Drain the interim body so the connection stays reusable
                // for the follow-up exchange.
                let _ = response.bytes().await;

                prior = Some(response.into_prior());
                request = next;
            }
        })
    }
}

/// The retry policy of the engine, applied to transport failures only.
async fn is_recoverable(err: &Error, request: &Request, ctx: &crate::call::CallContext) -> bool {
    if !ctx.client.config.retry_on_connection_failure {
        return false;
    }

    // The body must be writable a second time.
    if let Some(body) = request.body() {
        if !body.is_replayable() {
            return false;
        }
    }

    // A refused stream never reached application logic; any connection,
    // including a brand new one to the same route, may carry the retry.
    if err.stream_reset_code() == Some(u32::from(Reason::REFUSED_STREAM)) {
        return true;
    }

    let kind_allows = if err.is_connect() {
        true
    } else if err.is_connection_closed() {
        // EOF on a pooled connection is the classic stale-connection case.
        true
    } else if let Some(code) = err.stream_reset_code() {
        // CANCEL mid-write is retriable only while the server has not
        // observed the whole body; after that, retrying re-executes a
        // request the server may already be acting on.
        code == u32::from(Reason::CANCEL)
            && !ctx
                .request_body_sent
                .load(std::sync::atomic::Ordering::SeqCst)
    } else if err.is_tls() {
        // Fall back only to a strictly weaker TLS spec; cleartext is never
        // an implicit fallback.
        let last = ctx.last_route.lock().unwrap().clone();
        match last {
            Some(route) => ctx
                .client
                .config
                .connection_specs
                .iter()
                .any(|spec| spec.is_weaker_than(&route.spec)),
            None => false,
        }
    } else {
        false
    };
    if !kind_allows {
        return false;
    }

    // There must be somewhere else to go: another route, or the failure
    // came from a pooled connection that has now been discarded.
    if ctx.last_was_pooled.load(std::sync::atomic::Ordering::SeqCst) {
        return true;
    }
    let planner = ctx.planner.lock().await;
    match *planner {
        Some((_, ref planner)) => planner.has_buffered(),
        None => true,
    }
}

/// Computes the follow-up request a response demands, if any.
fn follow_up_request(
    response: &Response,
    request: &Request,
    ctx: &crate::call::CallContext,
) -> Result<Option<Request>> {
    let client = &ctx.client;

    match response.status() {
        StatusCode::MOVED_PERMANENTLY
        | StatusCode::FOUND
        | StatusCode::SEE_OTHER
        | StatusCode::TEMPORARY_REDIRECT
        | StatusCode::PERMANENT_REDIRECT => build_redirect(response, request, ctx),

        StatusCode::UNAUTHORIZED => {
            let route = ctx.last_route.lock().unwrap().clone();
            Ok(client.authenticator.authenticate(route.as_ref(), response))
        }

        StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            let route = ctx.last_route.lock().unwrap().clone();
            Ok(client
                .proxy_authenticator
                .authenticate(route.as_ref(), response))
        }

        StatusCode::REQUEST_TIMEOUT => {
            // Retry once, on a fresh connection, if the body allows it.
            let replayable = request.body().map(|b| b.is_replayable()).unwrap_or(true);
            let prior_was_408 = response
                .prior_response()
                .map(|p| p.status() == StatusCode::REQUEST_TIMEOUT)
                .unwrap_or(false);
            if replayable && !prior_was_408 {
                *ctx.held_connection.lock().unwrap() = None;
                Ok(Some(request.clone()))
            } else {
                Ok(None)
            }
        }

        StatusCode::SERVICE_UNAVAILABLE => {
            // Only an explicit Retry-After: 0 invites an immediate retry.
            let retry_now = response
                .header("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim() == "0")
                .unwrap_or(false);
            let prior_was_503 = response
                .prior_response()
                .map(|p| p.status() == StatusCode::SERVICE_UNAVAILABLE)
                .unwrap_or(false);
            if retry_now && !prior_was_503 {
                *ctx.held_connection.lock().unwrap() = None;
                Ok(Some(request.clone()))
            } else {
                Ok(None)
            }
        }

        StatusCode::MISDIRECTED_REQUEST => {
            // A coalesced HTTP/2 connection reached the wrong origin; try
            // again on a connection of its own.
            let prior_was_421 = response
                .prior_response()
                .map(|p| p.status() == StatusCode::MISDIRECTED_REQUEST)
                .unwrap_or(false);
            if prior_was_421 {
                return Ok(None);
            }
            if let Some(conn) = ctx.held_connection() {
                conn.set_no_new_exchanges();
            }
            *ctx.held_connection.lock().unwrap() = None;
            Ok(Some(request.clone()))
        }

        _ => Ok(None),
    }
}

fn build_redirect(
    response: &Response,
    request: &Request,
    ctx: &crate::call::CallContext,
) -> Result<Option<Request>> {
    let config = &ctx.client.config;
    if !config.follow_redirects {
        return Ok(None);
    }

    let location = match response.header("location").and_then(|v| v.to_str().ok()) {
        Some(location) => location,
        None => return Ok(None),
    };
    let target = match resolve_location(request.uri(), location) {
        Some(target) => target,
        None => return Ok(None),
    };

    let cross_scheme = target.scheme_str() != request.uri().scheme_str();
    if cross_scheme && !config.follow_tls_redirects {
        return Ok(None);
    }

    // RFC 7231 method rewriting: 303 always becomes GET; 301/302 demote
    // bodied methods to GET; 307/308 preserve the method and body.
    let status = response.status();
    let keep_method = status == StatusCode::TEMPORARY_REDIRECT
        || status == StatusCode::PERMANENT_REDIRECT
        || *request.method() == Method::GET
        || *request.method() == Method::HEAD;

    let mut builder = request.to_builder().uri(target.clone());
    if keep_method {
        if status != StatusCode::SEE_OTHER {
            if let Some(body) = request.body() {
                if !body.is_replayable() {
                    return Ok(None);
                }
            }
        }
    } else {
        builder = builder
            .method(Method::GET)
            .no_body()
            .remove_header("content-length")
            .remove_header("content-encoding")
            .remove_header("content-type")
            .remove_header("transfer-encoding");
    }

    // Credentials never travel to a different host.
    let host_changed = target.host() != request.uri().host();
    if host_changed {
        builder = builder.remove_header("authorization");
    }

    Ok(Some(builder.build()?))
}

/// Resolves a Location header against the request URI. Absolute locations
/// win; relative ones merge paths per RFC 3986's simple cases.
fn resolve_location(base: &Uri, location: &str) -> Option<Uri> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.parse().ok();
    }

    let scheme = base.scheme_str()?;
    let authority = base.authority()?.as_str();

    let path_and_query = if location.starts_with("//") {
        return format!("{}:{}", scheme, location).parse().ok();
    } else if location.starts_with('/') {
        location.to_string()
    } else {
        // Relative path: replace the last segment.
        let base_path = base.path();
        let dir = match base_path.rfind('/') {
            Some(at) => &base_path[..=at],
            None => "/",
        };
        format!("{}{}", dir, location)
    };

    format!("{}://{}{}", scheme, authority, path_and_query)
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_absolute_location() {
        let base: Uri = "https://a.example/x/y".parse().unwrap();
        let resolved = resolve_location(&base, "https://b.example/z").unwrap();
        assert_eq!(resolved.to_string(), "https://b.example/z");
    }

    #[test]
    fn resolves_absolute_path() {
        let base: Uri = "https://a.example/x/y?q=1".parse().unwrap();
        let resolved = resolve_location(&base, "/target").unwrap();
        assert_eq!(resolved.to_string(), "https://a.example/target");
    }

    #[test]
    fn resolves_relative_path() {
        let base: Uri = "https://a.example/x/y".parse().unwrap();
        let resolved = resolve_location(&base, "sibling").unwrap();
        assert_eq!(resolved.to_string(), "https://a.example/x/sibling");
    }

    #[test]
    fn resolves_protocol_relative() {
        let base: Uri = "https://a.example/x".parse().unwrap();
        let resolved = resolve_location(&base, "//b.example/y").unwrap();
        assert_eq!(resolved.to_string(), "https://b.example/y");
    }

    #[tokio::test]
    async fn cancel_retries_only_before_the_body_was_sent() {
        use std::sync::atomic::Ordering;

        use crate::body::Body;
        use crate::call::CallContext;
        use crate::client::HttpClient;

        let client = HttpClient::builder().build().unwrap();
        let ctx = CallContext::for_tests(client.inner_for_tests());
        let request = Request::builder()
            .method(Method::POST)
            .uri("http://a.example/submit")
            .body(Body::from("payload"))
            .build()
            .unwrap();

        let cancel = Error::new_stream_reset(Reason::CANCEL);
        assert!(is_recoverable(&cancel, &request, &ctx).await);

        // Once the server has observed the whole body, a CANCEL must not
        // re-execute the request.
        ctx.request_body_sent.store(true, Ordering::SeqCst);
        assert!(!is_recoverable(&cancel, &request, &ctx).await);

        // A refused stream never reached the server; still retriable.
        let refused = Error::new_stream_reset(Reason::REFUSED_STREAM);
        assert!(is_recoverable(&refused, &request, &ctx).await);
    }
}
