//! The terminal interceptor: drives the exchange against the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::body::BodyChunks;
use crate::common::BoxFuture;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::interceptor::{Chain, Interceptor};
use crate::proto::{Codec, RequestHead, ResponseHead};
use crate::response::{Response, ResponseBody, ResponseParts};

pub(crate) struct CallServer;

impl Interceptor for CallServer {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.ctx();
            let mut exchange = ctx.take_exchange().ok_or_else(Error::new_closed)?;
            let request = chain.request().clone();

            let body = request.body().cloned();
            let is_h2 = matches!(exchange_codec(&exchange), CodecKind::H2);
            if body.as_ref().map(|b| b.is_duplex()).unwrap_or(false) && !is_h2 {
                // Duplex needs multiplexing; HTTP/1 cannot interleave.
                exchange.cancel();
                return Err(Error::new_user_duplex());
            }

            let absolute_form = {
                let conn = exchange.connection();
                matches!(conn.route.proxy, crate::collab::Proxy::Http { .. })
                    && !conn.route.address.is_https()
            };

            ctx.check_canceled()?;
            ctx.events().request_headers_start(ctx.call_id);
            let sent_at = Instant::now();

            let head = RequestHead {
                method: request.method(),
                uri: request.uri(),
                headers: request.headers(),
                absolute_form,
            };
            exchange.write_request_head(head, body.is_none()).await?;
            ctx.events().request_headers_end(ctx.call_id);
            if body.is_none() {
                // Nothing left to transmit; a peer reset from here on is
                // past the point of safe replay for non-idempotent calls.
                ctx.request_body_sent.store(true, Ordering::SeqCst);
            }

            // An early response head can arrive while the body is still
            // owed: Expect: 100-continue negotiation, or a server that
            // rejects without reading the body.
            let mut pending_head: Option<ResponseHead> = None;

            if let Some(body) = body {
                let expects_continue = request
                    .header("expect")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.eq_ignore_ascii_case("100-continue"))
                    .unwrap_or(false);

                let mut send_body = true;
                if expects_continue {
                    let wait = ctx.client.config.read_timeout;
                    match tokio::time::timeout(wait, exchange.read_response_head()).await {
                        Ok(Ok(head)) if head.status.as_u16() == 100 => {
                            trace!("100 Continue: sending request body");
                        }
                        Ok(Ok(head)) => {
                            // Anything else first means the server does
                            // not want the body at all.
                            debug!("expect/continue answered {}; skipping body", head.status);
                            send_body = false;
                            pending_head = Some(head);
                        }
                        Ok(Err(err)) => return Err(err),
                        Err(_) => {
                            // No verdict in time: send the body anyway.
                            trace!("100-continue wait elapsed; sending body");
                        }
                    }
                }

                if send_body {
                    ctx.check_canceled()?;
                    ctx.events().request_body_start(ctx.call_id);
                    let chunks = body
                        .clone()
                        .into_chunks()
                        .ok_or_else(Error::new_user_body_not_replayable)?;

                    if body.is_duplex() {
                        spawn_duplex_pump(&mut exchange, chunks, ctx.request_body_sent.clone())?;
                    } else {
                        let sent = pump_body(ctx, &mut exchange, chunks).await?;
                        ctx.request_body_sent.store(true, Ordering::SeqCst);
                        ctx.events().request_body_end(ctx.call_id, sent);
                    }
                }
            }

            // Skip informational responses, surfacing them as events; 101
            // ends HTTP on this connection and is returned directly.
            ctx.events().response_headers_start(ctx.call_id);
            let head = loop {
                ctx.check_canceled()?;
                let head = match pending_head.take() {
                    Some(head) => head,
                    None => exchange.read_response_head().await?,
                };
                match head.status.as_u16() {
                    100 => continue,
                    101 => break head,
                    code if head.is_informational() => {
                        ctx.events().informational_response(ctx.call_id, code);
                        continue;
                    }
                    _ => break head,
                }
            };

            let received_at = Instant::now();
            ctx.events()
                .response_headers_end(ctx.call_id, head.status.as_u16());

            let handshake = exchange.connection().handshake.clone();
            let protocol = exchange.connection().protocol;

            let (body, upgrade) = if head.status.as_u16() == 101 {
                let upgrade = exchange.take_upgrade();
                (ResponseBody::empty(), upgrade)
            } else {
                ctx.events().response_body_start(ctx.call_id);
                (
                    ResponseBody::stream(crate::exchange::BodyReader::new(exchange)),
                    None,
                )
            };

            Ok(Response::from_parts(ResponseParts {
                status: head.status,
                reason: head.reason,
                protocol,
                headers: head.headers,
                body,
                handshake,
                sent_at,
                received_at,
                request,
                upgrade,
            }))
        })
    }
}

enum CodecKind {
    H1,
    H2,
}

fn exchange_codec(exchange: &Exchange) -> CodecKind {
    match exchange.codec_ref() {
        Codec::H1(_) => CodecKind::H1,
        Codec::H2(_) => CodecKind::H2,
    }
}

/// Writes the whole request body, observing cancellation between chunks.
async fn pump_body(
    ctx: &crate::call::CallContext,
    exchange: &mut Exchange,
    mut chunks: BodyChunks,
) -> Result<u64> {
    let mut sent: u64 = 0;
    loop {
        ctx.check_canceled()?;
        match chunks.next().await? {
            Some(chunk) => {
                sent += chunk.len() as u64;
                exchange.write_data(chunk, false).await?;
            }
            None => {
                exchange.finish_body().await?;
                return Ok(sent);
            }
        }
    }
}

/// Duplex: the body keeps writing on its own task while the response
/// streams back to the caller.
fn spawn_duplex_pump(
    exchange: &mut Exchange,
    mut chunks: BodyChunks,
    body_sent: Arc<AtomicBool>,
) -> Result<()> {
    let mut writer = match exchange.codec_ref() {
        Codec::H2(h2) => h2.writer_clone(),
        Codec::H1(_) => return Err(Error::new_user_duplex()),
    };
    tokio::spawn(async move {
        loop {
            match chunks.next().await {
                Ok(Some(chunk)) => {
                    if writer.write_data(chunk, false).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    if writer.finish_body().await.is_ok() {
                        body_sent.store(true, Ordering::SeqCst);
                    }
                    return;
                }
                Err(_) => {
                    writer.cancel();
                    return;
                }
            }
        }
    });
    Ok(())
}
