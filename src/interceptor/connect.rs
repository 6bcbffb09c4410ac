//! Obtains an exchange: a healthy connection plus a protocol codec.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::common::BoxFuture;
use crate::config::Protocol;
use crate::connect::happy;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::interceptor::{Chain, Interceptor};
use crate::pool::{PooledConnection, Transport};
use crate::proto::h1::{Buffered, H1Exchange, H1Socket};
use crate::proto::h2;
use crate::proto::Codec;
use crate::response::Response;
use crate::route::RoutePlanner;

pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.ctx();
            ctx.check_canceled()?;

            let request = chain.request().clone();
            let address = ctx.client.address_for(request.uri());

            // Step 1: the connection this call used last, when it still
            // fits.
            let mut bound = None;
            if let Some(held) = ctx.held_connection() {
                if held.route.address == address
                    && held.is_healthy()
                    && ctx.client.pool.rebind(&held, &ctx.marker)
                {
                    trace!("call {} reusing held connection {}", ctx.call_id, held.id);
                    ctx.last_was_pooled.store(true, Ordering::SeqCst);
                    bound = Some(held);
                }
            }

            // Step 2: any pooled connection for this address, coalescing
            // included.
            if bound.is_none() {
                if let Some(found) = ctx.client.pool.find(&address, &ctx.marker) {
                    ctx.last_was_pooled.store(true, Ordering::SeqCst);
                    bound = Some(found);
                }
            }

            // Step 3: plan routes and connect.
            let conn = match bound {
                Some(conn) => conn,
                None => {
                    ctx.last_was_pooled.store(false, Ordering::SeqCst);
                    connect_new(&chain, &address).await?
                }
            };

            ctx.hold_connection(&conn);
            *ctx.last_route.lock().unwrap() = Some(conn.route.clone());
            ctx.events().connection_acquired(ctx.call_id, conn.id);

            let codec = match make_codec(&conn) {
                Some(codec) => codec,
                None => {
                    // Lost a race for the transport; try the pool again on
                    // retry rather than spinning here.
                    ctx.client.pool.release(&conn, &ctx.marker, true);
                    return Err(Error::new_stream_reset(h2::Reason::REFUSED_STREAM));
                }
            };

            let exchange = Exchange::new(
                codec,
                conn,
                ctx.client.pool.clone(),
                ctx.marker.clone(),
                ctx.client.events.clone(),
                ctx.call_id,
            );
            ctx.set_exchange(exchange);

            chain.proceed(request).await
        })
    }
}

fn make_codec(conn: &Arc<PooledConnection>) -> Option<Codec> {
    match conn.transport {
        Transport::H1(ref socket) => H1Exchange::new(socket.clone()).map(Codec::H1),
        Transport::H2(ref h2conn) => Some(Codec::H2(h2conn.new_exchange())),
    }
}

/// Route planning plus the connect race, feeding results back into the
/// route database and the pool.
async fn connect_new(
    chain: &Chain<'_>,
    address: &crate::address::Address,
) -> Result<Arc<PooledConnection>> {
    let ctx = chain.ctx();
    let client = &ctx.client;

    let mut planner_guard = ctx.planner.lock().await;
    let planner_needed = match *planner_guard {
        Some((ref planned_address, _)) => planned_address != address,
        None => true,
    };
    if planner_needed {
        let proxies = client.proxy_selector.select(chain.request().uri());
        let mut planner = RoutePlanner::new(
            address.clone(),
            proxies,
            client.dns.clone(),
            client.route_db.clone(),
        );
        let events = client.events.clone();
        let call_id = ctx.call_id;
        planner.set_dns_observer(move |host, addrs| {
            events.dns_start(call_id, host);
            events.dns_end(call_id, host, addrs);
        });
        *planner_guard = Some((address.clone(), planner));
    }
    let planner = &mut planner_guard.as_mut().expect("planner just set").1;

    let connector = client.connector();
    let mut suppressed: Vec<Error> = Vec::new();

    loop {
        ctx.check_canceled()?;

        let primary = match planner.next().await? {
            Some(route) => route,
            None => {
                let mut err = Error::new_connect(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("exhausted all routes to {}", address.host()),
                ));
                for prior in suppressed {
                    err = err.with_suppressed(prior);
                }
                return Err(err);
            }
        };

        // Fast fallback: line up a second candidate to race.
        let secondary = if client.config.fast_fallback && planner.has_buffered() {
            planner.next().await?
        } else {
            None
        };

        *ctx.last_route.lock().unwrap() = Some(primary.clone());
        ctx.events()
            .connect_start(ctx.call_id, primary.socket_addr);
        if primary.spec.is_tls() {
            ctx.events().secure_connect_start(ctx.call_id);
        }
        let raced = happy::connect_race(
            &connector,
            primary.clone(),
            secondary.clone(),
            client.config.fast_fallback_delay,
        )
        .await;

        let (established, route) = match raced {
            Ok(won) => won,
            Err(err) => {
                debug!("connect failed: {}", err);
                client.route_db.failed(&primary);
                if let Some(secondary) = secondary {
                    client.route_db.failed(&secondary);
                }
                ctx.events()
                    .connect_failed(ctx.call_id, primary.socket_addr, &err);
                suppressed.push(err);
                continue;
            }
        };

        client.route_db.succeeded(&route);
        ctx.events().connect_end(ctx.call_id, route.socket_addr);
        if established.handshake.is_some() {
            ctx.events().secure_connect_end(ctx.call_id);
        }

        let transport = match established.protocol {
            Protocol::Http11 => Transport::H1(H1Socket::new(Buffered::new(
                established.io,
                client.config.read_timeout,
                client.config.write_timeout,
            ))),
            Protocol::Http2 | Protocol::H2PriorKnowledge => {
                let h2config = h2::connection::H2Config {
                    ping_interval: client.config.ping_interval,
                    read_timeout: client.config.read_timeout,
                    write_timeout: client.config.write_timeout,
                    ..h2::connection::H2Config::default()
                };
                let conn = h2::connection::Connection::handshake(established.io, h2config).await?;
                Transport::H2(conn)
            }
        };

        let conn = PooledConnection::new(
            client.pool.next_connection_id(),
            route,
            established.protocol,
            established.handshake,
            transport,
        );

        // Insertion deduplicates coalescable HTTP/2 connections; the call
        // transparently lands on the surviving one.
        return Ok(client.pool.put(conn, &ctx.marker));
    }
}
