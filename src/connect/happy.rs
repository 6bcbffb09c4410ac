//! Fast fallback: racing two connect attempts.
//!
//! When several routes are available, a secondary attempt starts after a
//! short stagger while the first is still in flight. The first attempt to
//! complete wins; the loser is aborted and its socket dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::route::Route;

use super::{Connector, Established};

/// Connects `primary`, optionally racing `secondary` after `delay`.
///
/// On failure the error carries every attempt's failure: the last one
/// surfaced, the rest suppressed.
pub(crate) async fn connect_race(
    connector: &Connector,
    primary: Route,
    secondary: Option<Route>,
    delay: Duration,
) -> Result<(Established, Route)> {
    let attempts = 1 + secondary.is_some() as usize;
    let (tx, mut rx) = mpsc::channel::<(Route, Result<Established>)>(attempts);

    let mut tasks = Vec::with_capacity(attempts);
    {
        let connector = connector.clone();
        let tx = tx.clone();
        let route = primary;
        tasks.push(tokio::spawn(async move {
            let result = connector.connect(&route).await;
            let _ = tx.send((route, result)).await;
        }));
    }
    if let Some(route) = secondary {
        let connector = connector.clone();
        let tx = tx.clone();
        let stagger = delay;
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(stagger).await;
            trace!("starting fallback connect to {}", route.socket_addr);
            let result = connector.connect(&route).await;
            let _ = tx.send((route, result)).await;
        }));
    }
    drop(tx);

    let mut failures: Vec<(Route, Error)> = Vec::new();
    while let Some((route, result)) = rx.recv().await {
        match result {
            Ok(established) => {
                // Losers are canceled; their sockets close on drop.
                for task in &tasks {
                    task.abort();
                }
                debug!("connect race won by {}", route.socket_addr);
                return Ok((established, route));
            }
            Err(err) => failures.push((route, err)),
        }
    }

    let (_, mut surfaced) = failures.pop().expect("at least one attempt ran");
    for (_, prior) in failures {
        surfaced = surfaced.with_suppressed(prior);
    }
    Err(surfaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::collab::{NoAuthentication, Proxy};
    use crate::config::{ConnectionSpec, Protocol};
    use std::sync::Arc;

    fn connector() -> Connector {
        Connector {
            tls: None,
            pinner: None,
            proxy_authenticator: Arc::new(NoAuthentication),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            protocols: vec![Protocol::Http11],
        }
    }

    fn route_to(addr: std::net::SocketAddr) -> Route {
        Route {
            address: Address::new(
                &"http://example.com/".parse().unwrap(),
                0,
                0,
                0,
                0,
                vec![Protocol::Http11],
                vec![ConnectionSpec::Cleartext],
            ),
            proxy: Proxy::Direct,
            socket_addr: addr,
            spec: ConnectionSpec::Cleartext,
        }
    }

    #[tokio::test]
    async fn fallback_wins_when_primary_is_dead() {
        // A listener that accepts gives the fallback a sure win; the
        // primary targets a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let dead = "127.0.0.1:1".parse().unwrap();
        let (established, route) = connect_race(
            &connector(),
            route_to(dead),
            Some(route_to(good)),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(route.socket_addr, good);
        assert_eq!(established.protocol, Protocol::Http11);
    }

    #[tokio::test]
    async fn both_failing_attaches_suppressed() {
        let dead_a = route_to("127.0.0.1:1".parse().unwrap());
        let dead_b = route_to("127.0.0.1:2".parse().unwrap());

        let err = connect_race(&connector(), dead_a, Some(dead_b), Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err.suppressed().len(), 1);
    }
}
