//! Client connection pooling.
//!
//! One index of live connections serves both protocols: HTTP/1 sockets
//! carry one exchange at a time, HTTP/2 connections multiplex. A
//! background task evicts idle connections past their keep-alive and
//! enforces the idle cap; the same sweep detects leaked allocations.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;

use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::config::Protocol;
use crate::connect::tls::Handshake;
use crate::proto::h1::H1Socket;
use crate::proto::h2;
use crate::route::Route;

/// Held by a call for as long as it is bound to a connection. The pool
/// keeps only a weak reference; a dead weak with the connection still
/// bound means the call leaked.
#[derive(Debug, Default)]
pub(crate) struct CallMarker {
    pub(crate) call_id: u64,
}

/// A live transport plus its protocol engine and pooling state.
pub(crate) struct PooledConnection {
    pub(crate) id: u64,
    pub(crate) route: Route,
    pub(crate) protocol: Protocol,
    pub(crate) handshake: Option<Handshake>,
    pub(crate) transport: Transport,
    state: Mutex<ConnState>,
}

pub(crate) enum Transport {
    H1(H1Socket),
    H2(h2::connection::Connection),
}

struct ConnState {
    allocations: Vec<Weak<CallMarker>>,
    idle_at: Instant,
    no_new_exchanges: bool,
}

impl PooledConnection {
    pub(crate) fn new(
        id: u64,
        route: Route,
        protocol: Protocol,
        handshake: Option<Handshake>,
        transport: Transport,
    ) -> PooledConnection {
        PooledConnection {
            id,
            route,
            protocol,
            handshake,
            transport,
            state: Mutex::new(ConnState {
                allocations: Vec::new(),
                idle_at: Instant::now(),
                no_new_exchanges: false,
            }),
        }
    }

    pub(crate) fn is_healthy(&self) -> bool {
        match self.transport {
            Transport::H1(ref socket) => socket.is_healthy(),
            Transport::H2(ref conn) => conn.is_healthy(),
        }
    }

    /// Whether another exchange may bind right now.
    fn can_carry_new_exchange(&self) -> bool {
        if self.state.lock().unwrap().no_new_exchanges {
            return false;
        }
        match self.transport {
            Transport::H1(ref socket) => socket.is_idle(),
            Transport::H2(ref conn) => conn.can_take_new_exchange(),
        }
    }

    pub(crate) fn set_no_new_exchanges(&self) {
        self.state.lock().unwrap().no_new_exchanges = true;
        if let Transport::H2(ref conn) = self.transport {
            conn.set_no_new_exchanges();
        }
    }

    fn bind(&self, marker: &Arc<CallMarker>) {
        self.state.lock().unwrap().allocations.push(Arc::downgrade(marker));
    }

    fn unbind(&self, marker: &Arc<CallMarker>) {
        let mut state = self.state.lock().unwrap();
        let target = Arc::as_ptr(marker);
        state
            .allocations
            .retain(|weak| weak.as_ptr() != target && weak.upgrade().is_some());
        if state.allocations.is_empty() {
            state.idle_at = Instant::now();
        }
    }

    /// Live allocation count; prunes dead weaks and reports leaks.
    fn prune_allocations(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let before = state.allocations.len();
        state.allocations.retain(|weak| weak.upgrade().is_some());
        let leaked = before - state.allocations.len();
        if leaked > 0 {
            warn!(
                "connection {} leaked by {} call(s); a call was dropped without closing its response body",
                self.id, leaked
            );
            if state.allocations.is_empty() {
                state.idle_at = Instant::now();
            }
        }
        state.allocations.len()
    }

    fn idle_duration(&self, now: Instant) -> Duration {
        now.duration_since(self.state.lock().unwrap().idle_at)
    }

    /// Hard-closes the transport.
    pub(crate) fn close(&self) {
        match self.transport {
            Transport::H1(ref socket) => socket.close(),
            Transport::H2(ref conn) => {
                let conn = conn.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { conn.shutdown().await });
                }
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// The connection pool: an index of live connections plus idle eviction.
#[derive(Clone)]
pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    max_idle: usize,
    keep_alive: Duration,
}

struct PoolState {
    connections: Vec<Arc<PooledConnection>>,
    next_connection_id: u64,
    evictor_running: bool,
}

impl Pool {
    pub(crate) fn new(max_idle: usize, keep_alive: Duration) -> Pool {
        Pool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    next_connection_id: 1,
                    evictor_running: false,
                }),
                max_idle,
                keep_alive,
            }),
        }
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_connection_id;
        state.next_connection_id += 1;
        id
    }

    /// Step 2 of acquisition: a pooled connection whose address matches or
    /// coalesces with `address`, healthy, and able to carry a new exchange.
    pub(crate) fn find(
        &self,
        address: &Address,
        marker: &Arc<CallMarker>,
    ) -> Option<Arc<PooledConnection>> {
        let state = self.shared.state.lock().unwrap();
        for conn in state.connections.iter() {
            if !conn.is_healthy() || !conn.can_carry_new_exchange() {
                continue;
            }
            let exact = conn.route.address == *address;
            let coalesced = !exact
                && conn.protocol.is_multiplexed()
                && conn
                    .handshake
                    .as_ref()
                    .map(|hs| address.coalescable_onto(&conn.route.address, hs))
                    .unwrap_or(false);
            if exact || coalesced {
                trace!(
                    "reusing connection {} for {} (coalesced={})",
                    conn.id,
                    address.host(),
                    coalesced
                );
                conn.bind(marker);
                return Some(conn.clone());
            }
        }
        None
    }

    /// Step 1 of acquisition: re-binds a connection the call already held,
    /// when it can still carry an exchange.
    pub(crate) fn rebind(&self, conn: &Arc<PooledConnection>, marker: &Arc<CallMarker>) -> bool {
        if conn.is_healthy() && conn.can_carry_new_exchange() {
            conn.bind(marker);
            true
        } else {
            false
        }
    }

    /// Inserts a freshly connected connection, deduplicating coalescable
    /// HTTP/2 connections: the first to enter the pool for a peer identity
    /// wins, and the loser is shut down with the call migrating onto the
    /// winner.
    pub(crate) fn put(
        &self,
        conn: PooledConnection,
        marker: &Arc<CallMarker>,
    ) -> Arc<PooledConnection> {
        let (winner, loser) = {
            let mut state = self.shared.state.lock().unwrap();

            let existing = if conn.protocol.is_multiplexed() {
                state
                    .connections
                    .iter()
                    .find(|other| {
                        other.protocol.is_multiplexed()
                            && other.is_healthy()
                            && other.can_carry_new_exchange()
                            && other
                                .handshake
                                .as_ref()
                                .map(|hs| {
                                    conn.route.address.coalescable_onto(&other.route.address, hs)
                                })
                                .unwrap_or(false)
                    })
                    .cloned()
            } else {
                None
            };

            match existing {
                Some(existing) => {
                    debug!(
                        "coalescing: connection {} deduplicated onto {}",
                        conn.id, existing.id
                    );
                    (existing, Some(conn))
                }
                None => {
                    let conn = Arc::new(conn);
                    state.connections.push(conn.clone());
                    (conn, None)
                }
            }
        };

        if let Some(loser) = loser {
            loser.close();
        }
        winner.bind(marker);
        self.ensure_evictor();
        winner
    }

    /// Unbinds a call from its connection, closing the connection when the
    /// exchange left it unusable.
    pub(crate) fn release(
        &self,
        conn: &Arc<PooledConnection>,
        marker: &Arc<CallMarker>,
        reusable: bool,
    ) {
        conn.unbind(marker);
        if !reusable {
            debug!("connection {} not reusable; evicting", conn.id);
            conn.close();
            let mut state = self.shared.state.lock().unwrap();
            state.connections.retain(|c| !Arc::ptr_eq(c, conn));
        }
    }

    /// One eviction sweep. Returns the nanoseconds until the next sweep is
    /// due, 0 to run again immediately, or -1 when the pool is empty.
    pub(crate) fn close_connections(&self, now: Instant) -> i64 {
        let to_close: Option<Arc<PooledConnection>>;
        let result: i64;

        {
            let mut state = self.shared.state.lock().unwrap();

            // Unhealthy connections leave the index outright.
            state.connections.retain(|conn| {
                if conn.is_healthy() {
                    true
                } else {
                    trace!("dropping unhealthy connection {}", conn.id);
                    conn.close();
                    false
                }
            });

            let mut in_use = 0usize;
            let mut idle = 0usize;
            let mut longest: Option<(Duration, Arc<PooledConnection>)> = None;

            for conn in state.connections.iter() {
                if conn.prune_allocations() > 0 {
                    in_use += 1;
                    continue;
                }
                idle += 1;
                let idle_for = conn.idle_duration(now);
                if longest.as_ref().map(|(d, _)| idle_for > *d).unwrap_or(true) {
                    longest = Some((idle_for, conn.clone()));
                }
            }

            if let Some((idle_for, conn)) = longest {
                if idle_for >= self.shared.keep_alive || idle > self.shared.max_idle {
                    state.connections.retain(|c| !Arc::ptr_eq(c, &conn));
                    to_close = Some(conn);
                    result = 0;
                } else {
                    to_close = None;
                    result = (self.shared.keep_alive - idle_for).as_nanos() as i64;
                }
            } else if in_use > 0 {
                to_close = None;
                result = self.shared.keep_alive.as_nanos() as i64;
            } else {
                to_close = None;
                result = -1;
            }
        }

        if let Some(conn) = to_close {
            debug!("evicting idle connection {}", conn.id);
            conn.close();
        }
        result
    }

    /// Starts the eviction task if it is not already running.
    pub(crate) fn ensure_evictor(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.evictor_running {
                return;
            }
            state.evictor_running = true;
        }

        let pool = self.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                loop {
                    let wait = pool.close_connections(Instant::now());
                    if wait < 0 {
                        pool.shared.state.lock().unwrap().evictor_running = false;
                        return;
                    }
                    if wait > 0 {
                        tokio::time::sleep(Duration::from_nanos(wait as u64)).await;
                    }
                }
            });
        } else {
            self.shared.state.lock().unwrap().evictor_running = false;
        }
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.shared.state.lock().unwrap().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Proxy;
    use crate::config::ConnectionSpec;
    use crate::connect::tls::PeerCertificate;

    fn test_address(host: &str) -> Address {
        Address::new(
            &format!("https://{}/", host).parse().unwrap(),
            1,
            1,
            1,
            1,
            vec![Protocol::Http2, Protocol::Http11],
            vec![ConnectionSpec::ModernTls],
        )
    }

    fn test_route(host: &str) -> Route {
        Route {
            address: test_address(host),
            proxy: Proxy::Direct,
            socket_addr: "127.0.0.1:443".parse().unwrap(),
            spec: ConnectionSpec::ModernTls,
        }
    }

    fn h1_connection(pool: &Pool, host: &str) -> PooledConnection {
        let (client, _server) = tokio::io::duplex(1024);
        let buffered = crate::proto::h1::io_for_tests(client);
        PooledConnection::new(
            pool.next_connection_id(),
            test_route(host),
            Protocol::Http11,
            Some(Handshake {
                tls_version: "TLSv1.3".into(),
                cipher_suite: "TLS_AES_128_GCM_SHA256".into(),
                peer_certificates: vec![PeerCertificate {
                    subject: "cn=test".into(),
                    subject_alternative_names: vec![host.to_string()],
                }],
                local_certificates: Vec::new(),
            }),
            Transport::H1(H1Socket::new(buffered)),
        )
    }

    #[tokio::test]
    async fn find_reuses_matching_idle_connection() {
        let pool = Pool::new(5, Duration::from_secs(300));
        let marker = Arc::new(CallMarker::default());
        let conn = pool.put(h1_connection(&pool, "a.example"), &marker);
        pool.release(&conn, &marker, true);

        let marker2 = Arc::new(CallMarker::default());
        let found = pool.find(&test_address("a.example"), &marker2).unwrap();
        assert_eq!(found.id, conn.id);

        // An HTTP/1 connection never matches a different address.
        assert!(pool.find(&test_address("b.example"), &marker2).is_none());
    }

    #[tokio::test]
    async fn close_connections_math() {
        tokio::time::pause();
        let keep_alive = Duration::from_secs(60);
        let pool = Pool::new(5, keep_alive);

        // Empty pool: nothing to do.
        assert_eq!(pool.close_connections(Instant::now()), -1);

        let marker = Arc::new(CallMarker::default());
        let conn = pool.put(h1_connection(&pool, "a.example"), &marker);

        // In use: check back after a full keep-alive.
        assert_eq!(
            pool.close_connections(Instant::now()),
            keep_alive.as_nanos() as i64
        );

        pool.release(&conn, &marker, true);
        let now = Instant::now();

        // Idle for t < K: not evicted, next check in K - t.
        tokio::time::advance(Duration::from_secs(10)).await;
        let wait = pool.close_connections(Instant::now());
        assert!(wait > 0);
        assert!(wait <= (keep_alive - Duration::from_secs(10)).as_nanos() as i64);
        assert_eq!(pool.connection_count(), 1);

        // Idle for t >= K: evicted.
        tokio::time::advance(keep_alive).await;
        assert_eq!(pool.close_connections(Instant::now()), 0);
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.close_connections(now), -1);
    }

    #[tokio::test]
    async fn idle_overflow_evicts_longest_idle() {
        tokio::time::pause();
        let pool = Pool::new(1, Duration::from_secs(300));

        let marker = Arc::new(CallMarker::default());
        let first = pool.put(h1_connection(&pool, "a.example"), &marker);
        pool.release(&first, &marker, true);

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = pool.put(h1_connection(&pool, "b.example"), &marker);
        pool.release(&second, &marker, true);

        // Two idle, cap is one: the longest-idle (first) goes.
        assert_eq!(pool.close_connections(Instant::now()), 0);
        assert_eq!(pool.connection_count(), 1);
        let survivor = pool.find(&test_address("b.example"), &marker);
        assert!(survivor.is_some());
    }

    #[tokio::test]
    async fn coalescable_h2_connections_deduplicate_on_put() {
        // A handshake over a quiet pipe is enough for pool accounting:
        // the reader simply never hears back. The server halves must stay
        // alive or the connections fail with EOF.
        async fn h2_conn(
            pool: &Pool,
            host: &str,
            sans: &[&str],
        ) -> (PooledConnection, tokio::io::DuplexStream) {
            let (client_io, server_io) = tokio::io::duplex(256 * 1024);
            let conn = crate::proto::h2::connection::Connection::handshake(
                crate::common::io::BoxedIo::new(client_io),
                crate::proto::h2::connection::H2Config::default(),
            )
            .await
            .unwrap();
            let pooled = PooledConnection::new(
                pool.next_connection_id(),
                test_route(host),
                Protocol::Http2,
                Some(Handshake {
                    tls_version: "TLSv1.3".into(),
                    cipher_suite: "TLS_AES_128_GCM_SHA256".into(),
                    peer_certificates: vec![PeerCertificate {
                        subject: "cn=shared".into(),
                        subject_alternative_names: sans.iter().map(|s| s.to_string()).collect(),
                    }],
                    local_certificates: Vec::new(),
                }),
                Transport::H2(conn),
            );
            (pooled, server_io)
        }

        let pool = Pool::new(5, Duration::from_secs(300));
        let sans = ["a.example", "b.example"];

        let marker_a = Arc::new(CallMarker::default());
        let (conn_a, _keep_a) = h2_conn(&pool, "a.example", &sans).await;
        let first = pool.put(conn_a, &marker_a);

        // A racing connect for the coalescable host collapses onto the
        // first connection to have entered the pool.
        let marker_b = Arc::new(CallMarker::default());
        let (conn_b, _keep_b) = h2_conn(&pool, "b.example", &sans).await;
        let second = pool.put(conn_b, &marker_b);
        assert_eq!(second.id, first.id);
        assert_eq!(pool.connection_count(), 1);

        // And a later lookup for the other host finds it too.
        let marker_c = Arc::new(CallMarker::default());
        let found = pool.find(&test_address("b.example"), &marker_c).unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn leaked_allocation_detected() {
        let pool = Pool::new(5, Duration::from_secs(300));
        let marker = Arc::new(CallMarker::default());
        let _conn = pool.put(h1_connection(&pool, "a.example"), &marker);

        // The call vanishes without releasing.
        drop(marker);

        // The sweep prunes the dead weak and the connection counts as
        // idle again.
        let wait = pool.close_connections(Instant::now());
        assert!(wait > 0);
    }
}
