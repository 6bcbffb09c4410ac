//! Route planning: proxy selection, DNS resolution, and connection-spec
//! pairing, yielding one candidate route at a time.

mod db;

pub(crate) use self::db::RouteDatabase;

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::address::Address;
use crate::collab::{Dns, Proxy};
use crate::config::ConnectionSpec;
use crate::error::Result;

/// One concrete way to reach an address: a proxy decision, a resolved peer
/// socket address, and the TLS spec to offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub address: Address,
    pub proxy: Proxy,
    pub socket_addr: std::net::SocketAddr,
    pub spec: ConnectionSpec,
}

/// Lazily produces the route sequence for one address.
///
/// Routes the database remembers as recently failed are pushed to the back
/// of the sequence: still attempted, but only after every fresh route.
pub(crate) struct RoutePlanner {
    address: Address,
    proxies: VecDeque<Proxy>,
    dns: Arc<dyn Dns>,
    db: Arc<RouteDatabase>,
    /// Routes resolved from the current proxy, ready to yield.
    planned: VecDeque<Route>,
    /// Recently-failed routes, yielded once everything else is exhausted.
    postponed: VecDeque<Route>,
    /// Observer hook for DNS lifecycle events.
    on_dns: Option<Box<dyn Fn(&str, &[std::net::SocketAddr]) + Send>>,
}

impl RoutePlanner {
    pub(crate) fn new(
        address: Address,
        proxies: Vec<Proxy>,
        dns: Arc<dyn Dns>,
        db: Arc<RouteDatabase>,
    ) -> RoutePlanner {
        RoutePlanner {
            address,
            proxies: proxies.into(),
            dns,
            db,
            planned: VecDeque::new(),
            postponed: VecDeque::new(),
            on_dns: None,
        }
    }

    pub(crate) fn set_dns_observer<F>(&mut self, f: F)
    where
        F: Fn(&str, &[std::net::SocketAddr]) + Send + 'static,
    {
        self.on_dns = Some(Box::new(f));
    }

    /// The specs applicable to this address: the configured TLS specs for
    /// https, cleartext alone for http. Cleartext is never a TLS fallback.
    fn applicable_specs(&self) -> Vec<ConnectionSpec> {
        if self.address.is_https() {
            self.address
                .connection_specs()
                .iter()
                .filter(|spec| spec.is_tls())
                .copied()
                .collect()
        } else {
            vec![ConnectionSpec::Cleartext]
        }
    }

    /// The next route to try, or `None` when every candidate is exhausted.
    pub(crate) async fn next(&mut self) -> Result<Option<Route>> {
        loop {
            if let Some(route) = self.planned.pop_front() {
                return Ok(Some(route));
            }

            let proxy = match self.proxies.pop_front() {
                Some(proxy) => proxy,
                None => return Ok(self.postponed.pop_front()),
            };

            // DNS resolves the proxy when one is interposed, else the
            // target host.
            let (host, port) = match proxy {
                Proxy::Direct => (self.address.host().to_string(), self.address.port()),
                Proxy::Http { ref host, port } => (host.clone(), port),
            };

            let addrs = self.dns.resolve(&host, port).await?;
            if let Some(ref observer) = self.on_dns {
                observer(&host, &addrs);
            }
            debug!("resolved {} to {} addresses", host, addrs.len());

            let specs = self.applicable_specs();
            for addr in addrs {
                for spec in &specs {
                    let route = Route {
                        address: self.address.clone(),
                        proxy: proxy.clone(),
                        socket_addr: addr,
                        spec: *spec,
                    };
                    if self.db.is_recently_failed(&route) {
                        self.postponed.push_back(route);
                    } else {
                        self.planned.push_back(route);
                    }
                }
            }
        }
    }

    /// Whether another candidate remains without doing more resolution.
    pub(crate) fn has_buffered(&self) -> bool {
        !self.planned.is_empty() || !self.postponed.is_empty() || !self.proxies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BoxFuture;
    use crate::config::Protocol;
    use std::net::SocketAddr;

    struct FixedDns(Vec<SocketAddr>);

    impl Dns for FixedDns {
        fn resolve<'a>(
            &'a self,
            _host: &'a str,
            _port: u16,
        ) -> BoxFuture<'a, Result<Vec<SocketAddr>>> {
            let addrs = self.0.clone();
            Box::pin(async move { Ok(addrs) })
        }
    }

    fn https_address() -> Address {
        Address::new(
            &"https://example.com/".parse().unwrap(),
            1,
            1,
            1,
            1,
            vec![Protocol::Http2, Protocol::Http11],
            vec![ConnectionSpec::ModernTls, ConnectionSpec::CompatibleTls],
        )
    }

    async fn all_routes(planner: &mut RoutePlanner) -> Vec<Route> {
        let mut out = Vec::new();
        while let Some(route) = planner.next().await.unwrap() {
            out.push(route);
        }
        out
    }

    #[tokio::test]
    async fn pairs_each_ip_with_each_tls_spec() {
        let dns = Arc::new(FixedDns(vec![
            "10.0.0.1:443".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
        ]));
        let db = Arc::new(RouteDatabase::default());
        let mut planner =
            RoutePlanner::new(https_address(), vec![Proxy::Direct], dns, db);

        let routes = all_routes(&mut planner).await;
        assert_eq!(routes.len(), 4);
        // Spec fallback for one address comes before the next address.
        assert_eq!(routes[0].spec, ConnectionSpec::ModernTls);
        assert_eq!(routes[1].spec, ConnectionSpec::CompatibleTls);
        assert_eq!(routes[0].socket_addr, routes[1].socket_addr);
        assert_ne!(routes[1].socket_addr, routes[2].socket_addr);
    }

    #[tokio::test]
    async fn failed_routes_move_to_the_back() {
        let dns = Arc::new(FixedDns(vec![
            "10.0.0.1:443".parse().unwrap(),
            "10.0.0.2:443".parse().unwrap(),
        ]));
        let db = Arc::new(RouteDatabase::default());

        // Mark the first ip's modern route as recently failed.
        {
            let mut probe =
                RoutePlanner::new(https_address(), vec![Proxy::Direct], dns.clone(), db.clone());
            let first = probe.next().await.unwrap().unwrap();
            db.failed(&first);
        }

        let mut planner = RoutePlanner::new(https_address(), vec![Proxy::Direct], dns, db);
        let routes = all_routes(&mut planner).await;
        assert_eq!(routes.len(), 4);
        // The failed route is attempted last.
        let last = routes.last().unwrap();
        assert_eq!(last.socket_addr, "10.0.0.1:443".parse().unwrap());
        assert_eq!(last.spec, ConnectionSpec::ModernTls);
    }

    #[tokio::test]
    async fn cleartext_for_http_only() {
        let dns = Arc::new(FixedDns(vec!["10.0.0.1:80".parse().unwrap()]));
        let db = Arc::new(RouteDatabase::default());
        let address = Address::new(
            &"http://example.com/".parse().unwrap(),
            1,
            1,
            1,
            1,
            vec![Protocol::Http11],
            vec![
                ConnectionSpec::ModernTls,
                ConnectionSpec::CompatibleTls,
                ConnectionSpec::Cleartext,
            ],
        );
        let mut planner = RoutePlanner::new(address, vec![Proxy::Direct], dns, db);
        let routes = all_routes(&mut planner).await;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].spec, ConnectionSpec::Cleartext);
    }
}
