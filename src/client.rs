//! The client facade: an immutable configuration record plus shared
//! engine state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::Uri;

use crate::address::{identity_of, Address};
use crate::call::{build_pipeline, Call};
use crate::collab::{
    Authenticator, CookieJar, Dns, NoAuthentication, NoCookies, NoProxy, ProxySelector, SystemDns,
};
use crate::config::Config;
use crate::connect::tls::{CertificatePinner, TlsConnector};
use crate::connect::Connector;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::event::{EventListener, NoEvents};
use crate::interceptor::Interceptor;
use crate::pool::Pool;
use crate::request::Request;
use crate::response::Response;
use crate::route::RouteDatabase;

/// Everything a call needs, shared by reference across clones.
pub(crate) struct ClientRef {
    pub(crate) config: Config,
    pub(crate) pool: Pool,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) route_db: Arc<RouteDatabase>,
    pub(crate) dns: Arc<dyn Dns>,
    pub(crate) proxy_selector: Arc<dyn ProxySelector>,
    pub(crate) cookie_jar: Arc<dyn CookieJar>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) proxy_authenticator: Arc<dyn Authenticator>,
    pub(crate) events: Arc<dyn EventListener>,
    pub(crate) tls: Option<Arc<dyn TlsConnector>>,
    pub(crate) pinner: Option<Arc<dyn CertificatePinner>>,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) network_interceptors: Vec<Arc<dyn Interceptor>>,
    pipeline: Vec<Arc<dyn Interceptor>>,
    call_ids: AtomicU64,
}

impl ClientRef {
    pub(crate) fn next_call_id(&self) -> u64 {
        self.call_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn pipeline(&self) -> Vec<Arc<dyn Interceptor>> {
        self.pipeline.clone()
    }

    /// The connection-sharing equivalence class for a request URI.
    pub(crate) fn address_for(&self, uri: &Uri) -> Address {
        Address::new(
            uri,
            identity_of(Some(&self.dns)),
            identity_of(Some(&self.proxy_selector)),
            self.tls.as_ref().map(|t| identity_of(Some(t))).unwrap_or(0),
            identity_of(Some(&self.authenticator)),
            self.config.protocols.clone(),
            self.config.connection_specs.clone(),
        )
    }

    pub(crate) fn connector(&self) -> Connector {
        Connector {
            tls: self.tls.clone(),
            pinner: self.pinner.clone(),
            proxy_authenticator: self.proxy_authenticator.clone(),
            connect_timeout: self.config.connect_timeout,
            read_timeout: self.config.read_timeout,
            write_timeout: self.config.write_timeout,
            protocols: self.config.protocols.clone(),
        }
    }
}

/// An HTTP client: a call factory.
///
/// Cloning shares the pool and dispatcher; deriving through
/// [`HttpClient::to_builder`] shares them too, and forks the route
/// database only when routing-relevant configuration changes.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientRef>,
}

impl HttpClient {
    pub fn new() -> HttpClient {
        HttpClient::builder().build().expect("default config is valid")
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// A builder seeded with this client's configuration, sharing its
    /// pool and dispatcher.
    pub fn to_builder(&self) -> ClientBuilder {
        ClientBuilder {
            config: self.inner.config.clone(),
            dns: self.inner.dns.clone(),
            proxy_selector: self.inner.proxy_selector.clone(),
            cookie_jar: self.inner.cookie_jar.clone(),
            authenticator: self.inner.authenticator.clone(),
            proxy_authenticator: self.inner.proxy_authenticator.clone(),
            events: self.inner.events.clone(),
            tls: self.inner.tls.clone(),
            pinner: self.inner.pinner.clone(),
            interceptors: self.inner.interceptors.clone(),
            network_interceptors: self.inner.network_interceptors.clone(),
            shared: Some((
                self.inner.pool.clone(),
                self.inner.dispatcher.clone(),
                self.inner.route_db.clone(),
            )),
            routing_changed: false,
        }
    }

    /// Creates a call for `request`. Nothing happens until it executes.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.inner.clone(), request)
    }

    #[cfg(test)]
    pub(crate) fn inner_for_tests(&self) -> Arc<ClientRef> {
        self.inner.clone()
    }

    /// Convenience: create and execute in one step.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.new_call(request).execute().await
    }

    /// Stops accepting new asynchronous calls.
    pub fn shutdown_dispatcher(&self) {
        self.inner.dispatcher.shutdown();
    }

    /// Invoked whenever the dispatcher's queues become empty.
    pub fn set_idle_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.dispatcher.set_idle_callback(Some(Arc::new(callback)));
    }

    pub fn running_calls(&self) -> usize {
        self.inner.dispatcher.running_calls()
    }

    pub fn queued_calls(&self) -> usize {
        self.inner.dispatcher.queued_calls()
    }
}

impl Default for HttpClient {
    fn default() -> HttpClient {
        HttpClient::new()
    }
}

/// Builds an [`HttpClient`].
pub struct ClientBuilder {
    config: Config,
    dns: Arc<dyn Dns>,
    proxy_selector: Arc<dyn ProxySelector>,
    cookie_jar: Arc<dyn CookieJar>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    events: Arc<dyn EventListener>,
    tls: Option<Arc<dyn TlsConnector>>,
    pinner: Option<Arc<dyn CertificatePinner>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    /// Pool, dispatcher and route database inherited from a source client.
    shared: Option<(Pool, Dispatcher, Arc<RouteDatabase>)>,
    /// Set when a change invalidates remembered route failures.
    routing_changed: bool,
}

impl ClientBuilder {
    fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config::default(),
            dns: Arc::new(SystemDns),
            proxy_selector: Arc::new(NoProxy),
            cookie_jar: Arc::new(NoCookies),
            authenticator: Arc::new(NoAuthentication),
            proxy_authenticator: Arc::new(NoAuthentication),
            events: Arc::new(NoEvents),
            tls: None,
            pinner: None,
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            shared: None,
            routing_changed: false,
        }
    }

    pub fn call_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.ping_interval = Some(interval);
        self
    }

    pub fn retry_on_connection_failure(mut self, retry: bool) -> Self {
        self.config.retry_on_connection_failure = retry;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn follow_tls_redirects(mut self, follow: bool) -> Self {
        self.config.follow_tls_redirects = follow;
        self
    }

    pub fn max_requests(mut self, max: usize) -> Self {
        self.config.max_requests = max;
        self
    }

    pub fn max_requests_per_host(mut self, max: usize) -> Self {
        self.config.max_requests_per_host = max;
        self
    }

    pub fn protocols(mut self, protocols: Vec<crate::config::Protocol>) -> Self {
        self.config.protocols = protocols;
        self.routing_changed = true;
        self
    }

    pub fn connection_specs(mut self, specs: Vec<crate::config::ConnectionSpec>) -> Self {
        self.config.connection_specs = specs;
        self.routing_changed = true;
        self
    }

    pub fn fast_fallback(mut self, enabled: bool) -> Self {
        self.config.fast_fallback = enabled;
        self
    }

    pub fn max_idle_connections(mut self, max: usize) -> Self {
        self.config.max_idle_connections = max;
        self
    }

    pub fn keep_alive(mut self, keep_alive: std::time::Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = dns;
        self.routing_changed = true;
        self
    }

    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = selector;
        self.routing_changed = true;
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = jar;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self.routing_changed = true;
        self
    }

    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.proxy_authenticator = authenticator;
        self
    }

    pub fn event_listener(mut self, events: Arc<dyn EventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn tls_connector(mut self, tls: Arc<dyn TlsConnector>) -> Self {
        self.tls = Some(tls);
        self.routing_changed = true;
        self
    }

    pub fn certificate_pinner(mut self, pinner: Arc<dyn CertificatePinner>) -> Self {
        self.pinner = Some(pinner);
        self.routing_changed = true;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        self.config
            .validate()
            .map_err(|msg| Error::new_connect(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                msg,
            )))?;

        let (pool, dispatcher, route_db) = match self.shared {
            Some((pool, dispatcher, route_db)) => {
                // Routing-relevant changes fork the failure memory.
                let route_db = if self.routing_changed {
                    Arc::new(RouteDatabase::default())
                } else {
                    route_db
                };
                (pool, dispatcher, route_db)
            }
            None => (
                Pool::new(self.config.max_idle_connections, self.config.keep_alive),
                Dispatcher::new(self.config.max_requests, self.config.max_requests_per_host),
                Arc::new(RouteDatabase::default()),
            ),
        };

        let pipeline = build_pipeline(&self.interceptors, &self.network_interceptors);

        Ok(HttpClient {
            inner: Arc::new(ClientRef {
                config: self.config,
                pool,
                dispatcher,
                route_db,
                dns: self.dns,
                proxy_selector: self.proxy_selector,
                cookie_jar: self.cookie_jar,
                authenticator: self.authenticator,
                proxy_authenticator: self.proxy_authenticator,
                events: self.events,
                tls: self.tls,
                pinner: self.pinner,
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                pipeline,
                call_ids: AtomicU64::new(0),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_pool_and_dispatcher() {
        let client = HttpClient::new();
        let clone = client.clone();
        assert!(Arc::ptr_eq(&client.inner, &clone.inner));
    }

    #[test]
    fn derived_builder_forks_route_db_on_routing_change() {
        let client = HttpClient::new();
        let same = client.to_builder().build().unwrap();
        assert!(Arc::ptr_eq(&client.inner.route_db, &same.inner.route_db));

        let changed = client
            .to_builder()
            .protocols(vec![crate::config::Protocol::Http11])
            .build()
            .unwrap();
        assert!(!Arc::ptr_eq(&client.inner.route_db, &changed.inner.route_db));
    }

    #[test]
    fn invalid_config_rejected() {
        let result = HttpClient::builder()
            .protocols(vec![
                crate::config::Protocol::H2PriorKnowledge,
                crate::config::Protocol::Http11,
            ])
            .build();
        assert!(result.is_err());
    }
}
