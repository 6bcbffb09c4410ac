//! Collaborator interfaces consumed by the engine: DNS, proxy selection,
//! cookies, and authentication. Defaults are provided for each; callbacks
//! run on whichever task is driving the call, never under an engine lock.

use std::net::SocketAddr;

use http::header::HeaderValue;
use http::Uri;

use crate::common::BoxFuture;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;

/// Maps a hostname to an ordered list of peer addresses.
pub trait Dns: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<Vec<SocketAddr>>>;
}

/// The system resolver, via the runtime's blocking DNS.
#[derive(Debug, Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<Vec<SocketAddr>>> {
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
                .await
                .map_err(Error::new_connect)?
                .collect();
            if addrs.is_empty() {
                return Err(Error::new_connect(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses for {}", host),
                )));
            }
            Ok(addrs)
        })
    }
}

/// One proxy option for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    Direct,
    /// An HTTP proxy; https targets tunnel through CONNECT.
    Http { host: String, port: u16 },
}

/// Maps a URI to the proxies to attempt, in order.
pub trait ProxySelector: Send + Sync {
    fn select(&self, uri: &Uri) -> Vec<Proxy>;
}

/// No proxy, ever.
#[derive(Debug, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _uri: &Uri) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// Bidirectional cookie storage.
pub trait CookieJar: Send + Sync {
    /// The `Cookie` header value for a request, if any cookies match.
    fn load(&self, uri: &Uri) -> Option<HeaderValue>;

    /// Receives every `Set-Cookie` value from a response.
    fn save(&self, uri: &Uri, set_cookie: Vec<HeaderValue>);
}

/// A jar that neither stores nor supplies cookies.
#[derive(Debug, Default)]
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn load(&self, _uri: &Uri) -> Option<HeaderValue> {
        None
    }

    fn save(&self, _uri: &Uri, _set_cookie: Vec<HeaderValue>) {}
}

/// Reacts to 401 (and, on proxies, 407) challenges.
///
/// Returning `None` accepts the failure; returning a request retries with
/// credentials attached.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, route: Option<&Route>, response: &Response) -> Option<Request>;
}

/// Gives up on every challenge.
#[derive(Debug, Default)]
pub struct NoAuthentication;

impl Authenticator for NoAuthentication {
    fn authenticate(&self, _route: Option<&Route>, _response: &Response) -> Option<Request> {
        None
    }
}
