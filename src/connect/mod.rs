//! Establishing physical connections: TCP, proxy tunnels, TLS, and
//! protocol selection.

pub(crate) mod happy;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use http::Method;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::collab::{Authenticator, Proxy};
use crate::common::io::BoxedIo;
use crate::config::Protocol;
use crate::error::{Error, Result, TimeoutKind};
use crate::proto::h1;
use crate::request::Request;
use crate::response::{Response, ResponseBody, ResponseParts};
use crate::route::Route;

use self::tls::{CertificatePinner, Handshake, TlsConnector};

/// Proxy-authentication round trips allowed for one tunnel.
const MAX_TUNNEL_ATTEMPTS: usize = 21;

/// An established transport, ready for a protocol engine.
pub(crate) struct Established {
    pub(crate) io: BoxedIo,
    pub(crate) protocol: Protocol,
    pub(crate) handshake: Option<Handshake>,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("protocol", &self.protocol)
            .field("handshake", &self.handshake)
            .finish()
    }
}

/// Connects routes. Cheap to clone; the fast-fallback race runs two of
/// these concurrently.
#[derive(Clone)]
pub(crate) struct Connector {
    pub(crate) tls: Option<Arc<dyn TlsConnector>>,
    pub(crate) pinner: Option<Arc<dyn CertificatePinner>>,
    pub(crate) proxy_authenticator: Arc<dyn Authenticator>,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) protocols: Vec<Protocol>,
}

impl Connector {
    /// Opens the socket, tunnels through a proxy when one is interposed,
    /// and runs the TLS handshake for secure routes.
    pub(crate) async fn connect(&self, route: &Route) -> Result<Established> {
        trace!("connecting {:?}", route.socket_addr);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(route.socket_addr))
            .await
            .map_err(|_| Error::new_timeout(TimeoutKind::Connect))?
            .map_err(|e| {
                Error::new_connect(std::io::Error::new(
                    e.kind(),
                    format!("{} connecting to {}", e, route.socket_addr),
                ))
            })?;
        let _ = tcp.set_nodelay(true);
        let mut io = BoxedIo::new(tcp);

        if matches!(route.proxy, Proxy::Http { .. }) && route.address.is_https() {
            io = self.tunnel(io, route).await?;
        }

        if route.spec.is_tls() {
            let connector = self
                .tls
                .clone()
                .ok_or_else(|| Error::new_tls(no_tls_error()))?;

            let handshake_fut =
                connector.connect(route.address.host(), route.spec, &self.protocols, io);
            let stream = tokio::time::timeout(self.connect_timeout, handshake_fut)
                .await
                .map_err(|_| Error::new_timeout(TimeoutKind::Connect))??;

            if let Some(ref pinner) = self.pinner {
                pinner.check(route.address.host(), &stream.handshake.peer_certificates)?;
            }

            // The collaborator only ever negotiates what we offered.
            let protocol = match stream.alpn {
                Some(protocol) if self.protocols.contains(&protocol) => protocol,
                Some(_) | None => Protocol::Http11,
            };

            debug!(
                "secure connect to {} negotiated {:?}",
                route.address.host(),
                protocol
            );
            return Ok(Established {
                io: stream.io,
                protocol,
                handshake: Some(stream.handshake),
            });
        }

        // Cleartext: HTTP/2 happens only by prior knowledge.
        let protocol = if self.protocols == [Protocol::H2PriorKnowledge] {
            Protocol::H2PriorKnowledge
        } else {
            Protocol::Http11
        };
        Ok(Established {
            io,
            protocol,
            handshake: None,
        })
    }

    /// Issues CONNECT requests until the proxy opens the tunnel, feeding
    /// 407 challenges to the proxy authenticator, at most
    /// `MAX_TUNNEL_ATTEMPTS` times.
    async fn tunnel(&self, io: BoxedIo, route: &Route) -> Result<BoxedIo> {
        let target = format!("{}:{}", route.address.host(), route.address.port());
        let tunnel_uri: http::Uri = format!("https://{}/", target)
            .parse()
            .map_err(|_| Error::new_user_scheme())?;

        let mut request = Request::builder()
            .method(Method::CONNECT)
            .uri(tunnel_uri)
            .set_header("host", target.as_str())
            .build()?;

        let mut buffered = h1::Buffered::new(io, self.read_timeout, self.write_timeout);

        for attempt in 0..MAX_TUNNEL_ATTEMPTS {
            trace!("tunnel attempt {} to {}", attempt + 1, target);

            let mut dst = BytesMut::new();
            write_connect_head(&request, &target, &mut dst);
            buffered.buffer(&dst);
            buffered.flush().await?;

            let head = loop {
                if let Some(head) = h1::parse_response_head(buffered.read_buf_mut())? {
                    break head;
                }
                if buffered.read_buf().len() > h1::MAX_HEAD_SIZE {
                    return Err(Error::new_too_large());
                }
                if buffered.fill().await? == 0 {
                    return Err(Error::new_connection_closed());
                }
            };

            match head.status.as_u16() {
                200 => {
                    let (io, leftover) = buffered.into_parts();
                    if !leftover.is_empty() {
                        // Data before the tunnel is open is nonsense.
                        return Err(Error::new_status_line());
                    }
                    return Ok(io);
                }
                407 => {
                    // Skip any challenge body so the next CONNECT starts
                    // at a clean frame boundary.
                    let body_len = head
                        .headers
                        .get(http::header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0);
                    let mut remaining = body_len;
                    while remaining > 0 {
                        let chunk = buffered.read_chunk(remaining as usize).await?;
                        if chunk.is_empty() {
                            return Err(Error::new_connection_closed());
                        }
                        remaining -= chunk.len() as u64;
                    }

                    let challenge = Response::from_parts(ResponseParts {
                        status: head.status,
                        reason: head.reason,
                        protocol: Protocol::Http11,
                        headers: head.headers,
                        body: ResponseBody::empty(),
                        handshake: None,
                        sent_at: std::time::Instant::now(),
                        received_at: std::time::Instant::now(),
                        request: request.clone(),
                        upgrade: None,
                    });
                    match self.proxy_authenticator.authenticate(Some(route), &challenge) {
                        Some(with_credentials) => request = with_credentials,
                        None => {
                            return Err(Error::new_connect(std::io::Error::new(
                                std::io::ErrorKind::PermissionDenied,
                                "proxy authentication required",
                            )))
                        }
                    }
                }
                other => {
                    return Err(Error::new_connect(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        format!("proxy refused tunnel: {}", other),
                    )))
                }
            }
        }

        Err(Error::new_connect(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "too many proxy authentication attempts",
        )))
    }
}

/// CONNECT uses the authority-form target, not a path.
fn write_connect_head(request: &Request, target: &str, dst: &mut BytesMut) {
    dst.extend_from_slice(b"CONNECT ");
    dst.extend_from_slice(target.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in request.headers().iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

fn no_tls_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "https requires a TLS collaborator",
    )
}
