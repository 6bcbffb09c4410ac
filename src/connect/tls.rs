//! The TLS collaborator boundary.
//!
//! The engine never touches TLS records: a configured [`TlsConnector`]
//! builds the secure transport and reports what was negotiated. Without
//! one, `https` URLs fail at route planning.

use crate::common::io::BoxedIo;
use crate::common::BoxFuture;
use crate::config::ConnectionSpec;
use crate::config::Protocol;
use crate::error::Result;

/// What a completed TLS handshake negotiated.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub tls_version: String,
    pub cipher_suite: String,
    pub peer_certificates: Vec<PeerCertificate>,
    pub local_certificates: Vec<PeerCertificate>,
}

/// The certificate fields the engine consumes: identity for diagnostics
/// and the SAN set for connection coalescing.
#[derive(Debug, Clone)]
pub struct PeerCertificate {
    pub subject: String,
    pub subject_alternative_names: Vec<String>,
}

impl Handshake {
    /// Whether the peer's leaf certificate covers `host`, honoring
    /// single-label wildcards.
    pub fn covers(&self, host: &str) -> bool {
        let leaf = match self.peer_certificates.first() {
            Some(leaf) => leaf,
            None => return false,
        };
        leaf.subject_alternative_names
            .iter()
            .any(|san| san_matches(san, host))
    }
}

fn san_matches(san: &str, host: &str) -> bool {
    if let Some(suffix) = san.strip_prefix("*.") {
        // One label, then the suffix; no nested-subdomain matches.
        match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        san.eq_ignore_ascii_case(host)
    }
}

/// The secure transport handed back by the collaborator.
pub struct TlsStream {
    pub io: BoxedIo,
    pub handshake: Handshake,
    /// The ALPN-selected protocol, if the collaborator negotiated one.
    pub alpn: Option<Protocol>,
}

/// Builds a secure transport atop an established socket.
pub trait TlsConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        spec: ConnectionSpec,
        alpn: &'a [Protocol],
        io: BoxedIo,
    ) -> BoxFuture<'a, Result<TlsStream>>;
}

/// Validates the peer certificate chain against a pin set, after hostname
/// verification has already passed inside the TLS collaborator.
pub trait CertificatePinner: Send + Sync {
    fn check(&self, host: &str, peer_certificates: &[PeerCertificate]) -> Result<()>;
}
