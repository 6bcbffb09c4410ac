//! The equivalence class that governs connection sharing.

use std::sync::Arc;

use http::Uri;

use crate::config::{ConnectionSpec, Protocol};
use crate::connect::tls::Handshake;

/// Everything that must match for two calls to share a connection.
///
/// Collaborators are compared by identity: swapping the DNS resolver or the
/// TLS configuration produces a different address even for the same URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    https: bool,
    host: String,
    port: u16,
    dns_identity: usize,
    proxy_identity: usize,
    tls_identity: usize,
    authenticator_identity: usize,
    protocols: Vec<Protocol>,
    connection_specs: Vec<ConnectionSpec>,
}

/// Identity of an `Arc`-held collaborator, 0 when absent.
pub(crate) fn identity_of<T: ?Sized>(arc: Option<&Arc<T>>) -> usize {
    arc.map(|a| Arc::as_ptr(a) as *const () as usize).unwrap_or(0)
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        uri: &Uri,
        dns_identity: usize,
        proxy_identity: usize,
        tls_identity: usize,
        authenticator_identity: usize,
        protocols: Vec<Protocol>,
        connection_specs: Vec<ConnectionSpec>,
    ) -> Address {
        let https = uri.scheme_str() == Some("https");
        Address {
            https,
            host: uri.host().unwrap_or_default().to_string(),
            port: uri.port_u16().unwrap_or(if https { 443 } else { 80 }),
            dns_identity,
            proxy_identity,
            tls_identity,
            authenticator_identity,
            protocols,
            connection_specs,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_https(&self) -> bool {
        self.https
    }

    pub(crate) fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.connection_specs
    }

    /// True when the two addresses differ at most in host and port.
    pub(crate) fn equals_non_host(&self, other: &Address) -> bool {
        self.https == other.https
            && self.dns_identity == other.dns_identity
            && self.proxy_identity == other.proxy_identity
            && self.tls_identity == other.tls_identity
            && self.authenticator_identity == other.authenticator_identity
            && self.protocols == other.protocols
            && self.connection_specs == other.connection_specs
    }

    /// Coalescing test: an HTTP/2 connection to `other` may carry this
    /// address when everything but host/port matches and the peer's
    /// certificate covers this host.
    pub(crate) fn coalescable_onto(&self, other: &Address, handshake: &Handshake) -> bool {
        self.equals_non_host(other) && self.port == other.port && handshake.covers(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::tls::PeerCertificate;

    fn address(uri: &str) -> Address {
        Address::new(
            &uri.parse().unwrap(),
            1,
            2,
            3,
            4,
            vec![Protocol::Http2, Protocol::Http11],
            vec![ConnectionSpec::ModernTls],
        )
    }

    fn handshake_for(hosts: &[&str]) -> Handshake {
        Handshake {
            tls_version: "TLSv1.3".into(),
            cipher_suite: "TLS_AES_128_GCM_SHA256".into(),
            peer_certificates: vec![PeerCertificate {
                subject: "cn=test".into(),
                subject_alternative_names: hosts.iter().map(|h| h.to_string()).collect(),
            }],
            local_certificates: Vec::new(),
        }
    }

    #[test]
    fn default_ports() {
        assert_eq!(address("https://a.example/").port(), 443);
        assert_eq!(address("http://a.example/").port(), 80);
    }

    #[test]
    fn same_host_same_address() {
        assert_eq!(address("https://a.example/x"), address("https://a.example/y"));
    }

    #[test]
    fn coalescing_requires_certificate_coverage() {
        let a = address("https://a.example/");
        let b = address("https://b.example/");
        assert!(a.equals_non_host(&b));

        let covers_both = handshake_for(&["a.example", "b.example"]);
        let covers_a = handshake_for(&["a.example"]);
        assert!(b.coalescable_onto(&a, &covers_both));
        assert!(!b.coalescable_onto(&a, &covers_a));
    }

    #[test]
    fn different_collaborators_break_equality() {
        let a = address("https://a.example/");
        let mut b = address("https://a.example/");
        b.dns_identity = 99;
        assert_ne!(a, b);
        assert!(!a.equals_non_host(&b));
    }

    #[test]
    fn wildcard_san_coverage() {
        let a = address("https://api.example.com/");
        let b = address("https://www.example.com/");
        let wildcard = handshake_for(&["*.example.com"]);
        assert!(a.coalescable_onto(&b, &wildcard));
    }
}
