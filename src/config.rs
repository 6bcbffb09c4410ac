//! Client configuration.
//!
//! The builder surface flattens into one immutable record shared by every
//! call. Cloned clients share the pool and dispatcher by reference.

use std::time::Duration;

/// Wire protocols the client may negotiate, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1 over cleartext or TLS.
    Http11,
    /// HTTP/2, negotiated via ALPN.
    Http2,
    /// HTTP/2 over cleartext without negotiation.
    ///
    /// Mutually exclusive with every other protocol.
    H2PriorKnowledge,
}

impl Protocol {
    /// The ALPN protocol identifier, for TLS collaborators building their
    /// offer list.
    pub fn alpn_id(&self) -> &'static str {
        match self {
            Protocol::Http11 => "http/1.1",
            Protocol::Http2 | Protocol::H2PriorKnowledge => "h2",
        }
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        !matches!(self, Protocol::Http11)
    }
}

/// A named set of TLS versions and cipher suites.
///
/// The fallback sequence only ever selects the next *weaker* TLS spec;
/// `Cleartext` is never reached implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionSpec {
    /// Current TLS versions and strong cipher suites.
    ModernTls,
    /// Older TLS versions for legacy servers.
    CompatibleTls,
    /// Plain TCP, for `http` URLs only.
    Cleartext,
}

impl ConnectionSpec {
    pub fn is_tls(&self) -> bool {
        !matches!(self, ConnectionSpec::Cleartext)
    }

    /// Strictly-weaker ordering used by the TLS fallback rule.
    pub(crate) fn is_weaker_than(&self, other: &ConnectionSpec) -> bool {
        matches!(
            (other, self),
            (ConnectionSpec::ModernTls, ConnectionSpec::CompatibleTls)
        )
    }
}

/// Immutable configuration record for a client.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) follow_redirects: bool,
    pub(crate) follow_tls_redirects: bool,
    pub(crate) max_requests: usize,
    pub(crate) max_requests_per_host: usize,
    pub(crate) protocols: Vec<Protocol>,
    pub(crate) connection_specs: Vec<ConnectionSpec>,
    pub(crate) fast_fallback: bool,
    pub(crate) fast_fallback_delay: Duration,
    pub(crate) max_idle_connections: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) user_agent: String,
}

pub(crate) const MIN_CALL_TIMEOUT: Duration = Duration::from_millis(1);
pub(crate) const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

impl Default for Config {
    fn default() -> Config {
        Config {
            call_timeout: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            ping_interval: None,
            retry_on_connection_failure: true,
            follow_redirects: true,
            follow_tls_redirects: true,
            max_requests: 64,
            max_requests_per_host: 5,
            protocols: vec![Protocol::Http2, Protocol::Http11],
            connection_specs: vec![ConnectionSpec::ModernTls, ConnectionSpec::CompatibleTls],
            fast_fallback: true,
            fast_fallback_delay: Duration::from_millis(250),
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// Validates cross-option constraints. Called once at client build time.
    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.protocols.is_empty() {
            return Err("protocols must not be empty");
        }
        if self.protocols.contains(&Protocol::H2PriorKnowledge) && self.protocols.len() > 1 {
            return Err("H2_PRIOR_KNOWLEDGE is mutually exclusive with other protocols");
        }
        if let Some(timeout) = self.call_timeout {
            if timeout < MIN_CALL_TIMEOUT || timeout > MAX_CALL_TIMEOUT {
                return Err("callTimeout out of range [1ms, 1h]");
            }
        }
        if self.connection_specs.is_empty() {
            return Err("connectionSpecs must not be empty");
        }
        Ok(())
    }

    pub(crate) fn prior_knowledge(&self) -> bool {
        self.protocols == [Protocol::H2PriorKnowledge]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn prior_knowledge_is_exclusive() {
        let mut config = Config::default();
        config.protocols = vec![Protocol::H2PriorKnowledge, Protocol::Http11];
        assert!(config.validate().is_err());

        config.protocols = vec![Protocol::H2PriorKnowledge];
        assert!(config.validate().is_ok());
        assert!(config.prior_knowledge());
    }

    #[test]
    fn call_timeout_range() {
        let mut config = Config::default();
        config.call_timeout = Some(Duration::from_secs(2 * 60 * 60));
        assert!(config.validate().is_err());
        config.call_timeout = Some(Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn spec_fallback_is_strictly_weaker() {
        use ConnectionSpec::*;
        assert!(CompatibleTls.is_weaker_than(&ModernTls));
        assert!(!ModernTls.is_weaker_than(&CompatibleTls));
        // Cleartext is never a fallback target.
        assert!(!Cleartext.is_weaker_than(&ModernTls));
        assert!(!Cleartext.is_weaker_than(&CompatibleTls));
    }
}
