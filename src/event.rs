//! Lifecycle event listener.
//!
//! One listener instance observes every call; events for a single call are
//! correlated by its id. Implementations must be fast and must not call
//! back into the client.

use std::net::SocketAddr;

use http::Uri;

use crate::error::Error;

/// Receives call lifecycle events.
///
/// Every method has a no-op default, so implementations override only what
/// they observe.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn call_start(&self, call_id: u64, uri: &Uri) {}

    /// Exactly one of `call_end` / `call_failed` fires per call.
    fn call_end(&self, call_id: u64) {}
    fn call_failed(&self, call_id: u64, error: &Error) {}
    fn canceled(&self, call_id: u64) {}

    fn dns_start(&self, call_id: u64, host: &str) {}
    fn dns_end(&self, call_id: u64, host: &str, addresses: &[SocketAddr]) {}

    fn connect_start(&self, call_id: u64, address: SocketAddr) {}
    fn connect_end(&self, call_id: u64, address: SocketAddr) {}
    fn connect_failed(&self, call_id: u64, address: SocketAddr, error: &Error) {}

    fn secure_connect_start(&self, call_id: u64) {}
    fn secure_connect_end(&self, call_id: u64) {}

    fn connection_acquired(&self, call_id: u64, connection_id: u64) {}
    fn connection_released(&self, call_id: u64, connection_id: u64) {}

    fn request_headers_start(&self, call_id: u64) {}
    fn request_headers_end(&self, call_id: u64) {}
    fn request_body_start(&self, call_id: u64) {}
    fn request_body_end(&self, call_id: u64, bytes: u64) {}

    fn response_headers_start(&self, call_id: u64) {}
    fn response_headers_end(&self, call_id: u64, status: u16) {}
    /// 103 Early Hints and other intermediate responses.
    fn informational_response(&self, call_id: u64, status: u16) {}
    fn response_body_start(&self, call_id: u64) {}
    fn response_body_end(&self, call_id: u64, bytes: u64) {}

    /// A transport failure was judged retriable and a new attempt starts.
    fn retry_decision(&self, call_id: u64, retrying: bool) {}
    /// A redirect or auth challenge produced a follow-up request.
    fn follow_up_decision(&self, call_id: u64, uri: &Uri) {}

    /// The call could not start immediately due to dispatcher limits.
    fn dispatcher_queue_start(&self, call_id: u64) {}
    /// The queued call was promoted.
    fn dispatcher_queue_end(&self, call_id: u64) {}
    /// The call was handed to the executor.
    fn dispatcher_execution(&self, call_id: u64) {}
}

/// The default listener: observes nothing.
#[derive(Debug, Default)]
pub struct NoEvents;

impl EventListener for NoEvents {}
