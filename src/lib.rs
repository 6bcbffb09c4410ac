//! # courier
//!
//! A general-purpose HTTP client engine: a call dispatcher, a connection
//! pool with route selection and multiplexing, an HTTP/1.1 and HTTP/2 wire
//! stack, and an interceptor/retry/redirect pipeline.
//!
//! ```no_run
//! # async fn run() -> courier::Result<()> {
//! use courier::{HttpClient, Request};
//!
//! let client = HttpClient::new();
//! let request = Request::get("http://example.com/")?;
//! let mut response = client.execute(request).await?;
//! println!("{} {}", response.code(), response.text().await?);
//! # Ok(())
//! # }
//! ```
//!
//! Calls run on tokio. `Call::execute` drives a call on the current task;
//! `Call::enqueue` schedules it on the dispatcher, bounded by the
//! configured concurrency limits.

mod address;
mod body;
mod call;
mod client;
pub mod collab;
mod common;
mod config;
pub mod connect;
mod decoder;
mod dispatcher;
mod error;
mod event;
mod exchange;
mod interceptor;
mod pool;
mod proto;
mod request;
mod response;
mod route;
mod upgrade;

pub use crate::address::Address;
pub use crate::body::{Body, BodySender};
pub use crate::common::io::{BoxedIo, Io};
pub use crate::common::BoxFuture;
pub use crate::call::Call;
pub use crate::client::{ClientBuilder, HttpClient};
pub use crate::config::{Config, ConnectionSpec, Protocol};
pub use crate::dispatcher::WebSocketMarker;
pub use crate::error::{Error, Result};
pub use crate::event::EventListener;
pub use crate::interceptor::{Chain, Interceptor};
pub use crate::interceptor::bridge::CacheValidator;
pub use crate::proto::h2::Reason;
pub use crate::request::{Builder as RequestBuilder, Request};
pub use crate::response::{Response, ResponseBody};
pub use crate::route::Route;
pub use crate::upgrade::Upgraded;
