//! The interceptor chain.
//!
//! A call executes a linear pipeline: user application interceptors,
//! retry/follow-up, the bridge, user network interceptors, connect, and
//! finally the interceptor that talks to the server. Each interceptor may
//! short-circuit or call [`Chain::proceed`] to invoke the rest.

pub(crate) mod bridge;
pub(crate) mod call_server;
pub(crate) mod connect;
pub(crate) mod retry;

use std::sync::Arc;

use crate::call::CallContext;
use crate::common::BoxFuture;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

/// One stage of the pipeline.
pub trait Interceptor: Send + Sync {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>>;
}

/// The view an interceptor gets of the rest of the pipeline.
pub struct Chain<'a> {
    ctx: &'a CallContext,
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        ctx: &'a CallContext,
        interceptors: &'a [Arc<dyn Interceptor>],
        request: Request,
    ) -> Chain<'a> {
        Chain {
            ctx,
            interceptors,
            index: 0,
            request,
        }
    }

    /// Starts the pipeline.
    pub(crate) fn run(self) -> BoxFuture<'a, Result<Response>> {
        let interceptor = self.interceptors[self.index].clone();
        Box::pin(async move { interceptor.intercept(self).await })
    }

    /// The request as it stands at this stage.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn ctx(&self) -> &'a CallContext {
        self.ctx
    }

    /// Invokes the next interceptor with `request`.
    pub fn proceed(mut self, request: Request) -> BoxFuture<'a, Result<Response>> {
        debug_assert!(
            self.index + 1 < self.interceptors.len(),
            "the terminal interceptor must not proceed"
        );
        self.index += 1;
        self.request = request;
        let interceptor = self.interceptors[self.index].clone();
        Box::pin(async move { interceptor.intercept(self).await })
    }

    /// A re-runnable copy at the same stage, used by the retry engine to
    /// drive the remainder of the pipeline more than once.
    pub(crate) fn duplicate(&self) -> Chain<'a> {
        Chain {
            ctx: self.ctx,
            interceptors: self.interceptors,
            index: self.index,
            request: self.request.clone(),
        }
    }
}
