//! A call: one logical request, possibly many exchanges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::address::Address;
use crate::client::ClientRef;
use crate::dispatcher::WebSocketMarker;
use crate::error::{Error, Result, TimeoutKind};
use crate::event::EventListener;
use crate::exchange::{Exchange, ExchangeCancel};
use crate::interceptor::{Chain, Interceptor};
use crate::pool::{CallMarker, PooledConnection};
use crate::request::Request;
use crate::response::Response;
use crate::route::{Route, RoutePlanner};

/// Mutable state shared by the interceptors driving one call.
pub(crate) struct CallContext {
    pub(crate) client: Arc<ClientRef>,
    pub(crate) call_id: u64,
    pub(crate) marker: Arc<CallMarker>,
    canceled: AtomicBool,
    /// Cancel hook for the in-flight exchange, set by the connect stage.
    exchange_cancel: Mutex<Option<ExchangeCancel>>,
    /// Handoff slot between the connect stage and the server stage.
    exchange_slot: Mutex<Option<Exchange>>,
    /// Route iteration persists across retries of the same call.
    pub(crate) planner: tokio::sync::Mutex<Option<(Address, RoutePlanner)>>,
    /// The connection used by the previous exchange, for follow-up reuse.
    pub(crate) held_connection: Mutex<Option<Weak<PooledConnection>>>,
    pub(crate) last_route: Mutex<Option<Route>>,
    /// Whether the last exchange ran on a pooled (reused) connection.
    pub(crate) last_was_pooled: AtomicBool,
    /// Set once the current attempt's request body has been fully
    /// transmitted. A peer CANCEL after this point is not retriable: the
    /// server observed the whole body. Shared so the duplex pump can set
    /// it from its own task.
    pub(crate) request_body_sent: Arc<AtomicBool>,
}

impl CallContext {
    fn new(client: Arc<ClientRef>, call_id: u64) -> CallContext {
        CallContext {
            client,
            call_id,
            marker: Arc::new(CallMarker { call_id }),
            canceled: AtomicBool::new(false),
            exchange_cancel: Mutex::new(None),
            exchange_slot: Mutex::new(None),
            planner: tokio::sync::Mutex::new(None),
            held_connection: Mutex::new(None),
            last_route: Mutex::new(None),
            last_was_pooled: AtomicBool::new(false),
            request_body_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn events(&self) -> &Arc<dyn EventListener> {
        &self.client.events
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// The check performed at every suspension point.
    pub(crate) fn check_canceled(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::new_canceled())
        } else {
            Ok(())
        }
    }

    pub(crate) fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.exchange_cancel.lock().unwrap().clone() {
            handle.cancel();
        }
    }

    pub(crate) fn set_exchange(&self, exchange: Exchange) {
        *self.exchange_cancel.lock().unwrap() = Some(exchange.cancel_handle());
        *self.exchange_slot.lock().unwrap() = Some(exchange);
    }

    pub(crate) fn take_exchange(&self) -> Option<Exchange> {
        self.exchange_slot.lock().unwrap().take()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(client: Arc<ClientRef>) -> CallContext {
        CallContext::new(client, 0)
    }

    /// Remembers the connection for step 1 of the next acquisition.
    pub(crate) fn hold_connection(&self, conn: &Arc<PooledConnection>) {
        *self.held_connection.lock().unwrap() = Some(Arc::downgrade(conn));
    }

    pub(crate) fn held_connection(&self) -> Option<Arc<PooledConnection>> {
        self.held_connection.lock().unwrap().as_ref()?.upgrade()
    }
}

enum CallState {
    NotStarted,
    Executing,
    Completed,
    Canceled,
    Failed,
}

struct CallInner {
    client: Arc<ClientRef>,
    request: Request,
    ctx: CallContext,
    state: Mutex<CallState>,
    executed: AtomicBool,
    terminal_fired: AtomicBool,
}

/// A user-facing handle around one request.
///
/// A call executes at most once; [`Call::clone`] yields a fresh,
/// not-yet-executed call for the same request.
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(client: Arc<ClientRef>, request: Request) -> Call {
        let call_id = client.next_call_id();
        Call {
            inner: Arc::new(CallInner {
                ctx: CallContext::new(client.clone(), call_id),
                client,
                request,
                state: Mutex::new(CallState::NotStarted),
                executed: AtomicBool::new(false),
                terminal_fired: AtomicBool::new(false),
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Runs the call on the current task, blocking it until the response
    /// heads arrive.
    pub async fn execute(&self) -> Result<Response> {
        self.claim_execution()?;
        let dispatcher = self.inner.client.dispatcher.clone();
        dispatcher.executed(self.inner.ctx.call_id);

        let result = self.drive().await;
        dispatcher.finished_sync(self.inner.ctx.call_id);
        self.finish(&result);
        result
    }

    /// Schedules the call on the dispatcher; `callback` receives the
    /// outcome exactly once.
    pub fn enqueue<F>(&self, callback: F)
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        if let Err(err) = self.claim_execution() {
            callback(Err(err));
            return;
        }

        // The callback lives in a shared slot so a rejected enqueue can
        // still signal the failure synchronously.
        type Callback = Box<dyn FnOnce(Result<Response>) + Send>;
        let slot: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(Some(Box::new(callback))));

        let call = Call {
            inner: self.inner.clone(),
        };
        let job_slot = slot.clone();
        let job = Box::pin(async move {
            let result = call.drive().await;
            call.finish(&result);
            if let Some(callback) = job_slot.lock().unwrap().take() {
                callback(result);
            }
        });

        let websocket = self.inner.request.tag::<WebSocketMarker>().is_some();
        let accepted = self.inner.client.dispatcher.enqueue(
            self.inner.ctx.call_id,
            self.inner.request.host().to_string(),
            websocket,
            self.inner.client.events.clone(),
            job,
        );
        if !accepted {
            if let Some(callback) = slot.lock().unwrap().take() {
                let err = Error::new_executor_shutdown();
                self.fire_terminal_failure(&err);
                callback(Err(err));
            }
        }
    }

    /// Cancels the call: the flag is observed at every suspension point,
    /// and the in-flight exchange is torn down immediately.
    pub fn cancel(&self) {
        if self.inner.ctx.is_canceled() {
            return;
        }
        debug!("canceling call {}", self.inner.ctx.call_id);
        self.inner.ctx.cancel();
        *self.inner.state.lock().unwrap() = CallState::Canceled;
        self.inner
            .client
            .events
            .canceled(self.inner.ctx.call_id);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.ctx.is_canceled()
    }

    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    fn claim_execution(&self) -> Result<()> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::new_user_already_executed());
        }
        *self.inner.state.lock().unwrap() = CallState::Executing;
        Ok(())
    }

    /// The single internal driver behind both execute paths.
    async fn drive(&self) -> Result<Response> {
        let inner = &self.inner;
        inner
            .client
            .events
            .call_start(inner.ctx.call_id, inner.request.uri());

        let interceptors = inner.client.pipeline();
        let chain = Chain::new(&inner.ctx, &interceptors, inner.request.clone());
        let fut = chain.run();

        let result = match inner.client.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    // The deadline behaves exactly like cancel().
                    inner.ctx.cancel();
                    Err(Error::new_timeout(TimeoutKind::Call))
                }
            },
            None => fut.await,
        };

        match result {
            Err(ref err) if inner.ctx.is_canceled() && !err.is_timeout() => {
                Err(Error::new_canceled())
            }
            other => other,
        }
    }

    /// Emits the terminal event exactly once, even under concurrent
    /// cancellation.
    fn finish(&self, result: &Result<Response>) {
        let mut state = self.inner.state.lock().unwrap();
        match *result {
            Ok(_) => *state = CallState::Completed,
            Err(ref err) if err.is_canceled() => *state = CallState::Canceled,
            Err(_) => *state = CallState::Failed,
        }
        drop(state);

        match *result {
            Ok(_) => {
                if !self.inner.terminal_fired.swap(true, Ordering::SeqCst) {
                    self.inner.client.events.call_end(self.inner.ctx.call_id);
                }
            }
            Err(ref err) => self.fire_terminal_failure(err),
        }
    }

    fn fire_terminal_failure(&self, err: &Error) {
        if !self.inner.terminal_fired.swap(true, Ordering::SeqCst) {
            self.inner
                .client
                .events
                .call_failed(self.inner.ctx.call_id, err);
        }
    }
}

impl Clone for Call {
    /// A fresh, not-yet-executed call for the same request. Tags are
    /// shared; adding a tag to one call's derived request never shows up
    /// on the other.
    fn clone(&self) -> Call {
        Call::new(self.inner.client.clone(), self.inner.request.clone())
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.ctx.call_id)
            .field("uri", self.inner.request.uri())
            .finish()
    }
}

/// Assembles the fixed pipeline around the user's interceptors.
pub(crate) fn build_pipeline(
    user: &[Arc<dyn Interceptor>],
    network: &[Arc<dyn Interceptor>],
) -> Vec<Arc<dyn Interceptor>> {
    let mut pipeline: Vec<Arc<dyn Interceptor>> = Vec::new();
    pipeline.extend(user.iter().cloned());
    pipeline.push(Arc::new(crate::interceptor::retry::RetryAndFollowUp));
    pipeline.push(Arc::new(crate::interceptor::bridge::Bridge));
    pipeline.extend(network.iter().cloned());
    pipeline.push(Arc::new(crate::interceptor::connect::ConnectInterceptor));
    pipeline.push(Arc::new(crate::interceptor::call_server::CallServer));
    pipeline
}
