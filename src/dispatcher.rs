//! Admission control and scheduling of asynchronous calls.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::event::EventListener;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Marker tag: attach to a request to exempt its call from the per-host
/// limit (WebSocket upgrades hold their slot for a long time by design).
#[derive(Debug, Clone, Copy)]
pub struct WebSocketMarker;

/// Schedules async calls, bounding total and per-host concurrency.
///
/// Synchronous calls run on their caller and are only tracked for the idle
/// callback.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    state: Mutex<State>,
    max_requests: usize,
    max_requests_per_host: usize,
}

struct State {
    ready_async: VecDeque<QueuedCall>,
    running_async: Vec<RunningCall>,
    running_sync: Vec<u64>,
    idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
    shutdown: bool,
}

struct QueuedCall {
    call_id: u64,
    host: String,
    websocket: bool,
    events: Arc<dyn EventListener>,
    job: Job,
    /// Whether a queue-start event fired, so the matching queue-end does.
    announced: bool,
}

struct RunningCall {
    call_id: u64,
    host: String,
    websocket: bool,
}

impl Dispatcher {
    pub(crate) fn new(max_requests: usize, max_requests_per_host: usize) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(State {
                    ready_async: VecDeque::new(),
                    running_async: Vec::new(),
                    running_sync: Vec::new(),
                    idle_callback: None,
                    shutdown: false,
                }),
                max_requests,
                max_requests_per_host,
            }),
        }
    }

    /// Invoked whenever both queues become empty.
    pub(crate) fn set_idle_callback(&self, callback: Option<Arc<dyn Fn() + Send + Sync>>) {
        self.inner.state.lock().unwrap().idle_callback = callback;
    }

    /// Queues an async call. Returns `false` if the dispatcher is shut
    /// down, in which case the caller signals the failure synchronously.
    pub(crate) fn enqueue(
        &self,
        call_id: u64,
        host: String,
        websocket: bool,
        events: Arc<dyn EventListener>,
        job: Job,
    ) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return false;
            }
            state.ready_async.push_back(QueuedCall {
                call_id,
                host,
                websocket,
                events,
                job,
                announced: false,
            });
        }
        self.promote_and_execute();
        true
    }

    /// Registers a synchronous call for idle accounting.
    pub(crate) fn executed(&self, call_id: u64) {
        self.inner.state.lock().unwrap().running_sync.push(call_id);
    }

    pub(crate) fn finished_sync(&self, call_id: u64) {
        let callback = {
            let mut state = self.inner.state.lock().unwrap();
            state.running_sync.retain(|id| *id != call_id);
            idle_callback_if_idle(&state)
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    fn finished_async(&self, call_id: u64) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.running_async.retain(|c| c.call_id != call_id);
        }
        self.promote_and_execute();
    }

    /// Moves ready calls to running while both limits permit, then hands
    /// them to the executor. Promotion happens under the lock; execution
    /// strictly after it is released.
    fn promote_and_execute(&self) {
        let mut executable: Vec<QueuedCall> = Vec::new();
        let mut announce: Vec<(u64, Arc<dyn EventListener>)> = Vec::new();
        let idle_callback;
        {
            let mut state = self.inner.state.lock().unwrap();

            let mut index = 0;
            while index < state.ready_async.len() {
                if state.running_async.len() >= self.inner.max_requests {
                    break;
                }
                let candidate = &state.ready_async[index];
                let host_ok = candidate.websocket
                    || host_count(&state.running_async, &candidate.host)
                        < self.inner.max_requests_per_host;
                if host_ok {
                    let call = state.ready_async.remove(index).expect("index in range");
                    state.running_async.push(RunningCall {
                        call_id: call.call_id,
                        host: call.host.clone(),
                        websocket: call.websocket,
                    });
                    executable.push(call);
                } else {
                    index += 1;
                }
            }

            // Anything still waiting is queued on limits; announce once,
            // outside the lock.
            for queued in state.ready_async.iter_mut() {
                if !queued.announced {
                    queued.announced = true;
                    announce.push((queued.call_id, queued.events.clone()));
                }
            }

            idle_callback = idle_callback_if_idle(&state);
        }

        for (call_id, events) in announce {
            events.dispatcher_queue_start(call_id);
        }

        for call in executable {
            if call.announced {
                call.events.dispatcher_queue_end(call.call_id);
            }
            call.events.dispatcher_execution(call.call_id);
            trace!("dispatching call {}", call.call_id);

            let dispatcher = self.clone();
            let call_id = call.call_id;
            let job = call.job;
            tokio::spawn(async move {
                job.await;
                dispatcher.finished_async(call_id);
            });
        }

        if let Some(callback) = idle_callback {
            callback();
        }
    }

    /// Refuses new calls; queued-but-unstarted calls are dropped.
    pub(crate) fn shutdown(&self) {
        let dropped: Vec<QueuedCall> = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            state.ready_async.drain(..).collect()
        };
        drop(dropped);
    }

    pub(crate) fn running_calls(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.running_async.len() + state.running_sync.len()
    }

    pub(crate) fn queued_calls(&self) -> usize {
        self.inner.state.lock().unwrap().ready_async.len()
    }
}

fn host_count(running: &[RunningCall], host: &str) -> usize {
    running
        .iter()
        .filter(|c| !c.websocket && c.host == host)
        .count()
}

/// Clones the idle callback when both queues just became empty, so it can
/// be invoked after the lock is released.
fn idle_callback_if_idle(state: &State) -> Option<Arc<dyn Fn() + Send + Sync>> {
    if state.ready_async.is_empty()
        && state.running_async.is_empty()
        && state.running_sync.is_empty()
    {
        state.idle_callback.clone()
    } else {
        None
    }
}
