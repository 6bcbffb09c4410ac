//! Dispatcher admission-control tests.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use courier::{EventListener, HttpClient, Request};

use support::read_request;

/// Records dispatcher events per call.
#[derive(Default)]
struct Recorder {
    queue_started: Mutex<Vec<u64>>,
    queue_ended: Mutex<Vec<u64>>,
    executed: Mutex<Vec<u64>>,
}

impl EventListener for Recorder {
    fn dispatcher_queue_start(&self, call_id: u64) {
        self.queue_started.lock().unwrap().push(call_id);
    }
    fn dispatcher_queue_end(&self, call_id: u64) {
        self.queue_ended.lock().unwrap().push(call_id);
    }
    fn dispatcher_execution(&self, call_id: u64) {
        self.executed.lock().unwrap().push(call_id);
    }
}

/// A server that holds every response until `release` fires.
async fn slow_server(
    connections: usize,
    release: Arc<tokio::sync::Notify>,
) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for _ in 0..connections {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let release = release.clone();
            tokio::spawn(async move {
                if read_request(&mut socket).await.is_none() {
                    return;
                }
                release.notified().await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                    .await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn per_host_limit_queues_the_third_call() {
    let release = Arc::new(tokio::sync::Notify::new());
    let addr = slow_server(3, release.clone()).await;

    let recorder = Arc::new(Recorder::default());
    let client = HttpClient::builder()
        .fast_fallback(false)
        .max_requests_per_host(2)
        .event_listener(recorder.clone())
        .build()
        .unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let finished = finished.clone();
        let call = client.new_call(Request::get(format!("http://{}/", addr)).unwrap());
        call.enqueue(move |result| {
            result.unwrap();
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Two calls run; the third sits in the ready queue and has announced
    // itself.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.queued_calls(), 1);
    assert_eq!(recorder.executed.lock().unwrap().len(), 2);
    assert_eq!(recorder.queue_started.lock().unwrap().len(), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    // Finishing one promotes the queued call.
    release.notify_waiters();
    let mut waited = 0;
    while finished.load(Ordering::SeqCst) < 3 && waited < 100 {
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += 1;
    }
    assert_eq!(finished.load(Ordering::SeqCst), 3);

    let queued = recorder.queue_started.lock().unwrap().clone();
    let ended = recorder.queue_ended.lock().unwrap().clone();
    assert_eq!(queued, ended);
    assert_eq!(recorder.executed.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn idle_callback_fires_when_queues_drain() {
    let release = Arc::new(tokio::sync::Notify::new());
    let addr = slow_server(1, release.clone()).await;

    let client = HttpClient::builder().fast_fallback(false).build().unwrap();
    let idled = Arc::new(AtomicUsize::new(0));
    {
        let idled = idled.clone();
        client.set_idle_callback(move || {
            idled.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let call = client.new_call(Request::get(format!("http://{}/", addr)).unwrap());
    call.enqueue(move |result| {
        let _ = done_tx.send(result.map(|r| r.code()));
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(idled.load(Ordering::SeqCst), 0);
    release.notify_waiters();

    assert_eq!(done_rx.await.unwrap().unwrap(), 200);
    let mut waited = 0;
    while idled.load(Ordering::SeqCst) == 0 && waited < 50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    assert_eq!(idled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_rejects_new_calls_synchronously() {
    let client = HttpClient::builder().fast_fallback(false).build().unwrap();
    client.shutdown_dispatcher();

    let call = client.new_call(Request::get("http://127.0.0.1:9/").unwrap());
    let rejected = Arc::new(AtomicUsize::new(0));
    {
        let rejected = rejected.clone();
        call.enqueue(move |result| {
            assert!(result.is_err());
            rejected.fetch_add(1, Ordering::SeqCst);
        });
    }
    // Rejection is synchronous: no awaiting needed.
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn websocket_calls_bypass_the_per_host_limit() {
    let release = Arc::new(tokio::sync::Notify::new());
    let addr = slow_server(3, release.clone()).await;

    let client = HttpClient::builder()
        .fast_fallback(false)
        .max_requests_per_host(1)
        .build()
        .unwrap();

    // Three marker-tagged calls to one host all start despite the limit.
    for _ in 0..3 {
        let request = Request::builder()
            .uri(format!("http://{}/socket", addr))
            .tag(courier::WebSocketMarker)
            .build()
            .unwrap();
        client.new_call(request).enqueue(|_| {});
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.queued_calls(), 0);
    assert_eq!(client.running_calls(), 3);
    release.notify_waiters();
}

#[tokio::test]
async fn total_limit_bounds_concurrency() {
    let release = Arc::new(tokio::sync::Notify::new());
    let addr = slow_server(8, release.clone()).await;

    let client = HttpClient::builder()
        .fast_fallback(false)
        .max_requests(4)
        .max_requests_per_host(100)
        .build()
        .unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let finished = finished.clone();
        let call = client.new_call(Request::get(format!("http://{}/", addr)).unwrap());
        call.enqueue(move |result| {
            result.unwrap();
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.running_calls(), 4);
    assert_eq!(client.queued_calls(), 4);

    let mut waited = 0;
    while finished.load(Ordering::SeqCst) < 8 && waited < 100 {
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += 1;
    }
    assert_eq!(finished.load(Ordering::SeqCst), 8);
}
