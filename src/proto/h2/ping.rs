//! HTTP/2 keep-alive pings.
//!
//! When a ping interval is configured, one task per connection sends a
//! PING with a monotonically increasing payload every interval. An ack
//! missing for a full interval marks the connection degraded; a degraded
//! connection gets one short grace window before it is failed outright.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::proto::h2::connection::{fail_connection, Closed, Shared};
use crate::proto::h2::frame::Ping;

/// How long a degraded connection may wait for the missing pong.
pub(crate) const DEGRADED_PONG_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) async fn run(shared: Arc<Shared>, interval: Duration) {
    let mut seq: u64 = 0;

    loop {
        sleep(interval).await;

        let outstanding = {
            let mut state = shared.state.lock().unwrap();
            if state.closed.is_some() {
                return;
            }
            if state.ping_outstanding.is_some() {
                state.degraded = true;
                true
            } else {
                false
            }
        };

        if outstanding {
            debug!("keep-alive ping unanswered for a full interval; degraded");
            sleep(DEGRADED_PONG_TIMEOUT).await;

            let still_missing = {
                let state = shared.state.lock().unwrap();
                state.ping_outstanding.is_some()
            };
            if still_missing {
                warn!("degraded connection missed its pong; failing");
                fail_connection(&shared, Closed::Degraded);
                return;
            }
            continue;
        }

        let payload = seq.to_be_bytes();
        seq += 1;
        {
            let mut state = shared.state.lock().unwrap();
            state.ping_outstanding = Some(payload);
        }

        let mut writer = shared.writer.lock().await;
        if writer.write_ping(Ping::new(payload)).await.is_err() {
            debug!("keep-alive ping write failed");
            drop(writer);
            fail_connection(&shared, Closed::Io(std::io::ErrorKind::BrokenPipe));
            return;
        }
    }
}
