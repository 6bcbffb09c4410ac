//! Flow-control window accounting.

use crate::proto::h2::frame::{Reason, MAX_WINDOW_SIZE};

/// One flow-control window. The peer's WINDOW_UPDATE and SETTINGS changes
/// can drive it negative, so it is signed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowControl {
    window: i64,
}

impl FlowControl {
    pub(crate) fn new(initial: u32) -> FlowControl {
        FlowControl {
            window: initial as i64,
        }
    }

    /// The capacity currently available to send or receive.
    pub(crate) fn available(&self) -> u32 {
        if self.window < 0 {
            0
        } else {
            self.window as u32
        }
    }

    /// Credits the window after a WINDOW_UPDATE (send side) or after the
    /// consumer freed buffered bytes (receive side).
    pub(crate) fn grow(&mut self, increment: u32) -> Result<(), Reason> {
        let next = self.window + increment as i64;
        if next > MAX_WINDOW_SIZE as i64 {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        self.window = next;
        Ok(())
    }

    /// Charges the window. The caller checked `available` first on the send
    /// side; on the receive side an overdraw means the peer ignored the
    /// window we advertised.
    pub(crate) fn shrink(&mut self, amount: u32) -> Result<(), Reason> {
        self.window -= amount as i64;
        if self.window < -(MAX_WINDOW_SIZE as i64) {
            return Err(Reason::FLOW_CONTROL_ERROR);
        }
        Ok(())
    }

    /// Applies a SETTINGS_INITIAL_WINDOW_SIZE delta, which may be negative.
    pub(crate) fn adjust(&mut self, delta: i64) {
        self.window += delta;
    }
}
