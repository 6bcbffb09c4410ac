//! The HTTP/1.1 engine: head parsing/encoding, body framing, and the
//! one-exchange-at-a-time connection state machine.

mod conn;
mod decode;
mod encode;
mod io;
mod role;

pub(crate) use self::conn::{CancelCell, H1Exchange, H1Socket};
pub(crate) use self::io::Buffered;
pub(crate) use self::io::MAX_HEAD_SIZE;
pub(crate) use self::role::parse_response_head;

#[cfg(test)]
pub(crate) fn io_for_tests<T: crate::common::io::Io>(io: T) -> Buffered {
    use std::time::Duration;
    Buffered::new(
        crate::common::io::BoxedIo::new(io),
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
}
