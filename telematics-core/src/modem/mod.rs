//! AT-command Wi-Fi modem plumbing.
//!
//! The core never touches a UART directly. Targets hand in a
//! [`ByteTransport`] for the serial link and a [`Clock`] for deadlines;
//! [`channel::CommandChannel`] builds command exchanges on top of them and
//! [`link::LinkDriver`] runs the connection state machine.
//!
//! Modem output is never parsed beyond substring matches against the fixed
//! markers below.

use heapless::Vec;

pub mod channel;
pub mod http;
pub mod link;

pub use channel::{CommandChannel, ExchangeOutcome, Poll};
pub use link::{
    Address, Escalation, JoinFailure, LinkDriver, LinkError, LinkState, SessionPhase, Submission,
};

/// Capacity of the modem receive buffer.
pub const RX_BUFFER_LEN: usize = 192;

/// Bounded receive buffer shared by every exchange.
pub type ResponseBuffer = Vec<u8, RX_BUFFER_LEN>;

pub const MARKER_OK: &str = "OK";
pub const MARKER_LINKED: &str = "Linked";
pub const MARKER_SEND_OK: &str = "SEND OK";
pub const MARKER_INBOUND: &str = "+IPD";
pub const MARKER_PROMPT: &str = ">";
pub const MARKER_UNLINK: &str = "Unlink";

/// Serial link to the modem.
pub trait ByteTransport {
    /// Writes raw bytes to the modem.
    fn write(&mut self, bytes: &[u8]);

    /// Discards any unread input.
    fn purge_input(&mut self);

    /// Appends incoming bytes to `rx` until `token` shows up, `rx` is full,
    /// or `timeout_ms` elapses. A zero timeout only drains what is already
    /// pending. Returns the length of `rx` when the token matched and `0`
    /// otherwise.
    fn read_until(&mut self, rx: &mut ResponseBuffer, timeout_ms: u32, token: &str) -> usize;
}

/// Monotonic millisecond time source.
pub trait Clock {
    fn now_ms(&self) -> u32;

    fn delay_ms(&mut self, ms: u32);
}

impl<T: ByteTransport + ?Sized> ByteTransport for &mut T {
    fn write(&mut self, bytes: &[u8]) {
        (**self).write(bytes);
    }

    fn purge_input(&mut self) {
        (**self).purge_input();
    }

    fn read_until(&mut self, rx: &mut ResponseBuffer, timeout_ms: u32, token: &str) -> usize {
        (**self).read_until(rx, timeout_ms, token)
    }
}

impl<C: Clock + ?Sized> Clock for &mut C {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }

    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms);
    }
}

/// Returns `true` when `needle` occurs anywhere in `haystack`.
#[must_use]
pub fn contains_marker(haystack: &[u8], needle: &str) -> bool {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return true;
    }

    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
