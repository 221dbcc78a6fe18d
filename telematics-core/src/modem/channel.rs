//! Command exchanges over the modem byte transport.

use super::{ByteTransport, Clock, ResponseBuffer, contains_marker};

/// Pause between writing a command and reading the reply.
pub const SETTLE_DELAY_MS: u32 = 50;

/// Deadline used by commands that do not name their own.
pub const DEFAULT_TIMEOUT_MS: u32 = 2_000;

/// Result of a blocking command exchange.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExchangeOutcome {
    Matched,
    TimedOut,
}

impl ExchangeOutcome {
    #[must_use]
    pub const fn is_matched(self) -> bool {
        matches!(self, ExchangeOutcome::Matched)
    }
}

/// Result of a non-blocking marker check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Poll {
    /// Marker not seen yet and the deadline has not passed.
    Pending,
    Complete,
    /// Deadline passed without the marker.
    Failed,
}

/// Owns the transport, the clock and the receive buffer.
pub struct CommandChannel<T, C> {
    transport: T,
    clock: C,
    rx: ResponseBuffer,
}

impl<T: ByteTransport, C: Clock> CommandChannel<T, C> {
    #[must_use]
    pub fn new(transport: T, clock: C) -> Self {
        Self {
            transport,
            clock,
            rx: ResponseBuffer::new(),
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.clock.delay_ms(ms);
    }

    /// Bytes received by the most recent exchange or poll.
    #[must_use]
    pub fn response(&self) -> &[u8] {
        &self.rx
    }

    #[must_use]
    pub fn response_contains(&self, marker: &str) -> bool {
        contains_marker(&self.rx, marker)
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sends `command` (if any) and waits up to `timeout_ms` for `expected`.
    ///
    /// The receive buffer is cleared before waiting and left holding the
    /// reply afterwards so callers can inspect it for error markers.
    pub fn exchange(&mut self, command: &[u8], timeout_ms: u32, expected: &str) -> ExchangeOutcome {
        self.transport.purge_input();
        if !command.is_empty() {
            self.transport.write(command);
            self.clock.delay_ms(SETTLE_DELAY_MS);
        }
        self.rx.clear();

        let started = self.clock.now_ms();
        loop {
            if contains_marker(&self.rx, expected) {
                return ExchangeOutcome::Matched;
            }

            let elapsed = self.clock.now_ms().wrapping_sub(started);
            if elapsed >= timeout_ms {
                return ExchangeOutcome::TimedOut;
            }

            self.make_room(expected);
            self.transport
                .read_until(&mut self.rx, timeout_ms - elapsed, expected);
        }
    }

    /// Clears the receive buffer and writes `bytes` without waiting.
    ///
    /// Follow up with [`CommandChannel::check_buffer`] to watch for the reply.
    pub fn send(&mut self, bytes: &[u8]) {
        self.transport.purge_input();
        self.rx.clear();
        self.transport.write(bytes);
    }

    /// Writes `bytes` while keeping whatever has already been received.
    pub fn write(&mut self, bytes: &[u8]) {
        self.transport.write(bytes);
    }

    pub fn clear_response(&mut self) {
        self.rx.clear();
    }

    /// Checks for `expected` without blocking, pulling in pending input.
    pub fn check_buffer(&mut self, expected: &str, started_at: u32, timeout_ms: u32) -> Poll {
        if contains_marker(&self.rx, expected) {
            return Poll::Complete;
        }

        self.make_room(expected);
        if self.transport.read_until(&mut self.rx, 0, expected) != 0
            || contains_marker(&self.rx, expected)
        {
            return Poll::Complete;
        }

        if self.clock.now_ms().wrapping_sub(started_at) < timeout_ms {
            Poll::Pending
        } else {
            Poll::Failed
        }
    }

    // A full buffer keeps only the tail that could still begin the marker.
    fn make_room(&mut self, expected: &str) {
        if !self.rx.is_full() {
            return;
        }

        let keep = expected.len().saturating_sub(1).min(self.rx.len());
        let start = self.rx.len() - keep;
        self.rx.copy_within(start.., 0);
        self.rx.truncate(keep);
    }
}
