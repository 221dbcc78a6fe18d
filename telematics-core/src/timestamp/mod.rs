//! Absolute/relative timestamp tokens for the telemetry stream.
//!
//! Each logging stream owns one [`TimestampCodec`]. The first token of a
//! window is absolute (`#<ms>`); later tokens carry the delta from the
//! previous emission until [`ABSOLUTE_INTERVAL_MS`] elapses, at which point an
//! absolute token is forced again. A zero delta produces [`TimestampToken::Repeat`],
//! which has no textual form and tells the cache to merge with the previous
//! entry.
//!
//! Deltas are narrowed to `u16`. With the default interval every delta fits;
//! a custom interval above `u16::MAX` truncates the delta modulo 2^16.

use core::fmt;

use crate::config::ABSOLUTE_INTERVAL_MS;

/// Marker prefix for absolute tokens.
pub const ABSOLUTE_MARKER: char = '#';

/// Longest rendered token (`#4294967295`).
pub const MAX_TOKEN_LEN: usize = 11;

/// Event time encoded for one cache or store entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimestampToken {
    /// Full event time in milliseconds.
    Absolute(u32),
    /// Milliseconds since the previous emission.
    Relative(u16),
    /// Same event time as the previous emission.
    Repeat,
}

impl TimestampToken {
    /// Returns `true` for absolute tokens.
    #[must_use]
    pub const fn is_absolute(self) -> bool {
        matches!(self, TimestampToken::Absolute(_))
    }

    /// Returns `true` when the token has no textual representation.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        matches!(self, TimestampToken::Repeat)
    }

    /// Length of the rendered token in bytes.
    #[must_use]
    pub fn rendered_len(self) -> usize {
        match self {
            TimestampToken::Absolute(time) => 1 + decimal_digits(time),
            TimestampToken::Relative(delta) => decimal_digits(u32::from(delta)),
            TimestampToken::Repeat => 0,
        }
    }
}

const fn decimal_digits(mut value: u32) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

impl fmt::Display for TimestampToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampToken::Absolute(time) => write!(f, "{ABSOLUTE_MARKER}{time}"),
            TimestampToken::Relative(delta) => write!(f, "{delta}"),
            TimestampToken::Repeat => Ok(()),
        }
    }
}

/// Per-stream timestamp encoder.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimestampCodec {
    last_emitted: u32,
    absolute_interval: u32,
}

impl TimestampCodec {
    /// Creates a codec with the default absolute refresh interval.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_interval(ABSOLUTE_INTERVAL_MS)
    }

    /// Creates a codec that forces an absolute token after `interval_ms`.
    #[must_use]
    pub const fn with_interval(interval_ms: u32) -> Self {
        Self {
            last_emitted: 0,
            absolute_interval: interval_ms,
        }
    }

    /// Time of the most recent emission.
    #[must_use]
    pub const fn last_emitted(&self) -> u32 {
        self.last_emitted
    }

    /// Encodes `now` and records it as the latest emission.
    pub fn encode(&mut self, now: u32, force_absolute: bool) -> TimestampToken {
        let token = self.peek(now, force_absolute);
        self.last_emitted = now;
        token
    }

    /// Computes the token for `now` without updating the codec.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn peek(&self, now: u32, force_absolute: bool) -> TimestampToken {
        let elapsed = now.wrapping_sub(self.last_emitted);

        if force_absolute || elapsed >= self.absolute_interval {
            TimestampToken::Absolute(now)
        } else if elapsed == 0 {
            TimestampToken::Repeat
        } else {
            TimestampToken::Relative(elapsed as u16)
        }
    }
}

impl Default for TimestampCodec {
    fn default() -> Self {
        Self::new()
    }
}
