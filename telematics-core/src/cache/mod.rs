//! Bounded telemetry cache.
//!
//! Serialized records accumulate as `<token>,<record> ` entries in a fixed
//! byte buffer. The content is always followed by a single NUL byte so the
//! buffer can be handed to C-style sinks unchanged, and the whole thing never
//! exceeds `CAPACITY` bytes. Records sharing an event time with the previous
//! entry are merged behind a `;` instead of repeating the timestamp.
//!
//! Shift eviction cuts whole entries from the head and rewrites the first
//! surviving token as absolute, so every window still decodes to event times.
//!
//! A drain marks the current content as in flight. Dispatches that arrive
//! before [`TelemetryCache::finish_drain`] append after the mark only, so the
//! bytes already handed to the modem are never rewritten or moved.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::timestamp::{ABSOLUTE_MARKER, MAX_TOKEN_LEN, TimestampCodec, TimestampToken};

pub mod stream;

/// Bytes an entry needs beyond its record: the widest token, both
/// separators and the NUL.
pub const HEADROOM: usize = MAX_TOKEN_LEN + 3;

/// Terminates every entry.
pub const RECORD_TERMINATOR: u8 = b' ';

/// Separates the timestamp token from the first record of an entry.
pub const FIELD_TERMINATOR: u8 = b',';

/// Separates records that share an event time.
pub const MERGE_SEPARATOR: u8 = b';';

/// What to do with a record that does not fit.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum EvictionPolicy {
    /// Reject the new record and keep the cache as is.
    #[default]
    Drop,
    /// Discard the oldest entries until the new record fits.
    Shift,
}

/// Reasons a record was not admitted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheError {
    CacheFull,
}

impl core::fmt::Display for CacheError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CacheError::CacheFull => f.write_str("cache full"),
        }
    }
}

/// Data discarded to make room for an admitted record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Eviction {
    None,
    /// Whole entries were shifted out of the head of the buffer.
    Shifted { discarded: usize },
    /// No entry boundary was found, so everything went.
    Truncated { discarded: usize },
}

impl Eviction {
    /// Bytes of cached telemetry lost to this eviction.
    #[must_use]
    pub const fn discarded(self) -> usize {
        match self {
            Eviction::None => 0,
            Eviction::Shifted { discarded } | Eviction::Truncated { discarded } => discarded,
        }
    }
}

/// Result of a successful dispatch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Dispatched {
    pub token: TimestampToken,
    pub eviction: Eviction,
}

/// Fixed-capacity text cache of serialized records.
pub struct TelemetryCache<const CAPACITY: usize> {
    // Content followed by exactly one NUL.
    buf: Vec<u8, CAPACITY>,
    codec: TimestampCodec,
    policy: EvictionPolicy,
    drain_mark: Option<usize>,
}

impl<const CAPACITY: usize> TelemetryCache<CAPACITY> {
    /// Creates an empty cache using the given eviction policy.
    #[must_use]
    pub fn new(policy: EvictionPolicy) -> Self {
        const { assert!(CAPACITY > HEADROOM + 2, "cache capacity too small") };

        let mut cache = Self {
            buf: Vec::new(),
            codec: TimestampCodec::new(),
            policy,
            drain_mark: None,
        };
        cache.terminate();
        cache
    }

    /// Replaces the timestamp codec, e.g. to use a custom absolute interval.
    #[must_use]
    pub fn with_codec(mut self, codec: TimestampCodec) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    #[must_use]
    pub const fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: EvictionPolicy) {
        self.policy = policy;
    }

    /// Number of content bytes, excluding the NUL terminator.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len().saturating_sub(1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached entries as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    /// Content including the trailing NUL.
    #[must_use]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf
    }

    /// Appends a serialized record stamped with `now`.
    pub fn dispatch(&mut self, record: &str, now: u32) -> Result<Dispatched, CacheError> {
        if record.len() + HEADROOM > CAPACITY {
            diag_warn!("cache: record of {} bytes can never fit", record.len());
            return Err(CacheError::CacheFull);
        }

        let mut eviction = Eviction::None;
        if !self.fits(record.len(), now) {
            if self.policy == EvictionPolicy::Drop || self.drain_mark.is_some() {
                return Err(CacheError::CacheFull);
            }

            eviction = self.evict(record.len(), now);
        }

        let token = self.append(record, now)?;
        Ok(Dispatched { token, eviction })
    }

    /// Discards all cached content.
    pub fn purge(&mut self) {
        self.buf.clear();
        self.terminate();
        self.drain_mark = None;
    }

    /// Marks the current content as in flight and returns it.
    pub fn begin_drain(&mut self) -> &str {
        self.drain_mark = Some(self.len());
        self.as_str()
    }

    /// Returns `true` while a drain is in flight.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.drain_mark.is_some()
    }

    /// Bytes handed out by the in-flight drain.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.drain_mark.unwrap_or(0)
    }

    /// Completes the in-flight drain, dropping the drained bytes on delivery.
    pub fn finish_drain(&mut self, delivered: bool) {
        let Some(mark) = self.drain_mark.take() else {
            return;
        };

        if !delivered {
            return;
        }

        if mark >= self.len() {
            self.purge();
        } else {
            self.discard_head(mark);
        }
    }

    fn window_start(&self) -> usize {
        self.drain_mark.unwrap_or(0)
    }

    fn force_absolute(&self) -> bool {
        self.len() == self.window_start()
    }

    // Whether `record` stamped at `now` fits without eviction.
    fn fits(&self, record_len: usize, now: u32) -> bool {
        let token = self.codec.peek(now, self.force_absolute());
        let entry_len = if token.is_empty() {
            record_len + 1
        } else {
            token.rendered_len() + record_len + 2
        };
        self.buf.len() + entry_len <= CAPACITY
    }

    fn terminate(&mut self) {
        // CAPACITY > HEADROOM guarantees room for the terminator after any rollback.
        let _ = self.buf.push(0);
    }

    fn evict(&mut self, record_len: usize, now: u32) -> Eviction {
        let mut discarded = 0;
        // Bytes the current head gained when its token was made absolute.
        let mut head_growth = 0;

        while !self.fits(record_len, now) {
            let content = self.as_bytes();
            let start = (CAPACITY / 2).min(content.len() / 2);
            let boundary = content
                .get(start..)
                .and_then(|tail| tail.iter().position(|byte| *byte == RECORD_TERMINATOR))
                .map(|offset| start + offset);

            let Some(end) = boundary else {
                return self.truncate_all(discarded, head_growth);
            };

            let cut = end + 1;
            let resumed_at = entry_time(content, cut);
            discarded += cut.saturating_sub(head_growth);
            self.discard_head(cut);

            head_growth = match resumed_at {
                Some(time) => match self.reanchor(time) {
                    Some(growth) => growth,
                    None => return self.truncate_all(discarded, 0),
                },
                None if self.is_empty() => 0,
                None => return self.truncate_all(discarded, 0),
            };
        }

        diag_info!("cache: shifted out {} bytes", discarded);
        Eviction::Shifted { discarded }
    }

    fn truncate_all(&mut self, discarded: usize, head_growth: usize) -> Eviction {
        let discarded = discarded + self.len().saturating_sub(head_growth);
        diag_warn!("cache: no entry boundary, truncated {} bytes", discarded);
        self.purge();
        Eviction::Truncated { discarded }
    }

    /// Rewrites the head entry's token as absolute `time`. Returns the bytes
    /// the entry grew by, or `None` if the rewrite does not fit.
    fn reanchor(&mut self, time: u32) -> Option<usize> {
        if self.as_str().starts_with(ABSOLUTE_MARKER) {
            return Some(0);
        }
        let old_len = self
            .as_bytes()
            .iter()
            .position(|byte| *byte == FIELD_TERMINATOR)?;

        let mut token: String<{ MAX_TOKEN_LEN + 1 }> = String::new();
        write!(token, "{}", TimestampToken::Absolute(time)).ok()?;
        let new_len = token.len();

        let total = self.buf.len();
        let resized = total + new_len - old_len;
        if resized > total {
            self.buf.resize(resized, 0).ok()?;
        }
        self.buf.copy_within(old_len..total, new_len);
        self.buf.truncate(resized);
        self.buf[..new_len].copy_from_slice(token.as_bytes());

        Some(new_len.saturating_sub(old_len))
    }

    fn discard_head(&mut self, count: usize) {
        let total = self.buf.len();
        self.buf.copy_within(count..total, 0);
        self.buf.truncate(total - count);
    }

    fn append(&mut self, record: &str, now: u32) -> Result<TimestampToken, CacheError> {
        let saved_len = self.len();
        let saved_codec = self.codec;
        let token = self.codec.encode(now, self.force_absolute());

        self.buf.pop();
        if let Err(error) = self.write_entry(token, record) {
            self.buf.truncate(saved_len);
            if token.is_empty()
                && let Some(last) = self.buf.last_mut()
            {
                *last = RECORD_TERMINATOR;
            }
            self.terminate();
            self.codec = saved_codec;
            return Err(error);
        }

        Ok(token)
    }

    fn write_entry(&mut self, token: TimestampToken, record: &str) -> Result<(), CacheError> {
        if token.is_empty() {
            if let Some(last) = self.buf.last_mut() {
                *last = MERGE_SEPARATOR;
            }
        } else {
            let mut rendered: String<{ MAX_TOKEN_LEN + 1 }> = String::new();
            write!(rendered, "{token}").map_err(|_| CacheError::CacheFull)?;
            self.extend(rendered.as_bytes())?;
            self.extend(&[FIELD_TERMINATOR])?;
        }

        self.extend(record.as_bytes())?;
        self.extend(&[RECORD_TERMINATOR, 0])
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<(), CacheError> {
        self.buf
            .extend_from_slice(bytes)
            .map_err(|_| CacheError::CacheFull)
    }
}

/// Event time of the entry starting at `offset`, resolved from the absolute
/// token at the head of `content`.
fn entry_time(content: &[u8], offset: usize) -> Option<u32> {
    let mut time: Option<u32> = None;
    let mut pos = 0;

    while pos < content.len() {
        let entry = &content[pos..];
        let comma = entry.iter().position(|byte| *byte == FIELD_TERMINATOR)?;
        let token = core::str::from_utf8(&entry[..comma]).ok()?;
        time = Some(match token.strip_prefix(ABSOLUTE_MARKER) {
            Some(absolute) => absolute.parse().ok()?,
            None => time?.wrapping_add(token.parse().ok()?),
        });

        if pos == offset {
            return time;
        }
        pos += entry.iter().position(|byte| *byte == RECORD_TERMINATOR)? + 1;
    }

    None
}

impl<const CAPACITY: usize> Default for TelemetryCache<CAPACITY> {
    fn default() -> Self {
        Self::new(EvictionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_terminated<const N: usize>(cache: &TelemetryCache<N>) {
        let raw = cache.as_bytes_with_nul();
        assert!(raw.len() <= N);
        assert_eq!(raw.last(), Some(&0));
        assert!(!cache.as_bytes().contains(&0));
    }

    #[test]
    fn first_entry_is_absolute_then_relative() {
        let mut cache = TelemetryCache::<64>::default();

        let first = cache.dispatch("C=1500", 1_000).unwrap();
        let second = cache.dispatch("D=60", 1_500).unwrap();

        assert_eq!(first.token, TimestampToken::Absolute(1_000));
        assert_eq!(second.token, TimestampToken::Relative(500));
        assert_eq!(cache.as_str(), "#1000,C=1500 500,D=60 ");
        assert_terminated(&cache);
    }

    #[test]
    fn same_time_records_merge_with_semicolon() {
        let mut cache = TelemetryCache::<64>::default();

        cache.dispatch("C=1500", 1_000).unwrap();
        cache.dispatch("D=60", 1_000).unwrap();
        cache.dispatch("20=1/2/3", 1_010).unwrap();

        assert_eq!(cache.as_str(), "#1000,C=1500;D=60 10,20=1/2/3 ");
    }

    #[test]
    fn drop_policy_rejects_without_touching_content() {
        let mut cache = TelemetryCache::<32>::default();
        cache.dispatch("C=1500", 1_000).unwrap();
        let before = cache.as_str().len();

        assert_eq!(
            cache.dispatch("D=123456789012", 1_100),
            Err(CacheError::CacheFull)
        );
        assert_eq!(cache.len(), before);
        assert_eq!(cache.as_str(), "#1000,C=1500 ");

        // The rejected record must not have advanced the codec.
        let next = cache.dispatch("D=1", 1_200).unwrap();
        assert_eq!(next.token, TimestampToken::Relative(200));
        assert_eq!(cache.as_str(), "#1000,C=1500 200,D=1 ");
    }

    #[test]
    fn widest_token_is_reserved_up_front() {
        let mut cache = TelemetryCache::<32>::default();

        assert_eq!(
            cache.dispatch("C=12345678901234567", 4_000_000_000),
            Err(CacheError::CacheFull)
        );
        assert!(cache.is_empty());

        let dispatched = cache
            .dispatch("C=1234567890123456", 4_000_000_000)
            .unwrap();
        assert_eq!(dispatched.token, TimestampToken::Absolute(4_000_000_000));
        assert_eq!(cache.as_str(), "#4000000000,C=1234567890123456 ");
        assert_eq!(cache.as_bytes_with_nul().len(), 32);
        assert_terminated(&cache);
    }

    #[test]
    fn oversized_record_never_fits() {
        let mut cache = TelemetryCache::<24>::new(EvictionPolicy::Shift);
        assert_eq!(
            cache.dispatch("ABCDEF=0123456789", 0),
            Err(CacheError::CacheFull)
        );
        assert!(cache.is_empty());
        assert_terminated(&cache);
    }

    #[test]
    fn shift_policy_discards_oldest_whole_entries() {
        let mut cache = TelemetryCache::<64>::new(EvictionPolicy::Shift);
        cache.dispatch("C=1111", 1_000).unwrap();
        cache.dispatch("C=2222", 1_100).unwrap();
        cache.dispatch("C=3333", 1_200).unwrap();
        cache.dispatch("C=4444", 1_300).unwrap();
        assert_eq!(cache.as_str(), "#1000,C=1111 100,C=2222 100,C=3333 100,C=4444 ");

        let dispatched = cache.dispatch("C=55555555555", 1_400).unwrap();

        assert_eq!(dispatched.eviction, Eviction::Shifted { discarded: 24 });
        assert_eq!(dispatched.token, TimestampToken::Relative(100));
        assert_eq!(
            cache.as_str(),
            "#1200,C=3333 100,C=4444 100,C=55555555555 "
        );
        assert_terminated(&cache);
    }

    #[test]
    fn shift_makes_room_for_a_wide_absolute_token() {
        let mut cache = TelemetryCache::<64>::new(EvictionPolicy::Shift);
        cache.dispatch("C=1111", 1_000_000_000).unwrap();
        cache.dispatch("C=2222", 1_000_000_100).unwrap();
        cache.dispatch("C=3333", 1_000_000_200).unwrap();

        // A minute later the token is ten digits wide again.
        let dispatched = cache.dispatch("D=12345678", 1_000_060_200).unwrap();

        assert_eq!(dispatched.eviction, Eviction::Shifted { discarded: 30 });
        assert_eq!(dispatched.token, TimestampToken::Absolute(1_000_060_200));
        assert_eq!(cache.as_str(), "#1000000200,C=3333 #1000060200,D=12345678 ");
        assert_terminated(&cache);
    }

    #[test]
    fn shift_admits_large_record_after_repeated_cuts() {
        let mut cache = TelemetryCache::<64>::new(EvictionPolicy::Shift);
        cache.dispatch("C=1111", 1_000_000_000).unwrap();
        cache.dispatch("C=2222", 1_000_000_100).unwrap();
        cache.dispatch("C=3333", 1_000_000_200).unwrap();
        cache.dispatch("C=4444", 1_000_000_300).unwrap();
        assert_eq!(cache.len(), 52);

        let dispatched = cache
            .dispatch("D=12345678901234567890123456789012345678", 1_000_000_400)
            .unwrap();

        assert_eq!(dispatched.eviction, Eviction::Shifted { discarded: 52 });
        assert_eq!(dispatched.token, TimestampToken::Absolute(1_000_000_400));
        assert_eq!(
            cache.as_str(),
            "#1000000400,D=12345678901234567890123456789012345678 "
        );
        assert_terminated(&cache);
    }

    #[test]
    fn short_content_is_shifted_out_whole() {
        let mut cache = TelemetryCache::<40>::new(EvictionPolicy::Shift);
        cache.dispatch("C=1234567890123", 10).unwrap();
        assert_eq!(cache.as_str(), "#10,C=1234567890123 ");

        let dispatched = cache.dispatch("D=12345678901234567890", 20).unwrap();

        assert_eq!(dispatched.eviction, Eviction::Shifted { discarded: 20 });
        assert_eq!(dispatched.token, TimestampToken::Absolute(20));
        assert_eq!(cache.as_str(), "#20,D=12345678901234567890 ");
        assert_terminated(&cache);
    }

    #[test]
    fn merged_survivor_keeps_its_time() {
        let mut cache = TelemetryCache::<48>::new(EvictionPolicy::Shift);
        cache.dispatch("C=1111", 500).unwrap();
        cache.dispatch("C=2222", 700).unwrap();
        cache.dispatch("C=3333", 950).unwrap();
        cache.dispatch("D=44", 950).unwrap();
        assert_eq!(cache.as_str(), "#500,C=1111 200,C=2222 250,C=3333;D=44 ");

        cache.dispatch("C=5555", 1_000).unwrap();

        assert_eq!(cache.as_str(), "#950,C=3333;D=44 50,C=5555 ");
        assert_terminated(&cache);
    }

    #[test]
    fn purge_then_dispatch_matches_fresh_cache() {
        let mut used = TelemetryCache::<64>::default();
        used.dispatch("C=1", 5).unwrap();
        used.dispatch("C=2", 7).unwrap();
        used.purge();
        used.dispatch("D=60", 1_500).unwrap();

        let mut fresh = TelemetryCache::<64>::default();
        fresh.dispatch("D=60", 1_500).unwrap();

        assert_eq!(used.as_str(), fresh.as_str());
        assert_eq!(used.as_bytes_with_nul(), fresh.as_bytes_with_nul());
    }

    #[test]
    fn delivered_drain_keeps_records_logged_meanwhile() {
        let mut cache = TelemetryCache::<96>::default();
        cache.dispatch("C=1500", 1_000).unwrap();
        cache.dispatch("D=60", 1_500).unwrap();

        let payload_len = cache.begin_drain().len();
        assert_eq!(payload_len, cache.len());

        let during = cache.dispatch("D=61", 1_500).unwrap();
        assert_eq!(during.token, TimestampToken::Absolute(1_500));
        cache.dispatch("D=62", 1_700).unwrap();

        cache.finish_drain(true);

        assert!(!cache.is_draining());
        assert_eq!(cache.as_str(), "#1500,D=61 200,D=62 ");
        assert_terminated(&cache);
    }

    #[test]
    fn failed_drain_keeps_everything() {
        let mut cache = TelemetryCache::<64>::default();
        cache.dispatch("C=1500", 1_000).unwrap();
        let drained = cache.begin_drain().len();

        cache.finish_drain(false);

        assert_eq!(cache.len(), drained);
        assert_eq!(cache.as_str(), "#1000,C=1500 ");
    }

    #[test]
    fn shift_is_suspended_while_draining() {
        let mut cache = TelemetryCache::<32>::new(EvictionPolicy::Shift);
        cache.dispatch("C=1500", 1_000).unwrap();
        cache.begin_drain();

        assert_eq!(
            cache.dispatch("D=123456789012", 1_100),
            Err(CacheError::CacheFull)
        );
        assert_eq!(cache.as_str(), "#1000,C=1500 ");
    }
}
