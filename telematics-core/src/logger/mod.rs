//! Record fan-out to the telemetry cache and a persistent store.
//!
//! The store keeps its own timestamp stream: the first record written to it
//! is stamped absolute, later ones relative to the previous store write. A
//! zero delta is written as `0` because store lines are never merged.

use core::fmt;

use crate::cache::{CacheError, Dispatched, Eviction, TelemetryCache};
use crate::record::Record;
use crate::timestamp::{TimestampCodec, TimestampToken};

/// Failures reported by a [`RecordStore`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    /// The backing medium is missing or was never opened.
    Unavailable,
    WriteFailed,
}

impl StoreError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            StoreError::Unavailable => "unavailable",
            StoreError::WriteFailed => "write failed",
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store {}", self.as_str())
    }
}

/// Durable sink for serialized records.
pub trait RecordStore {
    /// Appends one `<token>,<record>` line and returns the bytes written.
    fn append(&mut self, token: TimestampToken, record: &str) -> Result<usize, StoreError>;

    /// Pushes buffered lines to the medium.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store used when the target has no persistent medium.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullStore;

impl RecordStore for NullStore {
    fn append(&mut self, _: TimestampToken, _: &str) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Reasons a record did not reach the cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogError {
    /// The serialized record is longer than a single record may be.
    RecordTooLong,
    Cache(CacheError),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::RecordTooLong => f.write_str("record too long"),
            LogError::Cache(error) => write!(f, "{error}"),
        }
    }
}

impl From<CacheError> for LogError {
    fn from(error: CacheError) -> Self {
        LogError::Cache(error)
    }
}

/// Running counters kept by [`DataLogger`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LoggerStats {
    pub cached: u32,
    pub dropped: u32,
    pub truncations: u32,
    pub evicted_bytes: u32,
    pub stored: u32,
    pub store_bytes: u32,
    pub store_failures: u32,
}

/// Couples a [`TelemetryCache`] with a [`RecordStore`].
pub struct DataLogger<S: RecordStore, const N: usize> {
    cache: TelemetryCache<N>,
    store: S,
    store_codec: TimestampCodec,
    stats: LoggerStats,
}

impl<S: RecordStore, const N: usize> DataLogger<S, N> {
    #[must_use]
    pub fn new(cache: TelemetryCache<N>, store: S) -> Self {
        Self {
            cache,
            store,
            store_codec: TimestampCodec::new(),
            stats: LoggerStats::default(),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &TelemetryCache<N> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TelemetryCache<N> {
        &mut self.cache
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn stats(&self) -> LoggerStats {
        self.stats
    }

    /// Serializes `record`, dispatches it to the cache, and appends it to the
    /// store. Store failures are counted but never surface as errors.
    pub fn log(&mut self, record: &Record) -> Result<Dispatched, LogError> {
        let text = record.to_text().map_err(|_| LogError::RecordTooLong)?;

        let cached = self.cache.dispatch(&text, record.time_ms);
        match cached {
            Ok(dispatched) => {
                self.stats.cached += 1;
                if let Eviction::Truncated { .. } = dispatched.eviction {
                    self.stats.truncations += 1;
                }
                let discarded = u32::try_from(dispatched.eviction.discarded()).unwrap_or(u32::MAX);
                self.stats.evicted_bytes = self.stats.evicted_bytes.saturating_add(discarded);
            }
            Err(_) => self.stats.dropped += 1,
        }

        self.record(&text, record.time_ms);

        cached.map_err(LogError::from)
    }

    /// Flushes the store, counting a failure like any other store error.
    pub fn flush(&mut self) {
        if let Err(error) = self.store.flush() {
            self.stats.store_failures += 1;
            diag_warn!("logger: store flush failed: {}", error.as_str());
        }
    }

    fn record(&mut self, text: &str, now: u32) {
        let first = self.stats.store_bytes == 0;
        let token = match self.store_codec.encode(now, first) {
            TimestampToken::Repeat => TimestampToken::Relative(0),
            token => token,
        };

        match self.store.append(token, text) {
            Ok(written) => {
                self.stats.stored += 1;
                self.stats.store_bytes = self
                    .stats
                    .store_bytes
                    .saturating_add(u32::try_from(written).unwrap_or(u32::MAX));
            }
            Err(error) => {
                self.stats.store_failures += 1;
                diag_warn!("logger: store append failed: {}", error.as_str());
            }
        }
    }
}
