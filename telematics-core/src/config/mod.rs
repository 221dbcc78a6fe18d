//! Compile-time defaults and validated runtime configuration.
//!
//! The constants mirror the data logger build settings. [`LinkConfig`] and
//! [`UplinkConfig`] are what the rest of the crate reads; both are plain
//! values that the target assembles once at startup and never mutates.

use core::fmt;

use heapless::String;

/// Default cache capacity in bytes.
pub const CACHE_SIZE: usize = 384;

/// Consecutive session errors before the uplink re-joins the access point.
pub const MAX_ERRORS_RECONNECT: u8 = 3;

/// Consecutive session errors before the uplink resets the modem.
pub const MAX_ERRORS_RESET: u8 = 6;

/// Maximum time to wait for connect/send/receive markers.
pub const MAX_CONN_TIME_MS: u32 = 5_000;

/// Maximum HTTP requests issued on one TCP session (keep-alive budget).
pub const MAX_HTTP_CONNS: u16 = 99;

/// Default remote port.
pub const SERVER_PORT: u16 = 443;

/// Minimum control loop period used by the producer side.
pub const MIN_LOOP_TIME_MS: u32 = 500;

/// Elapsed time after which the timestamp codec forces an absolute token.
pub const ABSOLUTE_INTERVAL_MS: u32 = 60_000;

/// Number of additional probe attempts made while waiting for the modem.
pub const PROBE_RETRIES: u8 = 10;

/// Pause between modem probe attempts.
pub const PROBE_INTERVAL_MS: u32 = 100;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;
pub const MAX_HOST_LEN: usize = 64;
pub const MAX_PATH_LEN: usize = 48;

/// Errors raised while assembling configuration values.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    SsidTooLong,
    PasswordTooLong,
    HostTooLong,
    PathTooLong,
    /// Reconnect threshold must be non-zero and not above the reset threshold.
    InvalidThresholds,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::SsidTooLong => write!(f, "ssid exceeds {MAX_SSID_LEN} bytes"),
            ConfigError::PasswordTooLong => {
                write!(f, "password exceeds {MAX_PASSWORD_LEN} bytes")
            }
            ConfigError::HostTooLong => write!(f, "host exceeds {MAX_HOST_LEN} bytes"),
            ConfigError::PathTooLong => write!(f, "path exceeds {MAX_PATH_LEN} bytes"),
            ConfigError::InvalidThresholds => {
                f.write_str("reconnect threshold must be in 1..=reset threshold")
            }
        }
    }
}

/// Consecutive-error thresholds read by the connection state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EscalationThresholds {
    reconnect_after: u8,
    reset_after: u8,
}

impl EscalationThresholds {
    /// Creates a threshold pair, rejecting orderings that could never reconnect.
    pub const fn new(reconnect_after: u8, reset_after: u8) -> Result<Self, ConfigError> {
        if reconnect_after == 0 || reconnect_after > reset_after {
            return Err(ConfigError::InvalidThresholds);
        }

        Ok(Self {
            reconnect_after,
            reset_after,
        })
    }

    #[must_use]
    pub const fn reconnect_after(&self) -> u8 {
        self.reconnect_after
    }

    #[must_use]
    pub const fn reset_after(&self) -> u8 {
        self.reset_after
    }
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            reconnect_after: MAX_ERRORS_RECONNECT,
            reset_after: MAX_ERRORS_RESET,
        }
    }
}

/// Access point credentials, remote endpoint, and link timing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkConfig {
    ssid: String<MAX_SSID_LEN>,
    password: String<MAX_PASSWORD_LEN>,
    host: String<MAX_HOST_LEN>,
    port: u16,
    connect_timeout_ms: u32,
    thresholds: EscalationThresholds,
    keep_alive_budget: u16,
    probe_retries: u8,
    probe_interval_ms: u32,
}

impl LinkConfig {
    /// Builds a configuration with the default timing and thresholds.
    pub fn new(ssid: &str, password: &str, host: &str, port: u16) -> Result<Self, ConfigError> {
        Ok(Self {
            ssid: bounded(ssid, ConfigError::SsidTooLong)?,
            password: bounded(password, ConfigError::PasswordTooLong)?,
            host: bounded(host, ConfigError::HostTooLong)?,
            port,
            connect_timeout_ms: MAX_CONN_TIME_MS,
            thresholds: EscalationThresholds::default(),
            keep_alive_budget: MAX_HTTP_CONNS,
            probe_retries: PROBE_RETRIES,
            probe_interval_ms: PROBE_INTERVAL_MS,
        })
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout_ms: u32) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: EscalationThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Sets the keep-alive budget; zero is treated as one request per session.
    #[must_use]
    pub fn with_keep_alive_budget(mut self, budget: u16) -> Self {
        self.keep_alive_budget = budget.max(1);
        self
    }

    #[must_use]
    pub fn with_probe(mut self, retries: u8, interval_ms: u32) -> Self {
        self.probe_retries = retries;
        self.probe_interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn connect_timeout_ms(&self) -> u32 {
        self.connect_timeout_ms
    }

    #[must_use]
    pub const fn thresholds(&self) -> EscalationThresholds {
        self.thresholds
    }

    #[must_use]
    pub const fn keep_alive_budget(&self) -> u16 {
        self.keep_alive_budget
    }

    #[must_use]
    pub const fn probe_retries(&self) -> u8 {
        self.probe_retries
    }

    #[must_use]
    pub const fn probe_interval_ms(&self) -> u32 {
        self.probe_interval_ms
    }
}

/// HTTP method used when framing drained payloads.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }

    /// Returns `true` when requests carry a body and a `Content-length` header.
    #[must_use]
    pub const fn has_body(self) -> bool {
        matches!(self, HttpMethod::Post)
    }
}

/// Request line target used when payloads are framed as HTTP.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpTarget {
    pub method: HttpMethod,
    pub path: String<MAX_PATH_LEN>,
}

impl HttpTarget {
    pub fn new(method: HttpMethod, path: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            method,
            path: bounded(path, ConfigError::PathTooLong)?,
        })
    }
}

/// Default interval between drains of a non-empty cache.
pub const DEFAULT_DRAIN_INTERVAL_MS: u32 = 1_000;

/// Default pause before retrying a failed access point join.
pub const DEFAULT_JOIN_BACKOFF_MS: u32 = 5_000;

/// Default pause before probing an unresponsive modem again.
pub const DEFAULT_INIT_BACKOFF_MS: u32 = 10_000;

/// Settings read by the uplink control loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UplinkConfig {
    pub link: LinkConfig,
    pub drain_interval_ms: u32,
    pub join_backoff_ms: u32,
    pub init_backoff_ms: u32,
    /// `None` streams the cache as raw TCP payloads.
    pub http: Option<HttpTarget>,
}

impl UplinkConfig {
    #[must_use]
    pub fn new(link: LinkConfig) -> Self {
        Self {
            link,
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL_MS,
            join_backoff_ms: DEFAULT_JOIN_BACKOFF_MS,
            init_backoff_ms: DEFAULT_INIT_BACKOFF_MS,
            http: None,
        }
    }

    #[must_use]
    pub fn with_http(mut self, target: HttpTarget) -> Self {
        self.http = Some(target);
        self
    }

    #[must_use]
    pub fn with_drain_interval(mut self, interval_ms: u32) -> Self {
        self.drain_interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, join_ms: u32, init_ms: u32) -> Self {
        self.join_backoff_ms = join_ms;
        self.init_backoff_ms = init_ms;
        self
    }
}

fn bounded<const N: usize>(value: &str, error: ConfigError) -> Result<String<N>, ConfigError> {
    let mut out = String::new();
    out.push_str(value).map_err(|_| error)?;
    Ok(out)
}
