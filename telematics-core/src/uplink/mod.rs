//! Uplink control loop.
//!
//! [`Uplink::poll`] advances the modem by one step per call: initialize,
//! join, open the session, then alternate between draining the cache and
//! waiting for acknowledgements. Only the fixed handshake exchanges block,
//! and never longer than their deadlines.
//!
//! Session failures are routed through [`LinkDriver::escalation`]. A plain
//! retry re-issues the failed step, a reconnect leaves and re-joins the
//! access point, and a reset restarts the modem from initialization.

use core::fmt;

use crate::cache::{CacheError, Dispatched, Eviction, TelemetryCache};
use crate::config::{HttpTarget, UplinkConfig};
use crate::logger::LogError;
use crate::modem::{
    Address, ByteTransport, Clock, Escalation, JoinFailure, LinkDriver, LinkError, Poll,
    SessionPhase, Submission,
};

/// Step the loop will attempt on its next poll.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UplinkPhase {
    Init,
    Join,
    Open,
    Connecting,
    Idle,
    AwaitSent,
    AwaitResponse,
}

/// Error kinds surfaced by the uplink, including cache data loss.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkFault {
    ModemUnresponsive,
    AssociationFailed(JoinFailure),
    SessionTimeout(SessionPhase),
    CommandOverflow,
    /// A record was rejected by a full cache.
    CacheFull,
    /// Shift eviction found no entry boundary and cleared the cache.
    TruncatedCompaction { discarded: usize },
}

impl LinkFault {
    /// Maps a logger result onto the data loss it reports, if any.
    #[must_use]
    pub fn from_log(result: &Result<Dispatched, LogError>) -> Option<Self> {
        match result {
            Ok(Dispatched {
                eviction: Eviction::Truncated { discarded },
                ..
            }) => Some(LinkFault::TruncatedCompaction {
                discarded: *discarded,
            }),
            Err(LogError::Cache(CacheError::CacheFull)) => Some(LinkFault::CacheFull),
            _ => None,
        }
    }
}

impl From<LinkError> for LinkFault {
    fn from(error: LinkError) -> Self {
        match error {
            LinkError::ModemUnresponsive => LinkFault::ModemUnresponsive,
            LinkError::AssociationFailed(reason) => LinkFault::AssociationFailed(reason),
            LinkError::SessionTimeout(phase) => LinkFault::SessionTimeout(phase),
            LinkError::CommandOverflow => LinkFault::CommandOverflow,
        }
    }
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFault::ModemUnresponsive => f.write_str("modem unresponsive"),
            LinkFault::AssociationFailed(reason) => write!(f, "association failed: {reason}"),
            LinkFault::SessionTimeout(phase) => write!(f, "session timeout during {phase}"),
            LinkFault::CommandOverflow => f.write_str("command overflow"),
            LinkFault::CacheFull => f.write_str("cache full"),
            LinkFault::TruncatedCompaction { discarded } => {
                write!(f, "cache truncated, {discarded} bytes lost")
            }
        }
    }
}

/// What the loop does after a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Recovery {
    /// Re-issue the failed step on the next poll.
    Retry,
    /// Left the access point; the next polls re-join and reopen.
    Reconnect,
    /// Reset the modem; the next polls re-initialize it.
    Reset,
    /// Pause until the given time before retrying.
    Backoff { until_ms: u32 },
}

impl From<Escalation> for Recovery {
    fn from(escalation: Escalation) -> Self {
        match escalation {
            Escalation::Retry => Recovery::Retry,
            Escalation::Reconnect => Recovery::Reconnect,
            Escalation::Reset => Recovery::Reset,
        }
    }
}

/// Outcome of one [`Uplink::poll`] step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UplinkEvent {
    /// Nothing to do yet.
    Idle,
    /// Waiting on a marker or a backoff deadline.
    Waiting,
    ModemReady,
    Joined(Address),
    /// TCP connect issued.
    Connecting,
    Connected,
    /// Cache content handed to the modem.
    Draining { bytes: usize },
    /// The modem acknowledged the drained bytes; they left the cache.
    Delivered { bytes: usize },
    ResponseReceived,
    Fault { fault: LinkFault, recovery: Recovery },
}

/// Drives a [`LinkDriver`] and drains a [`TelemetryCache`] through it.
pub struct Uplink<T, C> {
    link: LinkDriver<T, C>,
    phase: UplinkPhase,
    http: Option<HttpTarget>,
    drain_interval_ms: u32,
    join_backoff_ms: u32,
    init_backoff_ms: u32,
    resume_at: Option<u32>,
    last_drain_ms: Option<u32>,
    in_flight: usize,
}

impl<T: ByteTransport, C: Clock> Uplink<T, C> {
    #[must_use]
    pub fn new(transport: T, clock: C, config: UplinkConfig) -> Self {
        let UplinkConfig {
            link,
            drain_interval_ms,
            join_backoff_ms,
            init_backoff_ms,
            http,
        } = config;

        Self {
            link: LinkDriver::new(transport, clock, link),
            phase: UplinkPhase::Init,
            http,
            drain_interval_ms,
            join_backoff_ms,
            init_backoff_ms,
            resume_at: None,
            last_drain_ms: None,
            in_flight: 0,
        }
    }

    #[must_use]
    pub const fn phase(&self) -> UplinkPhase {
        self.phase
    }

    #[must_use]
    pub fn link(&self) -> &LinkDriver<T, C> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkDriver<T, C> {
        &mut self.link
    }

    /// Performs one step of the loop.
    pub fn poll<const N: usize>(&mut self, cache: &mut TelemetryCache<N>) -> UplinkEvent {
        let now = self.link.now_ms();
        if let Some(resume_at) = self.resume_at {
            if !reached(now, resume_at) {
                return UplinkEvent::Waiting;
            }
            self.resume_at = None;
        }

        match self.phase {
            UplinkPhase::Init => match self.link.init_modem() {
                Ok(()) => {
                    self.phase = UplinkPhase::Join;
                    UplinkEvent::ModemReady
                }
                Err(error) => self.back_off(error, self.init_backoff_ms),
            },
            UplinkPhase::Join => match self.link.join_network() {
                Ok(address) => {
                    self.phase = UplinkPhase::Open;
                    UplinkEvent::Joined(address)
                }
                Err(error) => self.back_off(error, self.join_backoff_ms),
            },
            UplinkPhase::Open => self.open(),
            UplinkPhase::Connecting => match self.link.poll_connected() {
                Poll::Pending => UplinkEvent::Waiting,
                Poll::Complete => {
                    self.phase = UplinkPhase::Idle;
                    UplinkEvent::Connected
                }
                Poll::Failed => self.recover(SessionPhase::Connect),
            },
            UplinkPhase::Idle => self.drain(cache, now),
            UplinkPhase::AwaitSent => match self.link.poll_sent() {
                Poll::Pending => UplinkEvent::Waiting,
                Poll::Complete => {
                    cache.finish_drain(true);
                    let bytes = core::mem::take(&mut self.in_flight);
                    self.phase = if self.http.is_some() {
                        UplinkPhase::AwaitResponse
                    } else {
                        UplinkPhase::Idle
                    };
                    UplinkEvent::Delivered { bytes }
                }
                Poll::Failed => {
                    cache.finish_drain(false);
                    self.in_flight = 0;
                    self.recover(SessionPhase::Send)
                }
            },
            UplinkPhase::AwaitResponse => match self.link.poll_received() {
                Poll::Pending => UplinkEvent::Waiting,
                Poll::Complete => {
                    self.phase = if self.link.is_session_open() {
                        UplinkPhase::Idle
                    } else {
                        UplinkPhase::Open
                    };
                    UplinkEvent::ResponseReceived
                }
                Poll::Failed => self.recover(SessionPhase::Receive),
            },
        }
    }

    fn open(&mut self) -> UplinkEvent {
        match self.link.open_session() {
            Ok(()) => {
                self.phase = UplinkPhase::Connecting;
                UplinkEvent::Connecting
            }
            Err(error) => self.back_off(error, self.join_backoff_ms),
        }
    }

    fn drain<const N: usize>(&mut self, cache: &mut TelemetryCache<N>, now: u32) -> UplinkEvent {
        if !self.link.is_session_open() {
            return self.open();
        }

        let due = self
            .last_drain_ms
            .is_none_or(|last| now.wrapping_sub(last) >= self.drain_interval_ms);
        if cache.is_empty() || !due {
            return UplinkEvent::Idle;
        }
        self.last_drain_ms = Some(now);

        let payload = cache.begin_drain().as_bytes();
        let bytes = payload.len();
        let submitted = match &self.http {
            Some(target) => self.link.send_http(target, payload),
            None => self.link.send_payload(payload),
        };

        match submitted {
            Ok(Submission::InFlight) => {
                self.in_flight = bytes;
                self.phase = UplinkPhase::AwaitSent;
                UplinkEvent::Draining { bytes }
            }
            Ok(Submission::Skipped) => {
                cache.finish_drain(true);
                UplinkEvent::Idle
            }
            Err(error) => {
                cache.finish_drain(false);
                match error {
                    LinkError::SessionTimeout(phase) => self.recover(phase),
                    other => self.back_off(other, self.join_backoff_ms),
                }
            }
        }
    }

    fn recover(&mut self, phase: SessionPhase) -> UplinkEvent {
        let escalation = self.link.escalation();
        match escalation {
            Escalation::Retry => {
                self.phase = match phase {
                    SessionPhase::Connect => UplinkPhase::Open,
                    SessionPhase::Prompt | SessionPhase::Send | SessionPhase::Receive => {
                        self.last_drain_ms = None;
                        UplinkPhase::Idle
                    }
                };
            }
            Escalation::Reconnect => {
                diag_warn!(
                    "uplink: {} errors, re-joining access point",
                    self.link.errors()
                );
                self.link.close_session();
                self.link.disconnect();
                self.phase = UplinkPhase::Join;
            }
            Escalation::Reset => {
                diag_warn!("uplink: {} errors, resetting modem", self.link.errors());
                self.link.reset_modem();
                self.phase = UplinkPhase::Init;
            }
        }

        UplinkEvent::Fault {
            fault: LinkFault::SessionTimeout(phase),
            recovery: escalation.into(),
        }
    }

    fn back_off(&mut self, error: LinkError, delay_ms: u32) -> UplinkEvent {
        let until_ms = self.link.now_ms().wrapping_add(delay_ms);
        self.resume_at = Some(until_ms);
        UplinkEvent::Fault {
            fault: error.into(),
            recovery: Recovery::Backoff { until_ms },
        }
    }
}

// Wrap-aware "now is at or past deadline".
fn reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < u32::MAX / 2
}
