//! Connection state machine for the ESP8266-style AT modem.
//!
//! The driver owns the consecutive-error counter. Only a matching success
//! clears it; timeouts and prompt failures increment it. Callers read
//! [`LinkDriver::escalation`] to decide between retrying a step,
//! re-joining the access point, or resetting the modem.

use core::fmt::{self, Write};

use heapless::String;

use super::channel::{CommandChannel, DEFAULT_TIMEOUT_MS, ExchangeOutcome, Poll, SETTLE_DELAY_MS};
use super::http::request_header;
use super::{
    ByteTransport, Clock, MARKER_INBOUND, MARKER_LINKED, MARKER_OK, MARKER_PROMPT,
    MARKER_SEND_OK, MARKER_UNLINK,
};
use crate::config::{HttpTarget, LinkConfig};

/// Deadline for the access point association command.
pub const JOIN_TIMEOUT_MS: u32 = 10_000;
/// Deadline for the address query following a join.
pub const ADDRESS_TIMEOUT_MS: u32 = 1_000;
/// Deadline for the `>` prompt after announcing a send.
pub const PROMPT_TIMEOUT_MS: u32 = 1_000;
pub const CLOSE_TIMEOUT_MS: u32 = 1_000;
pub const MODE_TIMEOUT_MS: u32 = 100;

const MAX_COMMAND_LEN: usize = 160;
const UNBOUND_ADDRESS: &str = "0.0.0.0";

type Command = String<MAX_COMMAND_LEN>;

/// Address leased by the access point.
pub type Address = String<32>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkState {
    /// Not associated with an access point.
    Disconnected,
    /// Associated and idle; a session may or may not be open.
    Ready,
    /// Waiting for the TCP link to come up.
    Connecting,
    /// Waiting for the send acknowledgement.
    Sending,
    /// Waiting for the server response.
    Receiving,
    /// A session step timed out.
    HttpError,
}

impl LinkState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Ready => "ready",
            LinkState::Connecting => "connecting",
            LinkState::Sending => "sending",
            LinkState::Receiving => "receiving",
            LinkState::HttpError => "http-error",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session step that failed to complete in time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    Connect,
    /// The modem never offered the `>` send prompt.
    Prompt,
    Send,
    Receive,
}

impl SessionPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Connect => "connect",
            SessionPhase::Prompt => "prompt",
            SessionPhase::Send => "send",
            SessionPhase::Receive => "receive",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinFailure {
    /// The access point rejected the association.
    Refused,
    /// Associated, but no address was leased.
    NoAddress,
    Timeout,
    /// Credentials did not fit the command buffer.
    CommandOverflow,
}

impl JoinFailure {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            JoinFailure::Refused => "join refused",
            JoinFailure::NoAddress => "no address",
            JoinFailure::Timeout => "timeout",
            JoinFailure::CommandOverflow => "command overflow",
        }
    }
}

impl fmt::Display for JoinFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkError {
    /// Probe retries exhausted without an `OK`.
    ModemUnresponsive,
    AssociationFailed(JoinFailure),
    SessionTimeout(SessionPhase),
    /// A command or request header did not fit its buffer.
    CommandOverflow,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::ModemUnresponsive => f.write_str("modem unresponsive"),
            LinkError::AssociationFailed(reason) => write!(f, "association failed: {reason}"),
            LinkError::SessionTimeout(phase) => write!(f, "session timeout during {phase}"),
            LinkError::CommandOverflow => f.write_str("command overflow"),
        }
    }
}

/// Recovery action implied by the consecutive-error count.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Escalation {
    Retry,
    /// Re-join the access point and reopen the session.
    Reconnect,
    /// Reset and re-initialize the modem.
    Reset,
}

/// How a send request was handled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Submission {
    /// Nothing to send; no command was issued.
    Skipped,
    /// Payload written; poll for the acknowledgement.
    InFlight,
}

/// Drives the modem through join, session and send steps.
pub struct LinkDriver<T, C> {
    channel: CommandChannel<T, C>,
    config: LinkConfig,
    state: LinkState,
    errors: u8,
    last_activity_ms: u32,
    step_started_ms: u32,
    requests: u16,
    session_open: bool,
    awaiting_response: bool,
}

impl<T: ByteTransport, C: Clock> LinkDriver<T, C> {
    #[must_use]
    pub fn new(transport: T, clock: C, config: LinkConfig) -> Self {
        Self {
            channel: CommandChannel::new(transport, clock),
            config,
            state: LinkState::Disconnected,
            errors: 0,
            last_activity_ms: 0,
            step_started_ms: 0,
            requests: 0,
            session_open: false,
            awaiting_response: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Consecutive session errors since the last matching success.
    #[must_use]
    pub const fn errors(&self) -> u8 {
        self.errors
    }

    #[must_use]
    pub const fn last_activity_ms(&self) -> u32 {
        self.last_activity_ms
    }

    /// Requests issued on the current session.
    #[must_use]
    pub const fn requests(&self) -> u16 {
        self.requests
    }

    #[must_use]
    pub const fn is_session_open(&self) -> bool {
        self.session_open
    }

    #[must_use]
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    #[must_use]
    pub fn channel(&self) -> &CommandChannel<T, C> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut CommandChannel<T, C> {
        &mut self.channel
    }

    #[must_use]
    pub fn now_ms(&self) -> u32 {
        self.channel.now_ms()
    }

    /// Returns `true` once the keep-alive budget of the session is spent.
    #[must_use]
    pub fn keep_alive_exhausted(&self) -> bool {
        self.requests >= self.config.keep_alive_budget()
    }

    /// Maps the error counter onto the configured thresholds.
    #[must_use]
    pub fn escalation(&self) -> Escalation {
        let thresholds = self.config.thresholds();
        if self.errors >= thresholds.reset_after() {
            Escalation::Reset
        } else if self.errors >= thresholds.reconnect_after() {
            Escalation::Reconnect
        } else {
            Escalation::Retry
        }
    }

    /// Probes the modem until it answers, then applies station mode and
    /// single-connection settings.
    pub fn init_modem(&mut self) -> Result<(), LinkError> {
        let retries = self.config.probe_retries();
        let mut answered = false;

        for attempt in 0..=retries {
            if self
                .channel
                .exchange(b"ATE0\r\n", DEFAULT_TIMEOUT_MS, MARKER_OK)
                .is_matched()
            {
                answered = true;
                break;
            }
            if attempt < retries {
                self.channel.delay_ms(self.config.probe_interval_ms());
            }
        }

        if !answered {
            diag_warn!("link: modem silent after {} probes", u16::from(retries) + 1);
            return Err(LinkError::ModemUnresponsive);
        }

        self.channel
            .exchange(b"AT+CWMODE=1\r\n", MODE_TIMEOUT_MS, MARKER_OK);
        self.channel
            .exchange(b"AT+CIPMUX=0\r\n", DEFAULT_TIMEOUT_MS, MARKER_OK);
        self.state = LinkState::Disconnected;
        self.session_open = false;
        diag_info!("link: modem ready");
        Ok(())
    }

    /// Associates with the configured access point and reports the leased
    /// address.
    pub fn join_network(&mut self) -> Result<Address, LinkError> {
        let join = format_command(format_args!(
            "AT+CWJAP=\"{}\",\"{}\"\r\n",
            self.config.ssid(),
            self.config.password()
        ))
        .map_err(|_| LinkError::AssociationFailed(JoinFailure::CommandOverflow))?;

        self.state = LinkState::Disconnected;
        self.session_open = false;

        if !self
            .channel
            .exchange(join.as_bytes(), JOIN_TIMEOUT_MS, MARKER_OK)
            .is_matched()
        {
            let reason = if self.channel.response_contains("FAIL")
                || self.channel.response_contains("ERROR")
            {
                JoinFailure::Refused
            } else {
                JoinFailure::Timeout
            };
            diag_warn!("link: join failed: {}", reason.as_str());
            return Err(LinkError::AssociationFailed(reason));
        }

        let queried = self
            .channel
            .exchange(b"AT+CIFSR\r\n", ADDRESS_TIMEOUT_MS, MARKER_OK);
        if queried == ExchangeOutcome::TimedOut || self.channel.response_contains(UNBOUND_ADDRESS)
        {
            diag_warn!("link: joined without an address");
            return Err(LinkError::AssociationFailed(JoinFailure::NoAddress));
        }

        let address = leased_address(self.channel.response());
        self.state = LinkState::Ready;
        self.last_activity_ms = self.channel.now_ms();
        diag_info!("link: joined, address {}", address.as_str());
        Ok(address)
    }

    /// Issues the TCP connect command without waiting for the link.
    pub fn open_session(&mut self) -> Result<(), LinkError> {
        let start = format_command(format_args!(
            "AT+CIPSTART=\"TCP\",\"{}\",{}\r\n",
            self.config.host(),
            self.config.port()
        ))
        .map_err(|_| LinkError::CommandOverflow)?;

        self.channel.send(start.as_bytes());
        self.step_started_ms = self.channel.now_ms();
        self.state = LinkState::Connecting;
        self.session_open = false;
        self.requests = 0;
        Ok(())
    }

    pub fn poll_connected(&mut self) -> Poll {
        let poll = self.check(MARKER_LINKED, SessionPhase::Connect);
        if poll == Poll::Complete {
            self.session_open = true;
            self.state = LinkState::Ready;
        }
        poll
    }

    /// Writes a raw TCP payload after the size handshake.
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<Submission, LinkError> {
        if payload.is_empty() {
            return Ok(Submission::Skipped);
        }

        self.announce(payload.len())?;
        self.channel.clear_response();
        self.channel.write(payload);
        self.begin_send(false);
        Ok(Submission::InFlight)
    }

    /// Frames `body` as an HTTP request on the open session.
    ///
    /// The last request that fits the keep-alive budget asks the server to
    /// close the connection.
    pub fn send_http(&mut self, target: &HttpTarget, body: &[u8]) -> Result<Submission, LinkError> {
        if body.is_empty() {
            return Ok(Submission::Skipped);
        }

        let request = self.requests.saturating_add(1);
        let keep_alive = request < self.config.keep_alive_budget();
        let header = request_header(
            target.method,
            &target.path,
            self.config.host(),
            keep_alive,
            body.len(),
        )
        .map_err(|_| LinkError::CommandOverflow)?;

        self.announce(header.len() + body.len())?;
        self.channel.clear_response();
        self.channel.write(header.as_bytes());
        self.channel.delay_ms(SETTLE_DELAY_MS);
        self.channel.write(body);
        self.requests = request;
        self.begin_send(true);
        Ok(Submission::InFlight)
    }

    pub fn poll_sent(&mut self) -> Poll {
        let poll = self.check(MARKER_SEND_OK, SessionPhase::Send);
        if poll == Poll::Complete {
            if self.awaiting_response {
                self.step_started_ms = self.channel.now_ms();
                self.state = LinkState::Receiving;
            } else {
                self.state = LinkState::Ready;
            }
        }
        poll
    }

    pub fn poll_received(&mut self) -> Poll {
        let poll = self.check(MARKER_INBOUND, SessionPhase::Receive);
        if poll == Poll::Complete {
            self.awaiting_response = false;
            self.state = LinkState::Ready;
            if self.keep_alive_exhausted() {
                self.session_open = false;
            }
        }
        poll
    }

    /// Tears down the TCP session.
    pub fn close_session(&mut self) -> ExchangeOutcome {
        let outcome = self
            .channel
            .exchange(b"AT+CIPCLOSE\r\n", CLOSE_TIMEOUT_MS, MARKER_UNLINK);
        self.session_open = false;
        self.awaiting_response = false;
        if self.state != LinkState::Disconnected {
            self.state = LinkState::Ready;
        }
        outcome
    }

    /// Leaves the access point.
    pub fn disconnect(&mut self) -> ExchangeOutcome {
        let outcome = self
            .channel
            .exchange(b"AT+CWQAP\r\n", DEFAULT_TIMEOUT_MS, MARKER_OK);
        self.state = LinkState::Disconnected;
        self.session_open = false;
        self.awaiting_response = false;
        outcome
    }

    /// Restarts the modem firmware. Call [`LinkDriver::init_modem`] afterwards.
    pub fn reset_modem(&mut self) -> ExchangeOutcome {
        let outcome = self
            .channel
            .exchange(b"AT+RST\r\n", DEFAULT_TIMEOUT_MS, MARKER_OK);
        self.state = LinkState::Disconnected;
        self.session_open = false;
        self.awaiting_response = false;
        self.requests = 0;
        outcome
    }

    fn announce(&mut self, len: usize) -> Result<(), LinkError> {
        let announce = format_command(format_args!("AT+CIPSEND={len}\r\n"))
            .map_err(|_| LinkError::CommandOverflow)?;

        if self
            .channel
            .exchange(announce.as_bytes(), PROMPT_TIMEOUT_MS, MARKER_PROMPT)
            .is_matched()
        {
            return Ok(());
        }

        self.errors = self.errors.saturating_add(1);
        diag_warn!("link: no send prompt, errors={}", self.errors);
        Err(LinkError::SessionTimeout(SessionPhase::Prompt))
    }

    fn begin_send(&mut self, awaiting_response: bool) {
        self.step_started_ms = self.channel.now_ms();
        self.awaiting_response = awaiting_response;
        self.state = LinkState::Sending;
    }

    fn check(&mut self, marker: &str, phase: SessionPhase) -> Poll {
        let poll = self.channel.check_buffer(
            marker,
            self.step_started_ms,
            self.config.connect_timeout_ms(),
        );

        match poll {
            Poll::Complete => {
                self.errors = 0;
                self.last_activity_ms = self.channel.now_ms();
            }
            Poll::Failed => {
                self.errors = self.errors.saturating_add(1);
                self.state = LinkState::HttpError;
                diag_warn!(
                    "link: {} timed out, errors={}",
                    phase.as_str(),
                    self.errors
                );
            }
            Poll::Pending => {}
        }

        poll
    }
}

fn format_command(args: fmt::Arguments<'_>) -> Result<Command, fmt::Error> {
    let mut command = Command::new();
    command.write_fmt(args)?;
    Ok(command)
}

/// Extracts the address from an `AT+CIFSR` reply.
///
/// Accepts both the bare `a.b.c.d` line and the `+CIFSR:STAIP,"a.b.c.d"`
/// form; the first non-empty line wins.
fn leased_address(response: &[u8]) -> Address {
    let mut address = Address::new();
    let Ok(text) = core::str::from_utf8(response) else {
        return address;
    };

    let line = text
        .split(['\r', '\n'])
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let value = line.rsplit(',').next().unwrap_or(line).trim_matches('"');

    for ch in value.chars() {
        if address.push(ch).is_err() {
            break;
        }
    }
    address
}
