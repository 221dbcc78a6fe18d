use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use telematics_core::modem::{ByteTransport, Clock, ResponseBuffer, contains_marker};

/// Millisecond clock shared between the session and the simulated modem.
#[derive(Clone, Default)]
pub struct VirtualClock {
    now: Rc<Cell<u32>>,
}

impl VirtualClock {
    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

/// Behaviour knobs for the simulated modem.
#[derive(Clone, Copy, Debug)]
pub struct ModemProfile {
    /// Delay before the first byte of a reply.
    pub latency_ms: u32,
    /// Serial throughput; 11 is roughly 115200 baud.
    pub bytes_per_ms: u32,
    /// Swallow the `SEND OK` of every n-th payload.
    pub fail_every: Option<u32>,
    /// Number of join attempts to reject before accepting one.
    pub reject_joins: u32,
}

impl Default for ModemProfile {
    fn default() -> Self {
        Self {
            latency_ms: 40,
            bytes_per_ms: 11,
            fail_every: None,
            reject_joins: 0,
        }
    }
}

/// ESP8266-flavoured AT responder behind a serial line running in virtual
/// time. Replies arrive byte by byte at the configured rate, so a reader that
/// stops at a marker leaves the rest of the reply on the line.
pub struct SimulatedModem {
    clock: VirtualClock,
    profile: ModemProfile,
    rejected: u32,
    sends: u32,
    expecting: usize,
    partial: Vec<u8>,
    // Each byte with its arrival time.
    line: VecDeque<(u32, u8)>,
    line_free_at: u32,
    delivered: Vec<Vec<u8>>,
    dropped_acks: u32,
}

impl SimulatedModem {
    pub fn new(clock: VirtualClock, profile: ModemProfile) -> Self {
        Self {
            clock,
            profile,
            rejected: 0,
            sends: 0,
            expecting: 0,
            partial: Vec::new(),
            line: VecDeque::new(),
            line_free_at: 0,
            delivered: Vec::new(),
            dropped_acks: 0,
        }
    }

    /// Payloads the modem accepted, in arrival order.
    pub fn delivered(&self) -> &[Vec<u8>] {
        &self.delivered
    }

    pub fn dropped_acks(&self) -> u32 {
        self.dropped_acks
    }

    fn now(&self) -> u32 {
        self.clock.now_ms()
    }

    fn transmit(&mut self, bytes: &[u8]) {
        let rate = self.profile.bytes_per_ms.max(1);
        let mut at = self
            .now()
            .wrapping_add(self.profile.latency_ms)
            .max(self.line_free_at);

        for (index, byte) in (0u32..).zip(bytes) {
            if index > 0 && index.is_multiple_of(rate) {
                at = at.wrapping_add(1);
            }
            self.line.push_back((at, *byte));
        }
        self.line_free_at = at.wrapping_add(1);
    }

    fn accept_payload(&mut self, bytes: &[u8]) {
        let take = bytes.len().min(self.expecting);
        self.partial.extend_from_slice(&bytes[..take]);
        self.expecting -= take;
        if self.expecting > 0 {
            return;
        }

        let payload = std::mem::take(&mut self.partial);
        let is_http = payload.starts_with(b"POST ") || payload.starts_with(b"GET ");
        self.transmit(format!("\r\nRecv {} bytes\r\n", payload.len()).as_bytes());
        self.delivered.push(payload);
        self.sends += 1;

        if self
            .profile
            .fail_every
            .is_some_and(|every| every > 0 && self.sends.is_multiple_of(every))
        {
            self.dropped_acks += 1;
            return;
        }

        self.transmit(b"\r\nSEND OK\r\n");
        if is_http {
            self.transmit(b"\r\n+IPD,19:HTTP/1.1 204 OK\r\n\r\n");
        }
    }

    fn answer(&mut self, command: &str) -> &'static [u8] {
        let command = command.trim_end();
        let (verb, argument) = command.split_once('=').unwrap_or((command, ""));

        match verb {
            "AT+CWJAP" if self.rejected < self.profile.reject_joins => {
                self.rejected += 1;
                b"+CWJAP:2\r\n\r\nFAIL\r\n"
            }
            "AT+CWJAP" => b"WIFI CONNECTED\r\nWIFI GOT IP\r\n\r\nOK\r\n",
            "AT+CIFSR" => {
                b"+CIFSR:STAIP,\"192.168.4.7\"\r\n+CIFSR:STAMAC,\"5c:cf:7f:00:00:01\"\r\n\r\nOK\r\n"
            }
            "AT+CIPSTART" => b"CONNECT\r\n\r\nOK\r\nLinked\r\n",
            "AT+CIPCLOSE" => b"CLOSED\r\n\r\nOK\r\nUnlink\r\n",
            "AT+CIPSEND" => {
                self.expecting = argument.parse().unwrap_or(0);
                b"\r\nOK\r\n> "
            }
            "AT+RST" => {
                self.line.clear();
                self.line_free_at = 0;
                b"\r\nOK\r\n\r\nready\r\n"
            }
            _ if verb.starts_with("AT") => b"\r\nOK\r\n",
            _ => b"\r\nERROR\r\n",
        }
    }
}

impl ByteTransport for SimulatedModem {
    fn write(&mut self, bytes: &[u8]) {
        if self.expecting > 0 {
            self.accept_payload(bytes);
        } else {
            let command = String::from_utf8_lossy(bytes);
            let reply = self.answer(&command);
            self.transmit(reply);
        }
    }

    fn purge_input(&mut self) {
        let now = self.now();
        while self.line.front().is_some_and(|(at, _)| *at <= now) {
            self.line.pop_front();
        }
    }

    fn read_until(&mut self, rx: &mut ResponseBuffer, timeout_ms: u32, token: &str) -> usize {
        let deadline = self.now().wrapping_add(timeout_ms);

        while let Some(&(at, byte)) = self.line.front() {
            if at > deadline || rx.is_full() {
                break;
            }
            self.line.pop_front();
            self.clock.set(self.now().max(at));
            // Checked for room above.
            let _ = rx.push(byte);
            if contains_marker(rx, token) {
                return rx.len();
            }
        }

        if !rx.is_full() {
            self.clock.set(deadline);
        }
        0
    }
}
