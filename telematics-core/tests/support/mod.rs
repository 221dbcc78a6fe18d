#![allow(dead_code)]

use core::cell::Cell;

use telematics_core::modem::{ByteTransport, Clock, ResponseBuffer, contains_marker};

pub struct VirtualClock<'a> {
    pub now: &'a Cell<u32>,
}

impl Clock for VirtualClock<'_> {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.now.set(self.now.get() + ms);
    }
}

/// Scripted ESP8266 stand-in sharing a virtual clock with the code under test.
///
/// Replies are scheduled `latency_ms` after the command arrives and only
/// become visible once `read_until` runs the clock up to them.
pub struct FakeModem<'a> {
    now: &'a Cell<u32>,
    pub latency_ms: u32,
    pub silent: bool,
    pub reject_join: bool,
    pub refuse_connect: bool,
    /// Number of upcoming `SEND OK` acknowledgements to swallow.
    pub drop_acks: u32,
    pub commands: Vec<String>,
    pub payloads: Vec<Vec<u8>>,
    expecting: usize,
    partial: Vec<u8>,
    pending: Vec<(u32, Vec<u8>)>,
}

impl<'a> FakeModem<'a> {
    pub fn new(now: &'a Cell<u32>) -> Self {
        Self {
            now,
            latency_ms: 20,
            silent: false,
            reject_join: false,
            refuse_connect: false,
            drop_acks: 0,
            commands: Vec::new(),
            payloads: Vec::new(),
            expecting: 0,
            partial: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn saw(&self, prefix: &str) -> bool {
        self.commands.iter().any(|command| command.starts_with(prefix))
    }

    fn reply(&mut self, bytes: &[u8]) {
        if self.silent {
            return;
        }
        let ready_at = self.now.get() + self.latency_ms;
        self.pending.push((ready_at, bytes.to_vec()));
    }

    fn accept_payload(&mut self, bytes: &[u8]) {
        let take = bytes.len().min(self.expecting);
        self.partial.extend_from_slice(&bytes[..take]);
        self.expecting -= take;
        if self.expecting > 0 {
            return;
        }

        let payload = core::mem::take(&mut self.partial);
        let is_http = payload.starts_with(b"POST") || payload.starts_with(b"GET");
        let recv = format!("\r\nRecv {} bytes\r\n", payload.len());
        self.payloads.push(payload);

        if self.drop_acks > 0 {
            self.drop_acks -= 1;
            return;
        }

        self.reply(recv.as_bytes());
        self.reply(b"\r\nSEND OK\r\n");
        if is_http {
            self.reply(b"\r\n+IPD,17:HTTP/1.1 200 OK\r\n");
        }
    }

    fn accept_command(&mut self, command: &str) {
        self.commands.push(command.to_owned());

        if command.starts_with("AT+CWJAP=") {
            if self.reject_join {
                self.reply(b"+CWJAP:2\r\n\r\nFAIL\r\n");
            } else {
                self.reply(b"WIFI CONNECTED\r\nWIFI GOT IP\r\n\r\nOK\r\n");
            }
        } else if command.starts_with("AT+CIFSR") {
            self.reply(b"+CIFSR:STAIP,\"192.168.4.2\"\r\n\r\nOK\r\n");
        } else if command.starts_with("AT+CIPSTART=") {
            if self.refuse_connect {
                self.reply(b"ERROR\r\n");
            } else {
                self.reply(b"CONNECT\r\n\r\nOK\r\nLinked\r\n");
            }
        } else if command.starts_with("AT+CIPCLOSE") {
            self.reply(b"CLOSED\r\n\r\nOK\r\nUnlink\r\n");
        } else if let Some(size) = command.strip_prefix("AT+CIPSEND=") {
            self.expecting = size.trim().parse().unwrap_or(0);
            self.reply(b"\r\nOK\r\n> ");
        } else if command.starts_with("AT") {
            self.reply(b"\r\nOK\r\n");
        } else {
            self.reply(b"\r\nERROR\r\n");
        }
    }
}

impl ByteTransport for FakeModem<'_> {
    fn write(&mut self, bytes: &[u8]) {
        if self.expecting > 0 {
            self.accept_payload(bytes);
            return;
        }

        let command = String::from_utf8_lossy(bytes).into_owned();
        self.accept_command(&command);
    }

    fn purge_input(&mut self) {
        let now = self.now.get();
        self.pending.retain(|(ready_at, _)| *ready_at > now);
    }

    fn read_until(&mut self, rx: &mut ResponseBuffer, timeout_ms: u32, token: &str) -> usize {
        let deadline = self.now.get() + timeout_ms;

        while let Some(index) = self
            .pending
            .iter()
            .position(|(ready_at, _)| *ready_at <= deadline)
        {
            let (ready_at, bytes) = self.pending.remove(index);
            self.now.set(self.now.get().max(ready_at));
            for byte in bytes {
                if rx.push(byte).is_err() {
                    break;
                }
            }
            if contains_marker(rx, token) {
                return rx.len();
            }
        }

        self.now.set(deadline);
        0
    }
}
