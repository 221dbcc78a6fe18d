use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crossterm::style::Stylize;
use telematics_core::cache::stream::decode;
use telematics_core::cache::{EvictionPolicy, TelemetryCache};
use telematics_core::config::{
    CACHE_SIZE, ConfigError, HttpMethod, HttpTarget, LinkConfig, MIN_LOOP_TIME_MS, SERVER_PORT,
    UplinkConfig,
};
use telematics_core::logger::{DataLogger, LoggerStats, NullStore};
use telematics_core::modem::Clock;
use telematics_core::uplink::{LinkFault, Recovery, Uplink, UplinkEvent};

use crate::modem::{ModemProfile, SimulatedModem, VirtualClock};
use crate::producer::VehicleSimulator;
use crate::store::{FileStore, HostStore};

/// Upper bound on uplink steps taken within one producer loop.
const POLLS_PER_LOOP: usize = 4;

/// Everything the command line can change.
#[derive(Clone, Debug)]
pub struct Options {
    pub duration_s: u32,
    pub policy: EvictionPolicy,
    pub raw: bool,
    pub modem: ModemProfile,
    pub log: Option<PathBuf>,
    pub transcript: Option<PathBuf>,
    pub seed: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            duration_s: 60,
            policy: EvictionPolicy::Drop,
            raw: false,
            modem: ModemProfile::default(),
            log: None,
            transcript: None,
            seed: 0x5EED,
        }
    }
}

/// Totals printed once the run ends.
#[derive(Debug, Default)]
pub struct Summary {
    pub elapsed_ms: u32,
    pub logger: LoggerStats,
    pub payloads: usize,
    pub delivered_bytes: usize,
    pub decoded_records: usize,
    pub undecodable: usize,
    pub dropped_acks: u32,
    pub faults: u32,
    pub distance_m: u32,
    pub cached_bytes: usize,
}

pub struct Session {
    clock: VirtualClock,
    logger: DataLogger<HostStore, CACHE_SIZE>,
    uplink: Uplink<SimulatedModem, VirtualClock>,
    vehicle: VehicleSimulator,
    transcript: Transcript,
    raw: bool,
    faults: u32,
}

impl Session {
    pub fn new(options: &Options) -> io::Result<Self> {
        let clock = VirtualClock::default();
        let config = uplink_config(options.raw).map_err(invalid_config)?;
        let modem = SimulatedModem::new(clock.clone(), options.modem);

        let store = match &options.log {
            Some(path) => HostStore::File(FileStore::create(path)?),
            None => HostStore::Disabled(NullStore),
        };
        let cache = TelemetryCache::new(options.policy);

        Ok(Self {
            uplink: Uplink::new(modem, clock.clone(), config),
            logger: DataLogger::new(cache, store),
            vehicle: VehicleSimulator::new(options.seed),
            transcript: Transcript::new(options.transcript.as_deref())?,
            clock,
            raw: options.raw,
            faults: 0,
        })
    }

    /// Runs producer and uplink in virtual time until `duration_ms` passes.
    pub fn run(&mut self, duration_ms: u32) -> io::Result<Summary> {
        let mut next_loop = 0;

        while self.clock.now_ms() < duration_ms {
            let now = self.clock.now_ms();
            for record in self.vehicle.sample(now, MIN_LOOP_TIME_MS) {
                let result = self.logger.log(&record);
                if let Some(fault) = LinkFault::from_log(&result) {
                    self.faults += 1;
                    self.transcript
                        .emit(now, Tone::Bad, &format!("fault: {fault}"))?;
                }
            }

            for _ in 0..POLLS_PER_LOOP {
                let event = self.uplink.poll(self.logger.cache_mut());
                let at = self.clock.now_ms();
                self.report(at, &event)?;
                if matches!(event, UplinkEvent::Idle | UplinkEvent::Waiting) {
                    break;
                }
            }

            next_loop += MIN_LOOP_TIME_MS;
            let now = self.clock.now_ms();
            if now < next_loop {
                self.clock.set(next_loop);
            } else {
                next_loop = now;
            }
        }

        self.logger.flush();
        Ok(self.summary())
    }

    fn report(&mut self, at: u32, event: &UplinkEvent) -> io::Result<()> {
        let (tone, line) = match event {
            UplinkEvent::Idle | UplinkEvent::Waiting => return Ok(()),
            UplinkEvent::ModemReady => (Tone::Good, "modem ready".to_string()),
            UplinkEvent::Joined(address) => (Tone::Good, format!("joined access point as {address}")),
            UplinkEvent::Connecting => (Tone::Pending, "opening session".to_string()),
            UplinkEvent::Connected => (Tone::Good, "session linked".to_string()),
            UplinkEvent::Draining { bytes } => (Tone::Pending, format!("draining {bytes} bytes")),
            UplinkEvent::Delivered { bytes } => (Tone::Good, format!("delivered {bytes} bytes")),
            UplinkEvent::ResponseReceived => (Tone::Plain, "server responded".to_string()),
            UplinkEvent::Fault { fault, recovery } => {
                self.faults += 1;
                let action = match recovery {
                    Recovery::Retry => "retrying".to_string(),
                    Recovery::Reconnect => "re-joining access point".to_string(),
                    Recovery::Reset => "resetting modem".to_string(),
                    Recovery::Backoff { until_ms } => format!("backing off until {until_ms} ms"),
                };
                let errors = self.uplink.link().errors();
                (
                    Tone::Bad,
                    format!("fault: {fault} (errors={errors}), {action}"),
                )
            }
        };

        self.transcript.emit(at, tone, &line)
    }

    fn summary(&self) -> Summary {
        let modem = self.uplink.link().channel().transport();
        let mut summary = Summary {
            elapsed_ms: self.clock.now_ms(),
            logger: self.logger.stats(),
            payloads: modem.delivered().len(),
            dropped_acks: modem.dropped_acks(),
            faults: self.faults,
            distance_m: self.vehicle.distance_m(),
            cached_bytes: self.logger.cache().len(),
            ..Summary::default()
        };

        for payload in modem.delivered() {
            let body = if self.raw {
                payload.as_slice()
            } else {
                http_body(payload)
            };
            summary.delivered_bytes += body.len();

            let text = String::from_utf8_lossy(body);
            for record in decode(&text) {
                match record {
                    Ok(_) => summary.decoded_records += 1,
                    Err(_) => {
                        summary.undecodable += 1;
                        break;
                    }
                }
            }
        }

        summary
    }
}

fn uplink_config(raw: bool) -> Result<UplinkConfig, ConfigError> {
    let link = LinkConfig::new("FREEMATICS", "PASSWORD", "hub.freematics.com", SERVER_PORT)?;
    let config = UplinkConfig::new(link);
    if raw {
        Ok(config)
    } else {
        Ok(config.with_http(HttpTarget::new(HttpMethod::Post, "/push?id=EMU1")?))
    }
}

fn invalid_config(error: ConfigError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, error.to_string())
}

fn http_body(payload: &[u8]) -> &[u8] {
    payload
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map_or(payload, |end| &payload[end + 4..])
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Tone {
    Good,
    Pending,
    Bad,
    Plain,
}

/// Colored console output mirrored into an optional plain-text file.
struct Transcript {
    file: Option<BufWriter<File>>,
}

impl Transcript {
    fn new(path: Option<&Path>) -> io::Result<Self> {
        let file = match path {
            Some(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)?;
                let mut writer = BufWriter::new(file);
                writeln!(writer, "# Telematics emulator transcript")?;
                writeln!(writer, "# Timestamps are virtual milliseconds since start")?;
                writeln!(writer)?;
                Some(writer)
            }
            None => None,
        };

        Ok(Self { file })
    }

    fn emit(&mut self, at_ms: u32, tone: Tone, line: &str) -> io::Result<()> {
        let stamp = format!("[+{at_ms:>7} ms]");
        let styled = match tone {
            Tone::Good => line.green(),
            Tone::Pending => line.yellow(),
            Tone::Bad => line.red(),
            Tone::Plain => line.stylize(),
        };

        let mut out = io::stdout().lock();
        writeln!(out, "{} {}", stamp.as_str().dark_grey(), styled)?;

        if let Some(file) = &mut self.file {
            writeln!(file, "{stamp} {line}")?;
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(options: Options) -> Summary {
        let mut session = Session::new(&options).expect("session should start");
        session
            .run(options.duration_s * 1_000)
            .expect("run should finish")
    }

    #[test]
    fn healthy_link_delivers_decodable_records() {
        let summary = quiet(Options {
            duration_s: 20,
            ..Options::default()
        });

        assert!(summary.payloads > 0);
        assert_eq!(summary.undecodable, 0);
        assert!(summary.decoded_records > 0);
        assert_eq!(summary.faults, 0);
    }

    #[test]
    fn raw_mode_streams_cache_without_headers() {
        let summary = quiet(Options {
            duration_s: 10,
            raw: true,
            ..Options::default()
        });

        assert!(summary.payloads > 0);
        assert_eq!(summary.undecodable, 0);
    }

    #[test]
    fn dropped_acks_are_recovered() {
        let summary = quiet(Options {
            duration_s: 60,
            modem: ModemProfile {
                fail_every: Some(3),
                ..ModemProfile::default()
            },
            ..Options::default()
        });

        assert!(summary.dropped_acks > 0);
        assert!(summary.faults > 0);
        assert!(summary.decoded_records > 0);
    }

    #[test]
    fn body_is_split_from_http_header() {
        assert_eq!(http_body(b"POST / HTTP/1.1\r\nHost: h\r\n\r\n#1,C=1 "), b"#1,C=1 ");
        assert_eq!(http_body(b"#1,C=1 "), b"#1,C=1 ");
    }
}
