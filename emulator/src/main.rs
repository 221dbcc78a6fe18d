mod modem;
mod producer;
mod session;
mod store;

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use telematics_core::cache::EvictionPolicy;

use session::{Options, Session, Summary};

const USAGE: &str = "Usage: telematics-emulator [--duration <s>] [--policy <drop|shift>] [--raw] \
[--latency <ms>] [--fail-every <n>] [--reject-join <n>] [--seed <n>] \
[--log <path>] [--transcript <path>]";

fn main() -> io::Result<()> {
    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let mut session = Session::new(&options)?;
    let summary = session.run(options.duration_s.saturating_mul(1_000))?;

    let stdout = io::stdout();
    let mut writer = stdout.lock();
    print_summary(&mut writer, &summary)?;
    writer.flush()
}

fn print_summary(writer: &mut impl Write, summary: &Summary) -> io::Result<()> {
    let stats = &summary.logger;
    writeln!(writer)?;
    writeln!(writer, "Simulated {} ms", summary.elapsed_ms)?;
    writeln!(
        writer,
        "  logged     {} records, {} rejected, {} truncations ({} bytes evicted)",
        stats.cached, stats.dropped, stats.truncations, stats.evicted_bytes
    )?;
    writeln!(
        writer,
        "  stored     {} records, {} bytes, {} failures",
        stats.stored, stats.store_bytes, stats.store_failures
    )?;
    writeln!(
        writer,
        "  delivered  {} payloads, {} bytes, {} records decoded, {} undecodable",
        summary.payloads, summary.delivered_bytes, summary.decoded_records, summary.undecodable
    )?;
    writeln!(
        writer,
        "  link       {} faults, {} acks lost, {} bytes still cached",
        summary.faults, summary.dropped_acks, summary.cached_bytes
    )?;
    writeln!(writer, "  vehicle    {} m travelled", summary.distance_m)
}

fn parse_options(args: impl IntoIterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };

        if flag == "--raw" {
            options.raw = true;
            continue;
        }

        let value = match inline.or_else(|| args.next()) {
            Some(value) => value,
            None => return Err(format!("Expected value after {flag}")),
        };

        match flag.as_str() {
            "--duration" => options.duration_s = number(&flag, &value)?,
            "--latency" => options.modem.latency_ms = number(&flag, &value)?,
            "--fail-every" => options.modem.fail_every = Some(number(&flag, &value)?),
            "--reject-join" => options.modem.reject_joins = number(&flag, &value)?,
            "--seed" => options.seed = number(&flag, &value)?,
            "--log" => options.log = Some(PathBuf::from(value)),
            "--transcript" => options.transcript = Some(PathBuf::from(value)),
            "--policy" => {
                options.policy = match value.to_ascii_lowercase().as_str() {
                    "drop" => EvictionPolicy::Drop,
                    "shift" => EvictionPolicy::Shift,
                    other => return Err(format!("Unknown policy '{other}'")),
                }
            }
            other => return Err(format!("Unknown option '{other}'")),
        }
    }

    Ok(options)
}

fn number(flag: &str, value: &str) -> Result<u32, String> {
    value
        .parse()
        .map_err(|_| format!("Expected a number after {flag}, got '{value}'"))
}
