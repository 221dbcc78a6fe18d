//! Measurement records and their `<pid-hex>=<value>` text form.

use core::fmt::{self, Write};

use heapless::String;

/// Longest serialized record accepted by [`Record::to_text`].
pub const MAX_RECORD_LEN: usize = 32;

/// Bounded text buffer holding one serialized record.
pub type RecordText = String<MAX_RECORD_LEN>;

/// Standard OBD-II engine RPM parameter.
pub const PID_RPM: u16 = 0x0C;
/// Standard OBD-II vehicle speed parameter.
pub const PID_SPEED: u16 = 0x0D;
/// GPS latitude in millionths of a degree.
pub const PID_GPS_LATITUDE: u16 = 0x0A;
pub const PID_GPS_LONGITUDE: u16 = 0x0B;
/// Averaged accelerometer axes.
pub const PID_ACC: u16 = 0x20;

/// Value attached to a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reading {
    /// Identifier only (`C=`).
    Empty,
    Int(i32),
    UInt(u32),
    /// Three axis sample rendered as `x/y/z`.
    Triple([i32; 3]),
    /// Fixed-point coordinate in millionths of a degree.
    Coordinate(i32),
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Empty => Ok(()),
            Reading::Int(value) => write!(f, "{value}"),
            Reading::UInt(value) => write!(f, "{value}"),
            Reading::Triple([x, y, z]) => write!(f, "{x}/{y}/{z}"),
            Reading::Coordinate(micro) => {
                let sign = if *micro < 0 { "-" } else { "" };
                let magnitude = micro.unsigned_abs();
                write!(
                    f,
                    "{sign}{}.{:06}",
                    magnitude / 1_000_000,
                    magnitude % 1_000_000
                )
            }
        }
    }
}

/// A single measurement with its event time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub pid: u16,
    pub reading: Reading,
    pub time_ms: u32,
}

impl Record {
    #[must_use]
    pub const fn new(pid: u16, reading: Reading, time_ms: u32) -> Self {
        Self {
            pid,
            reading,
            time_ms,
        }
    }

    /// Serializes the record, failing when the text exceeds [`MAX_RECORD_LEN`].
    pub fn to_text(&self) -> Result<RecordText, fmt::Error> {
        let mut text = RecordText::new();
        write!(text, "{self}")?;
        Ok(text)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}={}", self.pid, self.reading)
    }
}
