//! Decoder for the cache stream grammar.
//!
//! ```text
//! stream := entry*
//! entry  := token ',' record (';' record)* ' '
//! token  := '#' <decimal ms> | <decimal delta ms>
//! record := <hex pid> '=' <value bytes up to ' ' or ';'>
//! ```
//!
//! Relative tokens resolve against the running clock, which starts at the
//! first absolute token. Entries seen before any anchor (for example the
//! survivors of a shift eviction) decode with `time_ms: None`.

use core::fmt;

use winnow::ascii::{dec_uint, hex_uint};
use winnow::combinator::{alt, preceded};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::take_till;

/// One record recovered from the stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DecodedRecord<'a> {
    pub time_ms: Option<u32>,
    pub pid: u16,
    pub value: &'a str,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecodeErrorKind {
    MalformedToken,
    MissingFieldTerminator,
    MalformedRecord,
    UnterminatedEntry,
}

/// Decoding failure with the byte offset where it was detected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DecodeError {
    pub offset: usize,
    pub kind: DecodeErrorKind,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            DecodeErrorKind::MalformedToken => "malformed timestamp token",
            DecodeErrorKind::MissingFieldTerminator => "missing ',' after token",
            DecodeErrorKind::MalformedRecord => "malformed record",
            DecodeErrorKind::UnterminatedEntry => "entry not terminated",
        };
        write!(f, "{what} at byte {}", self.offset)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Stamp {
    Absolute(u32),
    Relative(u32),
}

/// Iterator over the records of a cache stream.
pub struct StreamDecoder<'a> {
    source: &'a str,
    input: &'a str,
    clock: Option<u32>,
    in_entry: bool,
    failed: bool,
}

/// Decodes a cache stream.
#[must_use]
pub fn decode(stream: &str) -> StreamDecoder<'_> {
    StreamDecoder {
        source: stream,
        input: stream,
        clock: None,
        in_entry: false,
        failed: false,
    }
}

impl<'a> StreamDecoder<'a> {
    fn offset(&self) -> usize {
        self.source.len() - self.input.len()
    }

    fn fail(&mut self, kind: DecodeErrorKind) -> Option<Result<DecodedRecord<'a>, DecodeError>> {
        self.failed = true;
        Some(Err(DecodeError {
            offset: self.offset(),
            kind,
        }))
    }

    fn next_record(&mut self) -> Result<DecodedRecord<'a>, DecodeErrorKind> {
        if !self.in_entry {
            let stamp = stamp
                .parse_next(&mut self.input)
                .map_err(|_| DecodeErrorKind::MalformedToken)?;
            ','.parse_next(&mut self.input)
                .map_err(|_: ErrMode<ContextError>| DecodeErrorKind::MissingFieldTerminator)?;

            self.clock = match (stamp, self.clock) {
                (Stamp::Absolute(time), _) => Some(time),
                (Stamp::Relative(delta), Some(time)) => Some(time.wrapping_add(delta)),
                (Stamp::Relative(_), None) => None,
            };
            self.in_entry = true;
        }

        let (pid, value) = record
            .parse_next(&mut self.input)
            .map_err(|_| DecodeErrorKind::MalformedRecord)?;

        match self.input.as_bytes().first() {
            Some(b' ') => self.in_entry = false,
            Some(b';') => {}
            _ => return Err(DecodeErrorKind::UnterminatedEntry),
        }
        self.input = &self.input[1..];

        Ok(DecodedRecord {
            time_ms: self.clock,
            pid,
            value,
        })
    }
}

impl<'a> Iterator for StreamDecoder<'a> {
    type Item = Result<DecodedRecord<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || (self.input.is_empty() && !self.in_entry) {
            return None;
        }

        match self.next_record() {
            Ok(record) => Some(Ok(record)),
            Err(kind) => self.fail(kind),
        }
    }
}

fn stamp(input: &mut &str) -> ModalResult<Stamp> {
    alt((
        preceded('#', dec_uint).map(Stamp::Absolute),
        dec_uint.map(Stamp::Relative),
    ))
    .parse_next(input)
}

fn record<'a>(input: &mut &'a str) -> ModalResult<(u16, &'a str)> {
    let pid = hex_uint.parse_next(input)?;
    '='.parse_next(input)?;
    let value = take_till(0.., [' ', ';']).parse_next(input)?;
    Ok((pid, value))
}
