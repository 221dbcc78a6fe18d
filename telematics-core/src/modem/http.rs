//! HTTP/1.1 request framing for drained payloads.

use core::fmt::{self, Write};

use heapless::String;

use crate::config::{HttpMethod, MAX_HOST_LEN, MAX_PATH_LEN};

/// Digits of the largest `Content-length` value.
const MAX_LENGTH_DIGITS: usize = 20;

/// Header text that does not come from the configured path and host, sized
/// for the longest method and connection values.
const FRAMING_LEN: usize = "POST ".len()
    + " HTTP/1.1\r\n".len()
    + "User-Agent: ONE\r\n".len()
    + "Host: \r\n".len()
    + "Connection: keep-alive\r\n".len()
    + "Content-length: \r\n".len()
    + MAX_LENGTH_DIGITS
    + "\r\n".len();

/// Capacity of a rendered request header. Any validated host and path fit.
pub const MAX_HEADER_LEN: usize = MAX_PATH_LEN + MAX_HOST_LEN + FRAMING_LEN;

pub type RequestHeader = String<MAX_HEADER_LEN>;

/// Renders the request line and headers, including the blank line.
///
/// `Content-length` is only emitted for methods that carry a body.
pub fn request_header(
    method: HttpMethod,
    path: &str,
    host: &str,
    keep_alive: bool,
    body_len: usize,
) -> Result<RequestHeader, fmt::Error> {
    let mut header = RequestHeader::new();
    let connection = if keep_alive { "keep-alive" } else { "close" };

    write!(
        header,
        "{} {path} HTTP/1.1\r\nUser-Agent: ONE\r\nHost: {host}\r\nConnection: {connection}\r\n",
        method.as_str()
    )?;
    if method.has_body() {
        write!(header, "Content-length: {body_len}\r\n")?;
    }
    header.push_str("\r\n").map_err(|_| fmt::Error)?;

    Ok(header)
}
