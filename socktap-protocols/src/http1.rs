//! HTTP/1.x head framing.
//!
//! Frames request and response heads (start line + headers) out of a
//! reassembled byte stream. Bodies are never captured: the agent records
//! what was asked and what was answered, not the payloads. Heads are
//! bounded at [`MAX_HEAD_BYTES`]; anything larger is a recoverable framing
//! error and the connection resyncs to the next recognizable head.

use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, space1},
    combinator::opt,
    sequence::tuple,
    IResult,
};
use serde::Serialize;

use crate::{ParseError, ParseOutcome};

/// Upper bound on a single message head. A head whose terminator does not
/// appear within this window fails with [`ParseError::HeadTooLarge`].
pub const MAX_HEAD_BYTES: usize = 4096;

/// The closed set of methods this parser accepts. `PRI` is deliberately
/// absent so the HTTP/2 connection preface fails inference here and stays
/// claimable by an HTTP/2 parser.
const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "CONNECT", "TRACE",
];

/// A single header line, order-preserving.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Parsed HTTP/1.x request head.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Http1Request {
    /// HTTP method (e.g. `GET`, `POST`).
    pub method: String,
    /// Request target (e.g. `/v1/items?page=2`).
    pub target: String,
    /// HTTP version (e.g. `HTTP/1.1`).
    pub version: String,
    /// Headers in wire order.
    pub headers: Vec<Header>,
}

/// Parsed HTTP/1.x response head.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Http1Response {
    /// HTTP version (e.g. `HTTP/1.1`).
    pub version: String,
    /// Status code (e.g. `200`, `404`).
    pub code: u16,
    /// Reason phrase; may be empty.
    pub reason: String,
    /// Headers in wire order.
    pub headers: Vec<Header>,
}

/// Frame as many complete request heads as the buffer holds.
pub fn parse_requests(buf: &[u8]) -> ParseOutcome<Http1Request> {
    parse_messages(buf, parse_request_head)
}

/// Frame as many complete response heads as the buffer holds.
pub fn parse_responses(buf: &[u8]) -> ParseOutcome<Http1Response> {
    parse_messages(buf, parse_response_head)
}

fn parse_messages<T>(
    buf: &[u8],
    parse_head: fn(&[u8]) -> Result<T, ParseError>,
) -> ParseOutcome<T> {
    let mut messages = Vec::new();
    let mut consumed = 0;

    loop {
        let rest = &buf[consumed..];
        if rest.is_empty() {
            break;
        }
        let head_len = match find_head_end(rest) {
            Some(n) => n,
            None if rest.len() >= MAX_HEAD_BYTES => {
                return ParseOutcome {
                    messages,
                    consumed,
                    error: Some(ParseError::HeadTooLarge {
                        limit: MAX_HEAD_BYTES,
                    }),
                };
            }
            None => break,
        };
        match parse_head(&rest[..head_len]) {
            Ok(msg) => {
                messages.push(msg);
                consumed += head_len;
            }
            Err(e) => {
                return ParseOutcome {
                    messages,
                    consumed,
                    error: Some(e),
                };
            }
        }
    }

    ParseOutcome {
        messages,
        consumed,
        error: None,
    }
}

/// Length of the head at the front of `buf` (including the blank-line
/// terminator), or `None` if the terminator is not within the head window.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let window = &buf[..buf.len().min(MAX_HEAD_BYTES)];
    window
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

fn parse_request_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, method) = take_while1(|c: u8| c.is_ascii_uppercase())(input)?;
    let (input, _) = space1(input)?;
    let (input, target) = take_while1(|c: u8| c != b' ' && c != b'\r' && c != b'\n')(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = take_while1(|c: u8| c != b'\r' && c != b'\n')(input)?;
    let (input, _) = tag(b"\r\n")(input)?;
    Ok((input, (method, target, version)))
}

fn parse_status_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, version) = take_while1(|c: u8| c != b' ' && c != b'\r')(input)?;
    let (input, _) = space1(input)?;
    let (input, code) = take_while1(|c: u8| c.is_ascii_digit())(input)?;
    let (input, _) = opt(space1)(input)?;
    let (input, reason) = take_while(|c: u8| c != b'\r' && c != b'\n')(input)?;
    let (input, _) = tag(b"\r\n")(input)?;
    Ok((input, (version, code, reason)))
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (input, name) = take_while1(is_token_char)(input)?;
    let (input, _) = tuple((char(':'), opt(space1)))(input)?;
    let (input, value) = take_while(|c: u8| c != b'\r' && c != b'\n')(input)?;
    let (input, _) = tag(b"\r\n")(input)?;
    Ok((input, (name, value)))
}

fn parse_headers(mut input: &[u8]) -> Result<Vec<Header>, ParseError> {
    let mut headers = Vec::new();
    loop {
        if input.starts_with(b"\r\n") {
            return Ok(headers);
        }
        if input.is_empty() {
            return Err(ParseError::Malformed("head ends before blank line"));
        }
        match parse_header(input) {
            Ok((rest, (name, value))) => {
                headers.push(Header {
                    name: String::from_utf8_lossy(name).to_string(),
                    value: String::from_utf8_lossy(value).to_string(),
                });
                input = rest;
            }
            Err(_) => return Err(ParseError::Malformed("header line")),
        }
    }
}

fn parse_request_head(head: &[u8]) -> Result<Http1Request, ParseError> {
    let (rest, (method, target, version)) =
        parse_request_line(head).map_err(|_| ParseError::Malformed("request line"))?;
    let method = String::from_utf8_lossy(method).to_string();
    if !METHODS.contains(&method.as_str()) {
        return Err(ParseError::InvalidMethod(method));
    }
    if !version.starts_with(b"HTTP/") {
        return Err(ParseError::Malformed("request version"));
    }
    let headers = parse_headers(rest)?;
    Ok(Http1Request {
        method,
        target: String::from_utf8_lossy(target).to_string(),
        version: String::from_utf8_lossy(version).to_string(),
        headers,
    })
}

fn parse_response_head(head: &[u8]) -> Result<Http1Response, ParseError> {
    let (rest, (version, code, reason)) =
        parse_status_line(head).map_err(|_| ParseError::Malformed("status line"))?;
    if !version.starts_with(b"HTTP/1.") {
        return Err(ParseError::Malformed("status version"));
    }
    if code.len() != 3 {
        return Err(ParseError::Malformed("status code"));
    }
    let code: u16 = std::str::from_utf8(code)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::Malformed("status code"))?;
    let headers = parse_headers(rest)?;
    Ok(Http1Response {
        version: String::from_utf8_lossy(version).to_string(),
        code,
        reason: String::from_utf8_lossy(reason).to_string(),
        headers,
    })
}

/// Whether `buf` is, or could still grow into, the start of a request head.
/// Used during protocol inference where "not enough bytes yet" must be kept
/// distinct from "definitely not HTTP".
pub fn could_be_request(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    METHODS.iter().any(|m| {
        let mb = m.as_bytes();
        if buf.len() <= mb.len() {
            mb.starts_with(buf)
        } else {
            buf.starts_with(mb) && buf[mb.len()] == b' '
        }
    })
}

/// Whether `buf` is, or could still grow into, the start of a response head.
pub fn could_be_response(buf: &[u8]) -> bool {
    const PREFIX: &[u8] = b"HTTP/1.";
    if buf.len() < PREFIX.len() {
        PREFIX.starts_with(buf)
    } else {
        buf.starts_with(PREFIX)
    }
}

/// Offset of the next byte sequence that looks like a request head start:
/// a known method token followed by a space.
pub fn find_request_start(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&i| {
        METHODS.iter().any(|m| {
            let mb = m.as_bytes();
            buf.len() > i + mb.len() && buf[i..].starts_with(mb) && buf[i + mb.len()] == b' '
        })
    })
}

/// Offset of the next byte sequence that looks like a response head start.
pub fn find_response_start(buf: &[u8]) -> Option<usize> {
    const PREFIX: &[u8] = b"HTTP/1.";
    buf.windows(PREFIX.len()).position(|w| w == PREFIX)
}
