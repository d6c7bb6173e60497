//! Protocol-level message model for socktap: framing parsers, the
//! request/response pairing matcher, and protocol inference.
//!
//! The agent hands each connection's buffered bytes to a [`Parser`], which
//! frames zero or more complete message heads and reports how many bytes it
//! consumed. Framed messages flow into the per-connection [`Matcher`], which
//! pairs requests with responses in FIFO order. HTTP/1.x is the only
//! protocol today; everything upstream of [`http1`] is protocol-agnostic,
//! so adding a protocol means a new module plus a [`Parser`] variant.
//!
//! The crate has no dependency on eBPF, sockets, or async. It is a pure
//! byte-in, message-out library that works anywhere you have a stream to
//! reassemble.

pub mod http1;
pub mod matcher;

pub use matcher::{MatchedPair, Matcher};

use serde::Serialize;

/// Protocols the agent can recognize.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum ProtocolType {
    Http1,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Http1 => "http/1",
        }
    }
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request head, tagged by protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "proto", rename_all = "snake_case")]
pub enum Request {
    Http1(http1::Http1Request),
}

impl Request {
    pub fn proto_type(&self) -> ProtocolType {
        match self {
            Request::Http1(_) => ProtocolType::Http1,
        }
    }

    /// One-line human summary, e.g. `GET /healthz`.
    pub fn describe(&self) -> String {
        match self {
            Request::Http1(r) => format!("{} {}", r.method, r.target),
        }
    }
}

/// A parsed response head, tagged by protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "proto", rename_all = "snake_case")]
pub enum Response {
    Http1(http1::Http1Response),
}

impl Response {
    pub fn proto_type(&self) -> ProtocolType {
        match self {
            Response::Http1(_) => ProtocolType::Http1,
        }
    }

    /// One-line human summary, e.g. `200 OK`.
    pub fn describe(&self) -> String {
        match self {
            Response::Http1(r) => {
                if r.reason.is_empty() {
                    r.code.to_string()
                } else {
                    format!("{} {}", r.code, r.reason)
                }
            }
        }
    }
}

/// Recoverable framing failure. The connection resyncs past the offending
/// bytes and keeps going; nothing here aborts the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// No head terminator within the bounded head window.
    HeadTooLarge { limit: usize },
    /// The request line carried a method outside the supported set.
    InvalidMethod(String),
    /// The head was structurally broken (bad line or header grammar).
    Malformed(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::HeadTooLarge { limit } => {
                write!(f, "message head exceeds {limit} bytes")
            }
            ParseError::InvalidMethod(m) => write!(f, "invalid http method: {m}"),
            ParseError::Malformed(what) => write!(f, "malformed head: {what}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of one framing pass over a buffer: the complete messages framed
/// from its head, the bytes consumed by them, and the error that stopped the
/// pass, if any. An outcome with no messages and no error means the buffer
/// holds an incomplete head: keep the bytes and try again after more data.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome<T> {
    pub messages: Vec<T>,
    pub consumed: usize,
    pub error: Option<ParseError>,
}

/// What a parser thinks of an unattributed byte stream during inference.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InferVerdict {
    /// At least one complete message framed; the protocol is settled.
    Match,
    /// Could still become this protocol once more bytes arrive.
    Pending,
    /// Cannot be this protocol.
    NoMatch,
}

/// Capability set of one protocol parser. A closed enum rather than a trait
/// object: dispatch stays static and the set of protocols is known at
/// compile time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Parser {
    Http1,
}

impl Parser {
    pub fn proto_type(&self) -> ProtocolType {
        match self {
            Parser::Http1 => ProtocolType::Http1,
        }
    }

    /// Frame request heads from the front of `buf`.
    pub fn parse_requests(&self, buf: &[u8]) -> ParseOutcome<Request> {
        match self {
            Parser::Http1 => {
                let out = http1::parse_requests(buf);
                ParseOutcome {
                    messages: out.messages.into_iter().map(Request::Http1).collect(),
                    consumed: out.consumed,
                    error: out.error,
                }
            }
        }
    }

    /// Frame response heads from the front of `buf`.
    pub fn parse_responses(&self, buf: &[u8]) -> ParseOutcome<Response> {
        match self {
            Parser::Http1 => {
                let out = http1::parse_responses(buf);
                ParseOutcome {
                    messages: out.messages.into_iter().map(Response::Http1).collect(),
                    consumed: out.consumed,
                    error: out.error,
                }
            }
        }
    }

    /// Whether this parser volunteers for request-side protocol inference.
    pub fn infer_requests(&self) -> bool {
        match self {
            Parser::Http1 => true,
        }
    }

    /// Whether this parser volunteers for response-side protocol inference.
    pub fn infer_responses(&self) -> bool {
        match self {
            Parser::Http1 => true,
        }
    }

    /// Judge an unattributed request-direction stream.
    ///
    /// A stream that opens like this protocol but fails framing (oversized
    /// or broken head) still claims the connection: the failure is then the
    /// parser's recoverable error to resync from, not an inference miss.
    pub fn infer_request_verdict(&self, buf: &[u8]) -> InferVerdict {
        let out = self.parse_requests(buf);
        let plausible = match self {
            Parser::Http1 => http1::could_be_request(buf),
        };
        if !out.messages.is_empty() {
            InferVerdict::Match
        } else if out.error.is_some() {
            if plausible {
                InferVerdict::Match
            } else {
                InferVerdict::NoMatch
            }
        } else if plausible {
            InferVerdict::Pending
        } else {
            InferVerdict::NoMatch
        }
    }

    /// Judge an unattributed response-direction stream.
    pub fn infer_response_verdict(&self, buf: &[u8]) -> InferVerdict {
        let out = self.parse_responses(buf);
        let plausible = match self {
            Parser::Http1 => http1::could_be_response(buf),
        };
        if !out.messages.is_empty() {
            InferVerdict::Match
        } else if out.error.is_some() {
            if plausible {
                InferVerdict::Match
            } else {
                InferVerdict::NoMatch
            }
        } else if plausible {
            InferVerdict::Pending
        } else {
            InferVerdict::NoMatch
        }
    }

    /// Offset of the next plausible request head in `buf`, for resync after
    /// a framing failure.
    pub fn find_request_start(&self, buf: &[u8]) -> Option<usize> {
        match self {
            Parser::Http1 => http1::find_request_start(buf),
        }
    }

    /// Offset of the next plausible response head in `buf`.
    pub fn find_response_start(&self, buf: &[u8]) -> Option<usize> {
        match self {
            Parser::Http1 => http1::find_response_start(buf),
        }
    }
}

/// Parsers in inference priority order. HTTP/1 goes first; a future HTTP/2
/// parser slots in after it and claims the connections HTTP/1 rejects
/// (notably the `PRI * HTTP/2.0` preface).
pub fn inference_order() -> &'static [Parser] {
    &[Parser::Http1]
}
