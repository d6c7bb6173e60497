//! Request/response pairing.
//!
//! One matcher per connection. HTTP/1.x with keep-alive answers requests in
//! the order they were sent on a connection, so pairing is two FIFO queues:
//! a request meeting a queued response (or vice versa) pops the head and
//! emits a pair. There is no content-based keying; connection identity is
//! implicit because the matcher itself is per-connection.

use std::collections::VecDeque;

use crate::{Request, Response};

/// Default cap on each pending queue. Overflow discards the oldest entry.
pub const MAX_PENDING: usize = 64;

/// A matched request/response plus the event timestamps that bracketed it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub request: Request,
    pub response: Response,
    pub started_at_ns: u64,
    pub completed_at_ns: u64,
}

/// FIFO pairer for one connection.
#[derive(Debug)]
pub struct Matcher {
    req_queue: VecDeque<(Request, u64)>,
    resp_queue: VecDeque<(Response, u64)>,
    cap: usize,
    dropped: u64,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Matcher {
            req_queue: VecDeque::new(),
            resp_queue: VecDeque::new(),
            cap: cap.max(1),
            dropped: 0,
        }
    }

    /// Offer a request observed at `ts_ns`. Emits a pair if a response is
    /// already waiting, otherwise queues the request.
    pub fn match_request(&mut self, req: Request, ts_ns: u64) -> Option<MatchedPair> {
        match self.resp_queue.pop_front() {
            Some((resp, resp_ts)) => Some(MatchedPair {
                request: req,
                response: resp,
                started_at_ns: ts_ns,
                completed_at_ns: resp_ts,
            }),
            None => {
                if self.req_queue.len() >= self.cap {
                    self.req_queue.pop_front();
                    self.dropped += 1;
                }
                self.req_queue.push_back((req, ts_ns));
                None
            }
        }
    }

    /// Offer a response observed at `ts_ns`. Emits a pair if a request is
    /// already waiting, otherwise queues the response.
    pub fn match_response(&mut self, resp: Response, ts_ns: u64) -> Option<MatchedPair> {
        match self.req_queue.pop_front() {
            Some((req, req_ts)) => Some(MatchedPair {
                request: req,
                response: resp,
                started_at_ns: req_ts,
                completed_at_ns: ts_ns,
            }),
            None => {
                if self.resp_queue.len() >= self.cap {
                    self.resp_queue.pop_front();
                    self.dropped += 1;
                }
                self.resp_queue.push_back((resp, ts_ns));
                None
            }
        }
    }

    /// Entries discarded to queue caps so far.
    pub fn dropped_pending(&self) -> u64 {
        self.dropped
    }

    pub fn pending_requests(&self) -> usize {
        self.req_queue.len()
    }

    pub fn pending_responses(&self) -> usize {
        self.resp_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Parser;

    fn req(target: &str) -> Request {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: x\r\n\r\n");
        Parser::Http1
            .parse_requests(raw.as_bytes())
            .messages
            .remove(0)
    }

    fn resp(code: u16) -> Response {
        let raw = format!("HTTP/1.1 {code} X\r\n\r\n");
        Parser::Http1
            .parse_responses(raw.as_bytes())
            .messages
            .remove(0)
    }

    fn target_of(pair: &MatchedPair) -> String {
        match &pair.request {
            Request::Http1(r) => r.target.clone(),
        }
    }

    fn code_of(pair: &MatchedPair) -> u16 {
        match &pair.response {
            Response::Http1(r) => r.code,
        }
    }

    #[test]
    fn request_then_response_pairs() {
        let mut m = Matcher::new();
        assert!(m.match_request(req("/a"), 10).is_none());
        let pair = m.match_response(resp(200), 20).unwrap();
        assert_eq!(target_of(&pair), "/a");
        assert_eq!(code_of(&pair), 200);
        assert_eq!(pair.started_at_ns, 10);
        assert_eq!(pair.completed_at_ns, 20);
    }

    #[test]
    fn response_before_request_pairs() {
        let mut m = Matcher::new();
        assert!(m.match_response(resp(404), 5).is_none());
        let pair = m.match_request(req("/late"), 9).unwrap();
        assert_eq!(code_of(&pair), 404);
        assert_eq!(pair.started_at_ns, 9);
        assert_eq!(pair.completed_at_ns, 5);
    }

    #[test]
    fn pipelined_pairs_in_request_order() {
        let mut m = Matcher::new();
        assert!(m.match_request(req("/1"), 1).is_none());
        assert!(m.match_request(req("/2"), 2).is_none());
        let p1 = m.match_response(resp(200), 3).unwrap();
        let p2 = m.match_response(resp(201), 4).unwrap();
        assert_eq!(target_of(&p1), "/1");
        assert_eq!(code_of(&p1), 200);
        assert_eq!(target_of(&p2), "/2");
        assert_eq!(code_of(&p2), 201);
    }

    #[test]
    fn overflow_discards_oldest_and_counts() {
        let mut m = Matcher::with_capacity(2);
        assert!(m.match_request(req("/0"), 0).is_none());
        assert!(m.match_request(req("/1"), 1).is_none());
        assert!(m.match_request(req("/2"), 2).is_none());
        assert_eq!(m.dropped_pending(), 1);
        assert_eq!(m.pending_requests(), 2);
        // oldest (/0) is gone: the next response pairs with /1
        let pair = m.match_response(resp(200), 3).unwrap();
        assert_eq!(target_of(&pair), "/1");
    }

    #[test]
    fn queues_are_independent() {
        let mut m = Matcher::new();
        assert!(m.match_request(req("/a"), 1).is_none());
        assert_eq!(m.pending_requests(), 1);
        assert_eq!(m.pending_responses(), 0);
        let _ = m.match_response(resp(200), 2).unwrap();
        assert_eq!(m.pending_requests(), 0);
    }
}
