//! Per-socket connection state.
//!
//! A connection reassembles the two byte streams of one `(pid, fd)` socket,
//! settles which protocol is speaking, frames message heads, and pairs them
//! through its matcher. All mutation happens on the factory task; nothing
//! here is shared or locked.
//!
//! The observed process is the accepting side, so ingress bytes carry
//! requests and egress bytes carry responses.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use socktap_protocols::{
    inference_order, InferVerdict, MatchedPair, Matcher, Parser, ProtocolType,
};
use socktap_types::{Direction, SockKey};

use crate::config::Limits;
use crate::counters::Counters;

/// Bytes retained when a resync scan finds no message start: enough to hold
/// a method token or status-line prefix split across events.
const RESYNC_TAIL_BYTES: usize = 8;

/// Connection lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    /// Created, no payload observed yet.
    Fresh,
    /// Accumulating bytes until a parser claims the stream.
    Inferring,
    /// Protocol settled; parser and matcher are live.
    Parsing,
    /// No parser recognized the stream; only open/close is tracked.
    Opaque,
    /// Close observed or idle timeout hit; reaped at the next harvest.
    Closing,
}

#[derive(Debug, Default)]
struct DirBuf {
    buf: Vec<u8>,
    resync: bool,
}

pub struct Connection {
    sock_key: SockKey,
    opened_at: Option<u64>,
    last_activity_at: u64,
    closed_at: Option<u64>,
    phase: Phase,
    proto: Option<ProtocolType>,
    parser: Option<Parser>,
    matcher: Matcher,
    ingress: DirBuf,
    egress: DirBuf,
    pending: VecDeque<MatchedPair>,
    limits: Limits,
    counters: Arc<Counters>,
}

impl Connection {
    pub fn new(
        sock_key: SockKey,
        opened_at: Option<u64>,
        limits: Limits,
        counters: Arc<Counters>,
    ) -> Self {
        Connection {
            sock_key,
            opened_at,
            last_activity_at: opened_at.unwrap_or(0),
            closed_at: None,
            phase: Phase::Fresh,
            proto: None,
            parser: None,
            matcher: Matcher::with_capacity(limits.max_pending),
            ingress: DirBuf::default(),
            egress: DirBuf::default(),
            pending: VecDeque::new(),
            limits,
            counters,
        }
    }

    pub fn sock_key(&self) -> SockKey {
        self.sock_key
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn proto(&self) -> Option<ProtocolType> {
        self.proto
    }

    pub fn opened_at(&self) -> Option<u64> {
        self.opened_at
    }

    pub fn closed_at(&self) -> Option<u64> {
        self.closed_at
    }

    pub fn last_activity_ns(&self) -> u64 {
        self.last_activity_at
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.phase, Phase::Closing)
    }

    /// A connection is ready for harvest when it has pairs to hand over or
    /// is waiting to be reaped.
    pub fn ready(&self) -> bool {
        !self.pending.is_empty() || self.is_closing()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.ingress.buf.len() + self.egress.buf.len()
    }

    /// An `open` observed for an already-live connection only backfills the
    /// open timestamp when the connection was created from a data event.
    pub fn handle_open(&mut self, ts_ns: u64) {
        if self.opened_at.is_none() {
            self.opened_at = Some(ts_ns);
        }
        self.touch(ts_ns);
    }

    pub fn handle_close(&mut self, ts_ns: u64) {
        self.closed_at = Some(ts_ns);
        self.phase = Phase::Closing;
        self.touch(ts_ns);
    }

    /// Idle-timeout path to `Closing`; no close timestamp exists.
    pub fn mark_closing(&mut self) {
        self.phase = Phase::Closing;
    }

    /// Kernel records were lost on a data channel. Whatever was buffered in
    /// that direction can no longer be trusted to be contiguous.
    pub fn mark_lossy(&mut self, direction: Direction) {
        if matches!(self.phase, Phase::Inferring | Phase::Parsing) {
            let db = self.dir_mut(direction);
            db.buf.clear();
            db.resync = true;
        }
    }

    pub fn handle_data(&mut self, direction: Direction, ts_ns: u64, truncated: bool, payload: &[u8]) {
        self.touch(ts_ns);
        match self.phase {
            Phase::Closing | Phase::Opaque => return,
            Phase::Fresh => self.phase = Phase::Inferring,
            Phase::Inferring | Phase::Parsing => {}
        }

        self.append(direction, payload);
        match self.phase {
            Phase::Inferring => self.try_infer(ts_ns),
            Phase::Parsing => self.drive_parser(direction, ts_ns),
            _ => {}
        }

        if truncated {
            self.discard_partial(direction);
        }
    }

    /// Hand over and clear the harvested-pair queue.
    pub fn take_pending(&mut self) -> Vec<MatchedPair> {
        self.pending.drain(..).collect()
    }

    fn touch(&mut self, ts_ns: u64) {
        self.last_activity_at = self.last_activity_at.max(ts_ns);
    }

    fn dir(&self, direction: Direction) -> &DirBuf {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    fn dir_mut(&mut self, direction: Direction) -> &mut DirBuf {
        match direction {
            Direction::Ingress => &mut self.ingress,
            Direction::Egress => &mut self.egress,
        }
    }

    fn append(&mut self, direction: Direction, payload: &[u8]) {
        let max = self.limits.max_conn_buffer;
        let overflowed = {
            let db = self.dir_mut(direction);
            db.buf.extend_from_slice(payload);
            if db.buf.len() > max {
                let excess = db.buf.len() - max;
                db.buf.drain(..excess);
                db.resync = true;
                true
            } else {
                false
            }
        };
        if overflowed {
            Counters::bump(&self.counters.buffer_evictions);
        }
    }

    fn try_infer(&mut self, ts_ns: u64) {
        let mut any_pending = false;
        for parser in inference_order() {
            if parser.infer_requests() && !self.ingress.buf.is_empty() {
                match parser.infer_request_verdict(&self.ingress.buf) {
                    InferVerdict::Match => return self.adopt(*parser, ts_ns),
                    InferVerdict::Pending => any_pending = true,
                    InferVerdict::NoMatch => {}
                }
            }
            if parser.infer_responses() && !self.egress.buf.is_empty() {
                match parser.infer_response_verdict(&self.egress.buf) {
                    InferVerdict::Match => return self.adopt(*parser, ts_ns),
                    InferVerdict::Pending => any_pending = true,
                    InferVerdict::NoMatch => {}
                }
            }
        }

        if !any_pending && self.buffered_bytes() >= self.limits.min_infer_bytes {
            debug!(
                "no parser claimed {:?} after {} bytes, tracking open/close only",
                self.sock_key,
                self.buffered_bytes(),
            );
            Counters::bump(&self.counters.inference_failures);
            self.phase = Phase::Opaque;
            self.ingress = DirBuf::default();
            self.egress = DirBuf::default();
        }
    }

    fn adopt(&mut self, parser: Parser, ts_ns: u64) {
        debug!("{:?} speaks {}", self.sock_key, parser.proto_type());
        self.proto = Some(parser.proto_type());
        self.parser = Some(parser);
        self.phase = Phase::Parsing;
        self.drive_parser(Direction::Ingress, ts_ns);
        self.drive_parser(Direction::Egress, ts_ns);
    }

    fn drive_parser(&mut self, direction: Direction, ts_ns: u64) {
        let Some(parser) = self.parser else { return };

        loop {
            if self.dir(direction).resync {
                let found = match direction {
                    Direction::Ingress => parser.find_request_start(&self.dir(direction).buf),
                    Direction::Egress => parser.find_response_start(&self.dir(direction).buf),
                };
                let db = self.dir_mut(direction);
                match found {
                    Some(i) => {
                        db.buf.drain(..i);
                        db.resync = false;
                    }
                    None => {
                        let keep = db.buf.len().min(RESYNC_TAIL_BYTES);
                        let cut = db.buf.len() - keep;
                        db.buf.drain(..cut);
                        return;
                    }
                }
            }

            let (consumed, error) = match direction {
                Direction::Ingress => {
                    let out = parser.parse_requests(&self.ingress.buf);
                    for req in out.messages {
                        if let Some(pair) = self.matcher.match_request(req, ts_ns) {
                            self.push_pending(pair);
                        }
                    }
                    (out.consumed, out.error)
                }
                Direction::Egress => {
                    let out = parser.parse_responses(&self.egress.buf);
                    for resp in out.messages {
                        if let Some(pair) = self.matcher.match_response(resp, ts_ns) {
                            self.push_pending(pair);
                        }
                    }
                    (out.consumed, out.error)
                }
            };

            let db = self.dir_mut(direction);
            db.buf.drain(..consumed);
            match error {
                Some(e) => {
                    Counters::bump(&self.counters.parse_errors);
                    debug!(
                        "parse error on {:?} {}: {e}",
                        self.sock_key,
                        direction.as_str(),
                    );
                    let db = self.dir_mut(direction);
                    if !db.buf.is_empty() {
                        db.buf.drain(..1);
                    }
                    db.resync = true;
                }
                None => return,
            }
        }
    }

    /// A truncated event cut bytes out of the stream, so a head left
    /// incomplete in this direction can never finish. Drop it and wait for
    /// the next message start.
    fn discard_partial(&mut self, direction: Direction) {
        if !matches!(self.phase, Phase::Inferring | Phase::Parsing) {
            return;
        }
        let dropped = {
            let db = self.dir_mut(direction);
            if db.buf.is_empty() {
                false
            } else {
                db.buf.clear();
                db.resync = true;
                true
            }
        };
        if dropped {
            Counters::bump(&self.counters.truncation_drops);
        }
    }

    fn push_pending(&mut self, pair: MatchedPair) {
        if self.pending.len() >= self.limits.max_pending {
            self.pending.pop_front();
            Counters::bump(&self.counters.pairs_dropped);
        }
        self.pending.push_back(pair);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &[u8] = b"GET /t HTTP/1.1\r\nHost: x\r\n\r\n";
    const RESP: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

    fn limits() -> Limits {
        Limits {
            max_conn_buffer: 64 * 1024,
            max_pending: 64,
            min_infer_bytes: 64,
        }
    }

    fn conn() -> Connection {
        Connection::new(
            SockKey::new(1, 7),
            Some(100),
            limits(),
            Arc::new(Counters::default()),
        )
    }

    fn conn_with(limits: Limits) -> (Connection, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Connection::new(SockKey::new(1, 7), Some(100), limits, counters.clone()),
            counters,
        )
    }

    #[test]
    fn first_data_infers_http1() {
        let mut c = conn();
        assert_eq!(c.phase(), Phase::Fresh);
        c.handle_data(Direction::Ingress, 200, false, REQ);
        assert_eq!(c.phase(), Phase::Parsing);
        assert_eq!(c.proto(), Some(ProtocolType::Http1));
        assert!(!c.ready());
        c.handle_data(Direction::Egress, 300, false, RESP);
        assert!(c.ready());
        let pairs = c.take_pending();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].started_at_ns, 200);
        assert_eq!(pairs[0].completed_at_ns, 300);
    }

    #[test]
    fn head_split_across_events_parses_once() {
        let mut c = conn();
        for chunk in REQ.chunks(5) {
            c.handle_data(Direction::Ingress, 200, false, chunk);
        }
        c.handle_data(Direction::Egress, 300, false, RESP);
        let pairs = c.take_pending();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].request.describe(), "GET /t");
    }

    #[test]
    fn proto_is_sticky_after_inference() {
        let (mut c, counters) = conn_with(limits());
        c.handle_data(Direction::Ingress, 200, false, REQ);
        assert_eq!(c.proto(), Some(ProtocolType::Http1));
        // garbage afterwards never unsets the protocol
        c.handle_data(Direction::Ingress, 210, false, &[0xde, 0xad, 0xbe, 0xef, b'\r', b'\n', b'\r', b'\n']);
        assert_eq!(c.proto(), Some(ProtocolType::Http1));
        assert_eq!(c.phase(), Phase::Parsing);
        assert!(Counters::get(&counters.parse_errors) >= 1);
    }

    #[test]
    fn http2_preface_leads_to_opaque() {
        let (mut c, counters) = conn_with(limits());
        c.handle_data(Direction::Ingress, 200, false, b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n");
        // 24 bytes of definite non-HTTP/1, but below the inference floor
        assert_eq!(c.phase(), Phase::Inferring);
        // binary frames push it over the floor
        c.handle_data(Direction::Ingress, 210, false, &[0u8; 48]);
        assert_eq!(c.phase(), Phase::Opaque);
        assert_eq!(c.proto(), None);
        assert_eq!(c.buffered_bytes(), 0);
        assert_eq!(Counters::get(&counters.inference_failures), 1);
        // further data is accounted but not buffered
        c.handle_data(Direction::Ingress, 220, false, &[0u8; 100]);
        assert_eq!(c.buffered_bytes(), 0);
        assert_eq!(c.last_activity_ns(), 220);
    }

    #[test]
    fn binary_junk_goes_opaque_in_one_event() {
        let (mut c, _) = conn_with(limits());
        c.handle_data(Direction::Ingress, 200, false, &[0xffu8; 80]);
        assert_eq!(c.phase(), Phase::Opaque);
    }

    #[test]
    fn oversize_head_recovers_after_resync() {
        let (mut c, counters) = conn_with(limits());
        // 5000-byte header value split across two events, then a good request
        let mut big = Vec::from(&b"GET /big HTTP/1.1\r\nX-Pad: "[..]);
        big.extend(std::iter::repeat(b'a').take(5000));
        big.extend_from_slice(b"\r\n\r\n");
        c.handle_data(Direction::Ingress, 200, false, &big[..4096]);
        c.handle_data(Direction::Ingress, 210, false, &big[4096..]);
        assert!(Counters::get(&counters.parse_errors) >= 1);
        assert!(c.take_pending().is_empty());

        c.handle_data(Direction::Ingress, 220, false, REQ);
        c.handle_data(Direction::Egress, 230, false, RESP);
        let pairs = c.take_pending();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].request.describe(), "GET /t");
    }

    #[test]
    fn truncated_event_drops_partial_head() {
        let (mut c, counters) = conn_with(limits());
        // settle the protocol first
        c.handle_data(Direction::Ingress, 200, false, REQ);
        // a truncated event leaves half a head behind
        c.handle_data(Direction::Ingress, 210, true, &REQ[..10]);
        assert_eq!(Counters::get(&counters.truncation_drops), 1);
        // the next complete request is captured cleanly
        c.handle_data(Direction::Ingress, 220, false, b"GET /next HTTP/1.1\r\n\r\n");
        c.handle_data(Direction::Egress, 230, false, RESP);
        c.handle_data(Direction::Egress, 240, false, RESP);
        let pairs = c.take_pending();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].request.describe(), "GET /t");
        assert_eq!(pairs[1].request.describe(), "GET /next");
    }

    #[test]
    fn lossy_direction_discards_partial_and_recovers() {
        let (mut c, _) = conn_with(limits());
        c.handle_data(Direction::Ingress, 200, false, &REQ[..20]);
        c.mark_lossy(Direction::Ingress);
        assert_eq!(c.buffered_bytes(), 0);
        c.handle_data(Direction::Ingress, 210, false, b"GET /after HTTP/1.1\r\n\r\n");
        c.handle_data(Direction::Egress, 220, false, RESP);
        let pairs = c.take_pending();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].request.describe(), "GET /after");
    }

    #[test]
    fn buffer_cap_evicts_oldest_prefix() {
        let (mut c, counters) = conn_with(Limits {
            max_conn_buffer: 32,
            max_pending: 64,
            min_infer_bytes: 1024,
        });
        c.handle_data(Direction::Ingress, 200, false, b"GET /aaaaaaaaaaaaaaaaaaaaaaaa");
        c.handle_data(Direction::Ingress, 210, false, b"bbbbbbbbbbbbbbbbbbbb");
        assert!(c.buffered_bytes() <= 32);
        assert!(Counters::get(&counters.buffer_evictions) >= 1);
    }

    #[test]
    fn pending_queue_cap_drops_oldest() {
        let (mut c, counters) = conn_with(Limits {
            max_conn_buffer: 64 * 1024,
            max_pending: 2,
            min_infer_bytes: 64,
        });
        for i in 0..3 {
            let req = format!("GET /r{i} HTTP/1.1\r\n\r\n");
            c.handle_data(Direction::Ingress, 200 + i, false, req.as_bytes());
            c.handle_data(Direction::Egress, 300 + i, false, RESP);
        }
        let pairs = c.take_pending();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].request.describe(), "GET /r1");
        assert_eq!(pairs[1].request.describe(), "GET /r2");
        assert_eq!(Counters::get(&counters.pairs_dropped), 1);
    }

    #[test]
    fn open_backfills_timestamp_once() {
        let mut c = Connection::new(
            SockKey::new(1, 7),
            None,
            limits(),
            Arc::new(Counters::default()),
        );
        c.handle_open(500);
        c.handle_open(900);
        // first open wins
        assert_eq!(c.opened_at(), Some(500));
        assert_eq!(c.last_activity_ns(), 900);
        c.handle_close(1000);
        assert!(c.is_closing());
        assert_eq!(c.closed_at(), Some(1000));
    }

    #[test]
    fn close_makes_connection_ready() {
        let mut c = conn();
        assert!(!c.ready());
        c.handle_close(400);
        assert!(c.ready());
        assert!(c.is_closing());
    }

    #[test]
    fn data_after_close_is_ignored() {
        let mut c = conn();
        c.handle_close(400);
        c.handle_data(Direction::Ingress, 500, false, REQ);
        assert_eq!(c.buffered_bytes(), 0);
        assert!(c.take_pending().is_empty());
    }

    #[test]
    fn response_before_request_still_pairs() {
        let mut c = conn();
        c.handle_data(Direction::Egress, 200, false, RESP);
        assert_eq!(c.phase(), Phase::Parsing);
        c.handle_data(Direction::Ingress, 210, false, REQ);
        let pairs = c.take_pending();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].response.describe(), "200 OK");
    }

    #[test]
    fn buffered_bytes_stays_bounded() {
        let lim = Limits {
            max_conn_buffer: 4096,
            max_pending: 64,
            min_infer_bytes: 64,
        };
        let (mut c, _) = conn_with(lim);
        // an endless almost-valid head never exceeds the cap per direction
        c.handle_data(Direction::Ingress, 200, false, b"GET /x HTTP/1.1\r\nX: ");
        for i in 0..20 {
            c.handle_data(Direction::Ingress, 210 + i, false, &[b'a'; 1024]);
            assert!(c.buffered_bytes() <= 2 * lim.max_conn_buffer);
        }
    }
}
