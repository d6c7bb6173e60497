//! Integration tests for socktap-types userspace helpers (requires `user` feature).

use socktap_types::*;

fn make_record(pid: u32, fd: u32, ts_ns: u64, kind: u8, truncated: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EVENT_HEADER_LEN + payload.len());
    buf.extend_from_slice(&pid.to_le_bytes());
    buf.extend_from_slice(&fd.to_le_bytes());
    buf.extend_from_slice(&ts_ns.to_le_bytes());
    buf.push(kind);
    buf.push(truncated);
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

// ---- EventHeader::parse ----

#[test]
fn header_parse_data_record() {
    let rec = make_record(1234, 7, 99_000_000_001, EVENT_KIND_DATA_INGRESS, 1, b"GET /");
    let hdr = EventHeader::parse(&rec).unwrap();
    assert_eq!(hdr.pid, 1234);
    assert_eq!(hdr.fd, 7);
    assert_eq!(hdr.ts_ns, 99_000_000_001);
    assert_eq!(hdr.kind, EVENT_KIND_DATA_INGRESS);
    assert_eq!(hdr.truncated, 1);
    assert_eq!(hdr.payload_len, 5);
    assert_eq!(hdr.sock_key(), SockKey::new(1234, 7));
}

#[test]
fn header_parse_open_record_no_payload() {
    let rec = make_record(42, 3, 1, EVENT_KIND_OPEN, 0, b"");
    let hdr = EventHeader::parse(&rec).unwrap();
    assert_eq!(hdr.kind, EVENT_KIND_OPEN);
    assert_eq!(hdr.payload_len, 0);
    assert_eq!(rec.len(), EVENT_HEADER_LEN);
}

#[test]
fn header_parse_short_buffer() {
    let rec = make_record(1, 1, 1, EVENT_KIND_CLOSE, 0, b"");
    assert!(EventHeader::parse(&rec[..EVENT_HEADER_LEN - 1]).is_none());
    assert!(EventHeader::parse(&[]).is_none());
}

#[test]
fn header_parse_is_little_endian() {
    let mut rec = vec![0u8; EVENT_HEADER_LEN];
    rec[0] = 0x01;
    rec[1] = 0x02; // pid = 0x0201
    rec[18] = 0x10;
    rec[19] = 0x00; // payload_len = 16
    let hdr = EventHeader::parse(&rec).unwrap();
    assert_eq!(hdr.pid, 0x0201);
    assert_eq!(hdr.payload_len, 16);
}

// ---- SockKey ----

#[test]
fn sock_key_equality_is_fieldwise() {
    assert_eq!(SockKey::new(1, 7), SockKey::new(1, 7));
    assert_ne!(SockKey::new(1, 7), SockKey::new(1, 8));
    assert_ne!(SockKey::new(1, 7), SockKey::new(2, 7));
}

#[test]
fn sock_key_usable_as_map_key() {
    use std::collections::HashMap;
    let mut m = HashMap::new();
    m.insert(SockKey::new(1, 7), "a");
    m.insert(SockKey::new(1, 8), "b");
    assert_eq!(m.get(&SockKey::new(1, 7)), Some(&"a"));
    assert_eq!(m.len(), 2);
}

#[test]
fn sock_key_serializes() {
    let json = serde_json::to_string(&SockKey::new(9, 4)).unwrap();
    assert_eq!(json, r#"{"pid":9,"fd":4}"#);
}

// ---- Direction ----

#[test]
fn direction_as_str() {
    assert_eq!(Direction::Ingress.as_str(), "ingress");
    assert_eq!(Direction::Egress.as_str(), "egress");
}
