//! Property: interleaving events from distinct sockets never changes what
//! each socket's connection emits.

use std::collections::VecDeque;
use std::sync::Arc;

use proptest::prelude::*;
use socktap_agent::config::AgentConfig;
use socktap_agent::counters::Counters;
use socktap_agent::factory::ConnectionFactory;
use socktap_agent::sink::PairRecord;
use socktap_agent::transport::RawEvent;
use socktap_types::{Direction, SockKey};
use tokio::sync::broadcast;

const KEY_A: SockKey = SockKey::new(1, 7);
const KEY_B: SockKey = SockKey::new(2, 9);

fn events_for(sock_key: SockKey, tag: char, n: usize) -> VecDeque<RawEvent> {
    let mut events = VecDeque::new();
    events.push_back(RawEvent::Open {
        sock_key,
        ts_ns: 1,
    });
    for i in 0..n {
        let req = format!("GET /{tag}{i} HTTP/1.1\r\nHost: x\r\n\r\n");
        let resp = format!("HTTP/1.1 200 OK\r\nX-Seq: {i}\r\n\r\n");
        events.push_back(RawEvent::Data {
            sock_key,
            direction: Direction::Ingress,
            ts_ns: 10 + i as u64,
            truncated: false,
            payload: req.into_bytes(),
        });
        events.push_back(RawEvent::Data {
            sock_key,
            direction: Direction::Egress,
            ts_ns: 20 + i as u64,
            truncated: false,
            payload: resp.into_bytes(),
        });
    }
    events
}

fn run_interleaved(order: &[bool], na: usize, nb: usize) -> Vec<PairRecord> {
    let config = AgentConfig {
        target_pid: 1,
        ..AgentConfig::default()
    };
    let (tx, mut rx) = broadcast::channel(256);
    let mut factory = ConnectionFactory::new(&config, Arc::new(Counters::default()), tx);

    let mut a = events_for(KEY_A, 'a', na);
    let mut b = events_for(KEY_B, 'b', nb);
    for &pick_a in order {
        let event = if pick_a { a.pop_front() } else { b.pop_front() };
        if let Some(event) = event {
            factory.deliver(event);
        }
    }
    for event in a.into_iter().chain(b) {
        factory.deliver(event);
    }
    factory.handle_ready_connections();

    let mut pairs = Vec::new();
    while let Ok(p) = rx.try_recv() {
        pairs.push(p);
    }
    pairs
}

fn targets_for(pairs: &[PairRecord], sock_key: SockKey) -> Vec<String> {
    pairs
        .iter()
        .filter(|p| p.pid == sock_key.pid && p.fd == sock_key.fd)
        .map(|p| {
            let socktap_protocols::Request::Http1(req) = &p.request;
            req.target.clone()
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn interleaving_does_not_change_per_socket_pairs(
        na in 1..6usize,
        nb in 1..6usize,
        order in proptest::collection::vec(any::<bool>(), 0..40),
    ) {
        let pairs = run_interleaved(&order, na, nb);

        prop_assert_eq!(pairs.len(), na + nb);
        let expected_a: Vec<String> = (0..na).map(|i| format!("/a{i}")).collect();
        let expected_b: Vec<String> = (0..nb).map(|i| format!("/b{i}")).collect();
        prop_assert_eq!(targets_for(&pairs, KEY_A), expected_a);
        prop_assert_eq!(targets_for(&pairs, KEY_B), expected_b);
    }
}
