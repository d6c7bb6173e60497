//! Run counters.
//!
//! Steady-state anomalies (parse failures, kernel drops, queue overflow)
//! never propagate as errors; they land here and surface in the shutdown
//! summary and in tests.

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

#[derive(Debug, Default)]
pub struct Counters {
    pub events_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub events_lost: AtomicU64,
    pub parse_errors: AtomicU64,
    pub inference_failures: AtomicU64,
    pub truncation_drops: AtomicU64,
    pub buffer_evictions: AtomicU64,
    pub pairs_emitted: AtomicU64,
    pub pairs_dropped: AtomicU64,
    pub connections_created: AtomicU64,
    pub connections_reaped: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn log_summary(&self) {
        info!(
            "events: {} received, {} lost, {} undecodable",
            Self::get(&self.events_received),
            Self::get(&self.events_lost),
            Self::get(&self.decode_errors),
        );
        info!(
            "connections: {} created, {} reaped",
            Self::get(&self.connections_created),
            Self::get(&self.connections_reaped),
        );
        info!(
            "pairs: {} emitted, {} dropped",
            Self::get(&self.pairs_emitted),
            Self::get(&self.pairs_dropped),
        );
        info!(
            "recovered: {} parse errors, {} inference failures, {} truncation drops, {} buffer evictions",
            Self::get(&self.parse_errors),
            Self::get(&self.inference_failures),
            Self::get(&self.truncation_drops),
            Self::get(&self.buffer_evictions),
        );
    }
}
