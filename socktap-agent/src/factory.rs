//! Connection ownership and the harvest loop.
//!
//! The factory is the single owner of every live [`Connection`]. Transport
//! readers feed it over one mpsc queue; it serializes all routing-table and
//! connection mutation on its own task, so no connection is ever touched by
//! two threads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use socktap_protocols::MatchedPair;
use socktap_types::SockKey;
use tokio::sync::{broadcast, mpsc};

use crate::clock;
use crate::config::{AgentConfig, Limits};
use crate::connection::Connection;
use crate::counters::Counters;
use crate::sink::PairRecord;
use crate::transport::{Channel, RawEvent, TransportEvent};

pub struct ConnectionFactory {
    connections: HashMap<SockKey, Connection>,
    /// Connections displaced by FD reuse, kept until their pairs are
    /// harvested at the next scan.
    draining: Vec<Connection>,
    limits: Limits,
    idle_timeout_ns: u64,
    max_connections: usize,
    counters: Arc<Counters>,
    sink: broadcast::Sender<PairRecord>,
}

impl ConnectionFactory {
    pub fn new(
        config: &AgentConfig,
        counters: Arc<Counters>,
        sink: broadcast::Sender<PairRecord>,
    ) -> Self {
        ConnectionFactory {
            connections: HashMap::new(),
            draining: Vec::new(),
            limits: config.limits(),
            idle_timeout_ns: config.idle_timeout.as_nanos() as u64,
            max_connections: config.max_connections,
            counters: counters.clone(),
            sink,
        }
    }

    /// Number of live connections in the routing table.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_tracked(&self, sock_key: &SockKey) -> bool {
        self.connections.contains_key(sock_key)
    }

    /// Total reassembly bytes buffered across all live connections.
    pub fn buffered_bytes(&self) -> usize {
        self.connections.values().map(|c| c.buffered_bytes()).sum()
    }

    /// Route one event to its connection, creating it if needed.
    ///
    /// Closure is terminal: any event arriving for a closing connection
    /// under the same key means the kernel FD was reused, so the old
    /// connection is set aside for its final harvest and a fresh one takes
    /// the slot. The two lives never share state.
    pub fn deliver(&mut self, event: RawEvent) {
        match event {
            RawEvent::Open { sock_key, ts_ns } => {
                if self.displace_if_closing(sock_key) || !self.connections.contains_key(&sock_key)
                {
                    self.create(sock_key, Some(ts_ns));
                } else if let Some(conn) = self.connections.get_mut(&sock_key) {
                    conn.handle_open(ts_ns);
                }
            }
            RawEvent::Data {
                sock_key,
                direction,
                ts_ns,
                truncated,
                payload,
            } => {
                if self.displace_if_closing(sock_key) || !self.connections.contains_key(&sock_key)
                {
                    // late-open tolerance: first sight of this socket
                    self.create(sock_key, None);
                }
                if let Some(conn) = self.connections.get_mut(&sock_key) {
                    conn.handle_data(direction, ts_ns, truncated, &payload);
                }
            }
            RawEvent::Close { sock_key, ts_ns } => {
                if let Some(conn) = self.connections.get_mut(&sock_key) {
                    conn.handle_close(ts_ns);
                } else {
                    debug!("close for untracked socket {sock_key:?}");
                }
            }
        }
    }

    /// Kernel buffer overrun on one channel. The overwritten records cannot
    /// be attributed to specific sockets, so every live connection resyncs
    /// the affected direction.
    pub fn handle_loss(&mut self, channel: Channel, count: u64) {
        warn!("kernel dropped {count} records on {channel}");
        if let Some(direction) = channel.direction() {
            for conn in self.connections.values_mut() {
                conn.mark_lossy(direction);
            }
        }
    }

    /// Move connections idle past the timeout into their closing state.
    pub fn sweep_idle(&mut self, now_ns: u64) {
        for conn in self.connections.values_mut() {
            if !conn.is_closing()
                && now_ns.saturating_sub(conn.last_activity_ns()) >= self.idle_timeout_ns
            {
                debug!("idle timeout for {:?}", conn.sock_key());
                conn.mark_closing();
            }
        }
    }

    /// Harvest loop body: drain ready connections into the sink and reap
    /// the closing ones. A closed connection passes through here exactly
    /// once.
    pub fn handle_ready_connections(&mut self) {
        let mut reaped = Vec::new();
        for (sock_key, conn) in self.connections.iter_mut() {
            if !conn.ready() {
                continue;
            }
            for pair in conn.take_pending() {
                emit(&self.sink, &self.counters, *sock_key, pair);
            }
            if conn.is_closing() {
                reaped.push(*sock_key);
            }
        }
        for sock_key in reaped {
            self.connections.remove(&sock_key);
            Counters::bump(&self.counters.connections_reaped);
        }

        for mut conn in self.draining.drain(..) {
            let sock_key = conn.sock_key();
            for pair in conn.take_pending() {
                emit(&self.sink, &self.counters, sock_key, pair);
            }
            Counters::bump(&self.counters.connections_reaped);
        }
    }

    /// Consume transport events until the readers hang up, harvesting on a
    /// fixed cadence; finish with a final harvest of everything left.
    pub async fn run(mut self, mut rx: mpsc::Receiver<TransportEvent>, harvest_interval: Duration) {
        let mut tick = tokio::time::interval(harvest_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = rx.recv() => match incoming {
                    Some(TransportEvent::Event(event)) => self.deliver(event),
                    Some(TransportEvent::Loss { channel, count }) => {
                        self.handle_loss(channel, count);
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    self.sweep_idle(clock::wall_now_ns());
                    self.handle_ready_connections();
                }
            }
        }

        for conn in self.connections.values_mut() {
            conn.mark_closing();
        }
        self.handle_ready_connections();
    }

    fn displace_if_closing(&mut self, sock_key: SockKey) -> bool {
        let closing = self
            .connections
            .get(&sock_key)
            .map(|c| c.is_closing())
            .unwrap_or(false);
        if closing {
            if let Some(old) = self.connections.remove(&sock_key) {
                debug!("fd reuse on {sock_key:?}, retiring previous connection");
                self.draining.push(old);
            }
        }
        closing
    }

    fn create(&mut self, sock_key: SockKey, opened_at: Option<u64>) {
        if self.connections.len() >= self.max_connections {
            self.evict_oldest_idle();
        }
        self.connections.insert(
            sock_key,
            Connection::new(sock_key, opened_at, self.limits, self.counters.clone()),
        );
        Counters::bump(&self.counters.connections_created);
    }

    fn evict_oldest_idle(&mut self) {
        let oldest = self
            .connections
            .iter()
            .min_by_key(|(_, c)| c.last_activity_ns())
            .map(|(k, _)| *k);
        if let Some(sock_key) = oldest {
            warn!("connection table full, evicting {sock_key:?}");
            if let Some(mut conn) = self.connections.remove(&sock_key) {
                for pair in conn.take_pending() {
                    emit(&self.sink, &self.counters, sock_key, pair);
                }
            }
            Counters::bump(&self.counters.connections_reaped);
        }
    }
}

fn emit(
    sink: &broadcast::Sender<PairRecord>,
    counters: &Counters,
    sock_key: SockKey,
    pair: MatchedPair,
) {
    let record = PairRecord::new(sock_key, pair);
    if sink.send(record).is_ok() {
        Counters::bump(&counters.pairs_emitted);
    } else {
        // no live sink consumer
        Counters::bump(&counters.pairs_dropped);
    }
}
