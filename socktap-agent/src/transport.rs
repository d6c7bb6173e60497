//! Kernel-to-user event transport.
//!
//! Four logical channels, each backed by a per-CPU perf buffer, carry
//! socket open/data/close records out of the kernel. One reader task per
//! (channel, CPU) decodes records and forwards them to the factory over a
//! single mpsc queue. Within one per-CPU buffer arrival order is preserved;
//! across channels and CPUs events interleave and the factory sorts it out.

use std::sync::Arc;

use anyhow::Context as _;
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::Map;
use aya::util::online_cpus;
use bytes::BytesMut;
use log::{debug, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use socktap_types::{
    Direction, EventHeader, SockKey, EVENT_HEADER_LEN, EVENT_KIND_CLOSE, EVENT_KIND_DATA_EGRESS,
    EVENT_KIND_DATA_INGRESS, EVENT_KIND_OPEN, MAP_SOCKET_CLOSE_EVENTS,
    MAP_SOCKET_DATA_EVENTS_EGRESS, MAP_SOCKET_DATA_EVENTS_INGRESS, MAP_SOCKET_OPEN_EVENTS,
    MAX_PAYLOAD,
};

use crate::clock;
use crate::counters::Counters;

/// The four kernel event channels.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Channel {
    SocketOpen,
    DataIngress,
    DataEgress,
    SocketClose,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::SocketOpen,
        Channel::DataIngress,
        Channel::DataEgress,
        Channel::SocketClose,
    ];

    /// Name of the kernel map backing this channel.
    pub fn map_name(self) -> &'static str {
        match self {
            Channel::SocketOpen => MAP_SOCKET_OPEN_EVENTS,
            Channel::DataIngress => MAP_SOCKET_DATA_EVENTS_INGRESS,
            Channel::DataEgress => MAP_SOCKET_DATA_EVENTS_EGRESS,
            Channel::SocketClose => MAP_SOCKET_CLOSE_EVENTS,
        }
    }

    /// The direction a data channel carries; `None` for open/close.
    pub fn direction(self) -> Option<Direction> {
        match self {
            Channel::DataIngress => Some(Direction::Ingress),
            Channel::DataEgress => Some(Direction::Egress),
            Channel::SocketOpen | Channel::SocketClose => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.map_name())
    }
}

/// A decoded kernel event, timestamps already normalized to wall-clock.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Open {
        sock_key: SockKey,
        ts_ns: u64,
    },
    Data {
        sock_key: SockKey,
        direction: Direction,
        ts_ns: u64,
        truncated: bool,
        payload: Vec<u8>,
    },
    Close {
        sock_key: SockKey,
        ts_ns: u64,
    },
}

impl RawEvent {
    pub fn sock_key(&self) -> SockKey {
        match self {
            RawEvent::Open { sock_key, .. }
            | RawEvent::Data { sock_key, .. }
            | RawEvent::Close { sock_key, .. } => *sock_key,
        }
    }

    pub fn ts_ns(&self) -> u64 {
        match self {
            RawEvent::Open { ts_ns, .. }
            | RawEvent::Data { ts_ns, .. }
            | RawEvent::Close { ts_ns, .. } => *ts_ns,
        }
    }
}

/// A record that could not be decoded. Counted, logged at debug, dropped.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    Short { len: usize },
    UnknownKind(u8),
    PayloadTooLarge { len: usize },
    PayloadOutOfBounds { expected: usize, len: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Short { len } => {
                write!(f, "record too short for header: {len} bytes")
            }
            DecodeError::UnknownKind(k) => write!(f, "unknown event kind: {k}"),
            DecodeError::PayloadTooLarge { len } => {
                write!(f, "payload length {len} exceeds {MAX_PAYLOAD}")
            }
            DecodeError::PayloadOutOfBounds { expected, len } => {
                write!(f, "record claims {expected} bytes but carries {len}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one raw record into a [`RawEvent`], normalizing its timestamp.
pub fn decode_record(buf: &[u8], boot_offset_ns: i64) -> Result<RawEvent, DecodeError> {
    let header = EventHeader::parse(buf).ok_or(DecodeError::Short { len: buf.len() })?;
    let payload_len = header.payload_len as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(DecodeError::PayloadTooLarge { len: payload_len });
    }
    let sock_key = header.sock_key();
    let ts_ns = clock::normalize(header.ts_ns, boot_offset_ns);

    match header.kind {
        EVENT_KIND_OPEN => Ok(RawEvent::Open { sock_key, ts_ns }),
        EVENT_KIND_CLOSE => Ok(RawEvent::Close { sock_key, ts_ns }),
        kind @ (EVENT_KIND_DATA_INGRESS | EVENT_KIND_DATA_EGRESS) => {
            let end = EVENT_HEADER_LEN + payload_len;
            if buf.len() < end {
                return Err(DecodeError::PayloadOutOfBounds {
                    expected: end,
                    len: buf.len(),
                });
            }
            let direction = if kind == EVENT_KIND_DATA_INGRESS {
                Direction::Ingress
            } else {
                Direction::Egress
            };
            Ok(RawEvent::Data {
                sock_key,
                direction,
                ts_ns,
                truncated: header.truncated != 0,
                payload: buf[EVENT_HEADER_LEN..end].to_vec(),
            })
        }
        other => Err(DecodeError::UnknownKind(other)),
    }
}

/// What the transport hands the factory: decoded events, or a loss marker
/// when the kernel overwrote records we never saw.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Event(RawEvent),
    Loss { channel: Channel, count: u64 },
}

/// Spawn one reader task per online CPU for a channel's perf buffer.
///
/// Readers exit when the shutdown signal fires, when the factory side of
/// `tx` goes away, or on an unrecoverable buffer error.
pub fn spawn_channel_readers(
    map: Map,
    channel: Channel,
    tx: mpsc::Sender<TransportEvent>,
    counters: Arc<Counters>,
    boot_offset_ns: i64,
    shutdown: &broadcast::Sender<()>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut perf = AsyncPerfEventArray::try_from(map)
        .with_context(|| format!("map {} is not a perf event array", channel.map_name()))?;
    let cpus = online_cpus().map_err(|(_, err)| anyhow::Error::from(err))?;

    let mut handles = Vec::with_capacity(cpus.len());
    for cpu in cpus {
        let mut buf = perf
            .open(cpu, None)
            .with_context(|| format!("opening {} buffer for cpu {cpu}", channel.map_name()))?;
        let tx = tx.clone();
        let counters = counters.clone();
        let mut shutdown_rx = shutdown.subscribe();

        handles.push(tokio::spawn(async move {
            let mut buffers = (0..16)
                .map(|_| BytesMut::with_capacity(EVENT_HEADER_LEN + MAX_PAYLOAD))
                .collect::<Vec<_>>();

            loop {
                let events = tokio::select! {
                    res = buf.read_events(&mut buffers) => match res {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("perf read error on {channel} cpu {cpu}: {e}");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                };

                if events.lost > 0 {
                    Counters::add(&counters.events_lost, events.lost as u64);
                    let loss = TransportEvent::Loss {
                        channel,
                        count: events.lost as u64,
                    };
                    if tx.send(loss).await.is_err() {
                        return;
                    }
                }

                for record in buffers.iter().take(events.read) {
                    Counters::bump(&counters.events_received);
                    match decode_record(record, boot_offset_ns) {
                        Ok(event) => {
                            if tx.send(TransportEvent::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            Counters::bump(&counters.decode_errors);
                            debug!("dropping undecodable record on {channel}: {e}");
                        }
                    }
                }
            }
        }));
    }

    Ok(handles)
}
