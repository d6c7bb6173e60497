#![cfg_attr(not(feature = "user"), no_std)]

//! Wire contract shared between the socktap kernel programs and the
//! userspace agent: socket identity, event kinds, record layout, and the
//! logical names of the kernel maps both sides agree on.
//!
//! The crate is `no_std` by default so the eBPF side can depend on it.
//! Userspace-only helpers (record header decoding, serde impls) live behind
//! the `user` feature.

/// Maximum payload bytes captured per data event. Syscall buffers larger
/// than this are truncated by the kernel side and flagged as such.
pub const MAX_PAYLOAD: usize = 4096;

/// Fixed length of the event record header on the wire. Fields are
/// little-endian and packed:
///
/// ```text
/// u32 pid
/// u32 fd
/// u64 ts_ns
/// u8  kind
/// u8  truncated
/// u16 payload_len
/// ```
pub const EVENT_HEADER_LEN: usize = 20;

/// Record kinds, stored in the `kind` byte of every event header.
pub const EVENT_KIND_OPEN: u8 = 0;
pub const EVENT_KIND_DATA_INGRESS: u8 = 1;
pub const EVENT_KIND_DATA_EGRESS: u8 = 2;
pub const EVENT_KIND_CLOSE: u8 = 3;

/// Per-CPU perf buffer names, one logical channel per event class.
pub const MAP_SOCKET_OPEN_EVENTS: &str = "socket_open_events";
pub const MAP_SOCKET_DATA_EVENTS_INGRESS: &str = "socket_data_events_ingress";
pub const MAP_SOCKET_DATA_EVENTS_EGRESS: &str = "socket_data_events_egress";
pub const MAP_SOCKET_CLOSE_EVENTS: &str = "socket_close_events";

/// Kernel map holding the target PID at key 0. The kernel side drops
/// events from every other process.
pub const MAP_TARGET_PID: &str = "target_pid_map";

/// Identity of an observed socket within the target process.
///
/// Stable for the lifetime of the kernel file descriptor; a close followed
/// by FD reuse starts a new logical connection under the same key.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct SockKey {
    pub pid: u32,
    pub fd: u32,
}

impl SockKey {
    pub const fn new(pid: u32, fd: u32) -> Self {
        SockKey { pid, fd }
    }
}

/// Direction of a data event relative to the observed process.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub enum Direction {
    /// Bytes the process read from the socket.
    Ingress,
    /// Bytes the process wrote to the socket.
    Egress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

/// Decoded event record header. Not a cast-view of the wire bytes: the wire
/// layout is packed to [`EVENT_HEADER_LEN`] bytes, so decoding is explicit
/// and endian-aware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventHeader {
    pub pid: u32,
    pub fd: u32,
    pub ts_ns: u64,
    pub kind: u8,
    pub truncated: u8,
    pub payload_len: u16,
}

impl EventHeader {
    pub fn sock_key(&self) -> SockKey {
        SockKey::new(self.pid, self.fd)
    }
}

#[cfg(feature = "user")]
impl EventHeader {
    /// Decode a header from the front of a raw record. Returns `None` if the
    /// buffer is shorter than [`EVENT_HEADER_LEN`].
    pub fn parse(buf: &[u8]) -> Option<EventHeader> {
        if buf.len() < EVENT_HEADER_LEN {
            return None;
        }
        Some(EventHeader {
            pid: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            fd: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            ts_ns: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            kind: buf[16],
            truncated: buf[17],
            payload_len: u16::from_le_bytes(buf[18..20].try_into().ok()?),
        })
    }
}
