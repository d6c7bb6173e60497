//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default location of the pre-compiled kernel object.
pub const DEFAULT_BPF_OBJECT: &str = "/usr/lib/socktap/socktap.bpf.o";

/// Bytes that must accumulate before a connection with no recognized
/// protocol gives up on inference.
pub const MIN_INFER_BYTES: usize = 64;

/// Flush policy for batching sinks (file, webhook). A batch goes out when
/// it reaches `max_pairs` or has waited `max_wait`, whichever comes first.
#[derive(Clone, Copy, Debug)]
pub struct Batching {
    pub max_pairs: usize,
    pub max_wait: Duration,
}

/// Per-connection resource limits, shared by every connection the factory
/// creates.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Cap on each direction's reassembly buffer. Exceeding it evicts the
    /// oldest prefix and forces a resync.
    pub max_conn_buffer: usize,
    /// Cap on pending queues (matcher queues and the harvested-pair queue).
    pub max_pending: usize,
    /// Inference gives up once this many bytes failed to match any parser.
    pub min_infer_bytes: usize,
}

/// Configuration for one agent run.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// PID whose sockets are observed; pushed to the kernel-side filter.
    pub target_pid: u32,
    /// Path to the pre-compiled eBPF object file.
    pub bpf_object: PathBuf,
    /// Output sink: `stdout`, `file:PATH`, or `webhook:URL`.
    pub output: String,
    /// Stdout rendering: `text` or `json`.
    pub format: String,
    /// Cadence of the ready-connection scan.
    pub harvest_interval: Duration,
    /// Inactivity window after which a connection is closed and reaped.
    pub idle_timeout: Duration,
    /// How long shutdown waits for the factory to drain.
    pub drain_deadline: Duration,
    /// Per-direction reassembly buffer cap.
    pub max_conn_buffer: usize,
    /// Cap on simultaneously tracked connections.
    pub max_connections: usize,
    /// Cap on per-connection pending queues.
    pub max_pending: usize,
    /// Pairs a batching sink accumulates before flushing.
    pub sink_batch_size: usize,
    /// Longest a buffered sink batch waits before flushing anyway.
    pub sink_flush_interval: Duration,
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            target_pid: 0,
            bpf_object: PathBuf::from(DEFAULT_BPF_OBJECT),
            output: "stdout".to_string(),
            format: "text".to_string(),
            harvest_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            drain_deadline: Duration::from_secs(5),
            max_conn_buffer: 64 * 1024,
            max_connections: 16_384,
            max_pending: 64,
            sink_batch_size: 32,
            sink_flush_interval: Duration::from_millis(500),
            verbose: false,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.target_pid == 0 {
            return Err("target pid must be non-zero".to_string());
        }
        if self.harvest_interval.is_zero() {
            return Err("harvest interval must be non-zero".to_string());
        }
        if self.max_pending == 0 {
            return Err("max pending must be at least 1".to_string());
        }
        if self.sink_batch_size == 0 {
            return Err("sink batch size must be at least 1".to_string());
        }
        if self.sink_flush_interval.is_zero() {
            return Err("sink flush interval must be non-zero".to_string());
        }
        if self.max_conn_buffer < socktap_types::MAX_PAYLOAD {
            return Err(format!(
                "connection buffer must hold at least one payload ({} bytes)",
                socktap_types::MAX_PAYLOAD
            ));
        }
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(format!("unsupported output format: {other}")),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_conn_buffer: self.max_conn_buffer,
            max_pending: self.max_pending,
            min_infer_bytes: MIN_INFER_BYTES,
        }
    }

    pub fn batching(&self) -> Batching {
        Batching {
            max_pairs: self.sink_batch_size,
            max_wait: self.sink_flush_interval,
        }
    }
}
