//! Downstream delivery of matched pairs.
//!
//! Harvested pairs fan out over a broadcast channel to whichever sink the
//! run was configured with: stdout, an NDJSON file, or a webhook receiving
//! batched NDJSON. File and webhook consumers accumulate pairs into a
//! batch governed by the configured [`Batching`] policy; stdout stays
//! per-record since it exists to be watched. A consumer that falls behind
//! drops the overwritten records and keeps going; delivery is best-effort
//! by design.

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use socktap_protocols::{MatchedPair, Request, Response};
use socktap_types::SockKey;
use tokio::sync::broadcast;

use crate::config::Batching;
use crate::counters::Counters;

/// One matched request/response, as handed to consumers.
#[derive(Debug, Clone, Serialize)]
pub struct PairRecord {
    pub pid: u32,
    pub fd: u32,
    pub proto: &'static str,
    pub request: Request,
    pub response: Response,
    pub ts_started: u64,
    pub ts_completed: u64,
}

impl PairRecord {
    pub fn new(sock_key: SockKey, pair: MatchedPair) -> Self {
        PairRecord {
            pid: sock_key.pid,
            fd: sock_key.fd,
            proto: pair.request.proto_type().as_str(),
            request: pair.request,
            response: pair.response,
            ts_started: pair.started_at_ns,
            ts_completed: pair.completed_at_ns,
        }
    }

    pub fn latency_ns(&self) -> u64 {
        self.ts_completed.saturating_sub(self.ts_started)
    }

    /// Single-line rendering for the text format.
    pub fn text_line(&self) -> String {
        format!(
            "{} {}:{} {} -> {} ({:.1} ms)",
            format_clock(self.ts_started),
            self.pid,
            self.fd,
            self.request.describe(),
            self.response.describe(),
            self.latency_ns() as f64 / 1_000_000.0,
        )
    }
}

/// Wall-clock nanoseconds as `HH:MM:SS.mmm`.
fn format_clock(ns: u64) -> String {
    let secs = ns / 1_000_000_000;
    let millis = (ns % 1_000_000_000) / 1_000_000;
    let hours = (secs / 3600) % 24;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// Where harvested pairs go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    /// Print to stdout in the configured format.
    Stdout,
    /// Append NDJSON lines to a file.
    File { path: PathBuf },
    /// POST NDJSON batches to a webhook URL.
    Webhook { url: String },
}

impl OutputSink {
    /// Parse a sink specification string.
    /// Formats: "stdout", "file:PATH", "webhook:URL"
    pub fn parse(spec: &str) -> Option<Self> {
        if spec == "stdout" {
            Some(OutputSink::Stdout)
        } else if let Some(path) = spec.strip_prefix("file:") {
            Some(OutputSink::File {
                path: PathBuf::from(path),
            })
        } else if let Some(url) = spec.strip_prefix("webhook:") {
            Some(OutputSink::Webhook {
                url: url.to_string(),
            })
        } else {
            None
        }
    }
}

/// Serialized pairs waiting to go out as one NDJSON body.
struct Batch {
    lines: Vec<String>,
    max_pairs: usize,
}

impl Batch {
    fn new(policy: Batching) -> Self {
        Batch {
            lines: Vec::with_capacity(policy.max_pairs),
            max_pairs: policy.max_pairs.max(1),
        }
    }

    /// Buffer one record. Returns true once the batch is due for a flush.
    fn push(&mut self, record: &PairRecord) -> bool {
        if let Ok(json) = serde_json::to_string(record) {
            self.lines.push(json);
        }
        self.lines.len() >= self.max_pairs
    }

    /// Drain the buffered lines into one newline-terminated NDJSON body.
    fn take(&mut self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        let mut body = self.lines.join("\n");
        body.push('\n');
        self.lines.clear();
        Some(body)
    }
}

/// Run a consumer that reads pairs from the broadcast channel and writes
/// them to the given sink until the channel closes.
pub async fn run_sink_consumer(
    rx: broadcast::Receiver<PairRecord>,
    sink: OutputSink,
    format: String,
    batching: Batching,
    counters: Arc<Counters>,
) {
    match sink {
        OutputSink::Stdout => run_stdout_consumer(rx, format, counters).await,
        OutputSink::File { path } => run_file_consumer(rx, path, batching, counters).await,
        OutputSink::Webhook { url } => run_webhook_consumer(rx, url, batching, counters).await,
    }
}

async fn run_stdout_consumer(
    mut rx: broadcast::Receiver<PairRecord>,
    format: String,
    counters: Arc<Counters>,
) {
    loop {
        match rx.recv().await {
            Ok(record) => match format.as_str() {
                "json" => {
                    if let Ok(json) = serde_json::to_string(&record) {
                        println!("{json}");
                    }
                }
                _ => println!("{}", record.text_line()),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("stdout consumer lagged, dropped {n} pairs");
                Counters::add(&counters.pairs_dropped, n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_file_consumer(
    mut rx: broadcast::Receiver<PairRecord>,
    path: PathBuf,
    batching: Batching,
    counters: Arc<Counters>,
) {
    info!("pair file consumer started -> {}", path.display());
    let file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!("failed to open output file {}: {e}", path.display());
            return;
        }
    };
    let mut writer = tokio::io::BufWriter::new(file);
    let mut batch = Batch::new(batching);
    let mut flush_timer = tokio::time::interval(batching.max_wait);

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(record) => {
                    if batch.push(&record) && !write_file_batch(&mut writer, &mut batch, &path).await {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("file consumer lagged, dropped {n} pairs");
                    Counters::add(&counters.pairs_dropped, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = flush_timer.tick() => {
                if !write_file_batch(&mut writer, &mut batch, &path).await {
                    return;
                }
            }
        }
    }
    write_file_batch(&mut writer, &mut batch, &path).await;
}

/// Append the pending batch to the file. Returns false on a write error,
/// which ends the consumer.
async fn write_file_batch(
    writer: &mut tokio::io::BufWriter<tokio::fs::File>,
    batch: &mut Batch,
    path: &std::path::Path,
) -> bool {
    use tokio::io::AsyncWriteExt;

    let Some(body) = batch.take() else { return true };
    if let Err(e) = writer.write_all(body.as_bytes()).await {
        warn!("write to {} failed: {e}", path.display());
        return false;
    }
    if let Err(e) = writer.flush().await {
        warn!("flush of {} failed: {e}", path.display());
        return false;
    }
    true
}

async fn run_webhook_consumer(
    mut rx: broadcast::Receiver<PairRecord>,
    url: String,
    batching: Batching,
    counters: Arc<Counters>,
) {
    info!("pair webhook consumer started -> {url}");
    let client = reqwest::Client::new();
    let mut batch = Batch::new(batching);
    let mut flush_timer = tokio::time::interval(batching.max_wait);

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(record) => {
                    if batch.push(&record) {
                        post_webhook_batch(&client, &url, &mut batch).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("webhook consumer lagged, dropped {n} pairs");
                    Counters::add(&counters.pairs_dropped, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = flush_timer.tick() => {
                post_webhook_batch(&client, &url, &mut batch).await;
            }
        }
    }
    post_webhook_batch(&client, &url, &mut batch).await;
}

async fn post_webhook_batch(client: &reqwest::Client, url: &str, batch: &mut Batch) {
    let Some(body) = batch.take() else { return };
    match client
        .post(url)
        .header("Content-Type", "application/x-ndjson")
        .body(body)
        .send()
        .await
    {
        Ok(resp) => {
            if !resp.status().is_success() {
                warn!("webhook returned status {}", resp.status());
            }
        }
        Err(e) => {
            warn!("webhook POST failed: {e}");
        }
    }
}
