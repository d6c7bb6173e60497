//! Userspace agent for passive per-process HTTP observation.
//!
//! This crate loads the pre-compiled socktap eBPF object into the kernel
//! (entry/return kprobes on the socket syscalls), pushes the target PID to
//! the kernel-side filter, consumes the four per-CPU event channels, and
//! reconstructs each socket's byte streams into matched request/response
//! pairs that fan out to the configured sink.
//!
//! Pipeline: transport readers (one task per channel and CPU) decode raw
//! records and feed one mpsc queue; the factory task owns every connection
//! and serializes all state mutation; harvested pairs broadcast to sink
//! consumers.
//!
//! # Usage
//!
//! ```no_run
//! use socktap_agent::{run_agent, AgentConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AgentConfig {
//!     target_pid: 4321,
//!     ..AgentConfig::default()
//! };
//! run_agent(config).await
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod connection;
pub mod counters;
pub mod factory;
pub mod sink;
pub mod transport;

pub use config::AgentConfig;

use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use aya::maps::HashMap as AyaHashMap;
use aya::programs::KProbe;
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::{signal, task};

use crate::counters::Counters;
use crate::factory::ConnectionFactory;
use crate::sink::{OutputSink, PairRecord};
use crate::transport::Channel;

/// eBPF program names paired with the syscall each one probes. Every
/// syscall gets an entry and a return probe: the entry records the buffer
/// pointer, the return reads how much the kernel actually moved.
const SYSCALL_PROBES: &[(&str, &str)] = &[
    ("syscall_entry_accept", "sys_accept"),
    ("syscall_exit_accept", "sys_accept"),
    ("syscall_entry_accept4", "sys_accept4"),
    ("syscall_exit_accept4", "sys_accept4"),
    ("syscall_entry_read", "sys_read"),
    ("syscall_exit_read", "sys_read"),
    ("syscall_entry_write", "sys_write"),
    ("syscall_exit_write", "sys_write"),
    ("syscall_entry_writev", "sys_writev"),
    ("syscall_exit_writev", "sys_writev"),
    ("syscall_entry_sendto", "sys_sendto"),
    ("syscall_exit_sendto", "sys_sendto"),
    ("syscall_entry_recvfrom", "sys_recvfrom"),
    ("syscall_exit_recvfrom", "sys_recvfrom"),
    ("syscall_entry_close", "sys_close"),
    ("syscall_exit_close", "sys_close"),
];

/// Run the agent until Ctrl-C.
pub async fn run_agent(config: AgentConfig) -> Result<()> {
    let sink = OutputSink::parse(&config.output)
        .ok_or_else(|| anyhow!("unknown output sink: {}", config.output))?;

    // Bump memlock rlimit for older kernels
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("failed to raise memlock rlimit");
    }

    let boot_offset_ns = clock::boot_offset_ns();

    let mut bpf = Ebpf::load_file(&config.bpf_object)
        .with_context(|| format!("loading eBPF object {}", config.bpf_object.display()))?;

    if let Err(e) = EbpfLogger::init(&mut bpf) {
        warn!("failed to initialize eBPF logger: {e}");
    }

    push_pid_filter(&mut bpf, config.target_pid)?;
    attach_probes(&mut bpf)?;

    let counters = Arc::new(Counters::default());

    // Harvested pairs fan out to sink consumers over broadcast
    let (pair_tx, _) = broadcast::channel::<PairRecord>(4096);
    task::spawn(sink::run_sink_consumer(
        pair_tx.subscribe(),
        sink,
        config.format.clone(),
        config.batching(),
        counters.clone(),
    ));

    // Transport readers feed the factory over one mpsc queue
    let (event_tx, event_rx) = mpsc::channel(8192);
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut reader_handles = Vec::new();
    for channel in Channel::ALL {
        let map = bpf
            .take_map(channel.map_name())
            .ok_or_else(|| anyhow!("kernel map {} not found", channel.map_name()))?;
        reader_handles.extend(transport::spawn_channel_readers(
            map,
            channel,
            event_tx.clone(),
            counters.clone(),
            boot_offset_ns,
            &shutdown_tx,
        )?);
    }
    drop(event_tx);

    let factory = ConnectionFactory::new(&config, counters.clone(), pair_tx.clone());
    let factory_handle = task::spawn(factory.run(event_rx, config.harvest_interval));

    info!(
        "observing pid {} ({} reader tasks). Press Ctrl-C to exit",
        config.target_pid,
        reader_handles.len(),
    );

    signal::ctrl_c().await?;
    info!("shutting down");

    // Readers close first; the factory drains what they already queued and
    // finishes with a final harvest, bounded by the drain deadline.
    let _ = shutdown_tx.send(());
    for handle in reader_handles {
        let _ = handle.await;
    }
    if tokio::time::timeout(config.drain_deadline, factory_handle)
        .await
        .is_err()
    {
        warn!("drain deadline exceeded, remaining pairs dropped");
    }

    counters.log_summary();
    Ok(())
}

fn push_pid_filter(bpf: &mut Ebpf, pid: u32) -> Result<()> {
    let map = bpf
        .map_mut(socktap_types::MAP_TARGET_PID)
        .ok_or_else(|| anyhow!("kernel map {} not found", socktap_types::MAP_TARGET_PID))?;
    let mut filter: AyaHashMap<_, u32, u32> = AyaHashMap::try_from(map)?;
    filter
        .insert(0, pid, 0)
        .context("pushing target pid to kernel")?;
    info!("kernel pid filter set to {pid}");
    Ok(())
}

fn attach_probes(bpf: &mut Ebpf) -> Result<()> {
    for (prog_name, syscall) in SYSCALL_PROBES {
        let program: &mut KProbe = bpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow!("eBPF program '{prog_name}' not found"))?
            .try_into()?;
        program.load()?;
        program
            .attach(syscall, 0)
            .with_context(|| format!("attaching {prog_name} to {syscall}"))?;
        debug!("attached {prog_name} to {syscall}");
    }
    info!("attached {} syscall probes", SYSCALL_PROBES.len());
    Ok(())
}
