use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use socktap_agent::{run_agent, AgentConfig};

#[derive(Debug, Parser)]
#[command(name = "socktap")]
#[command(about = "Passive HTTP request/response capture for one process via eBPF syscall probes")]
struct Cli {
    /// PID of the process to observe
    #[arg(short, long)]
    pid: u32,

    /// Path to the pre-compiled eBPF object
    #[arg(long, default_value = socktap_agent::config::DEFAULT_BPF_OBJECT)]
    bpf_object: PathBuf,

    /// Output sink: "stdout", "file:PATH", "webhook:URL"
    #[arg(short, long, default_value = "stdout")]
    output: String,

    /// Stdout format: "text" or "json"
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Cadence of the ready-connection scan, in milliseconds
    #[arg(long, default_value_t = 1000)]
    harvest_interval_ms: u64,

    /// Reap connections idle for longer than this many seconds
    #[arg(long, default_value_t = 60)]
    idle_timeout_secs: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    let config = AgentConfig {
        target_pid: cli.pid,
        bpf_object: cli.bpf_object,
        output: cli.output,
        format: cli.format,
        harvest_interval: Duration::from_millis(cli.harvest_interval_ms),
        idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
        verbose: cli.verbose,
        ..AgentConfig::default()
    };

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    run_agent(config).await
}
