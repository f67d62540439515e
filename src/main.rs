// swarm-sim: run a simulated multi-seeder download end to end
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarm_scheduler::config::{load_config, SwarmConfig};
use swarm_scheduler::sim::{PeerBehavior, SimulatedSwarm};
use swarm_scheduler::{DownloadDriver, DownloadReport, PeerEvent, Scheduler, SharedScheduler};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "swarm-sim")]
#[command(about = "Simulate a multi-seeder chunk download", long_about = None)]
pub struct CliArgs {
    /// JSON configuration file (scheduler and driver sections)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of chunks in the simulated file
    #[arg(long, default_value = "64")]
    pub chunks: u32,

    /// Chunk size in bytes
    #[arg(long, default_value = "16384")]
    pub chunk_size: u32,

    /// Peers that always serve correct data
    #[arg(long, default_value = "3")]
    pub honest_peers: usize,

    /// Peers that always serve corrupted data
    #[arg(long, default_value = "1")]
    pub corrupt_peers: usize,

    /// Peers that drop connections at random
    #[arg(long, default_value = "1")]
    pub flaky_peers: usize,

    /// Peers that never answer
    #[arg(long, default_value = "0")]
    pub silent_peers: usize,

    /// Drop probability for flaky peers
    #[arg(long, default_value = "0.3")]
    pub flaky_rate: f64,

    /// Simulated per-chunk latency in milliseconds
    #[arg(long, default_value = "20")]
    pub latency_ms: u64,

    /// Concurrency budget per peer
    #[arg(long)]
    pub max_concurrent: Option<u32>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Scheduler poll interval in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Requests produced per poll
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Give up after this long without peers
    #[arg(long)]
    pub stall_timeout_ms: Option<u64>,

    /// Evict peers after this many failures
    #[arg(long)]
    pub max_peer_failures: Option<u32>,

    /// Remove the first honest peer from the swarm after this many milliseconds
    #[arg(long)]
    pub drop_peer_after_ms: Option<u64>,

    /// Reject duplicate outcome reports
    #[arg(long)]
    pub strict: bool,

    /// Seed for file contents and peer behaviour
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("swarm_scheduler={level},swarm_sim={level}")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}

fn resolve_config(args: &CliArgs) -> anyhow::Result<SwarmConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => SwarmConfig::default(),
    };
    if let Some(v) = args.max_concurrent {
        config.scheduler.default_max_concurrent = v;
    }
    if let Some(v) = args.timeout_ms {
        config.scheduler.chunk_timeout_ms = v;
    }
    if args.strict {
        config.scheduler.strict_outcomes = true;
    }
    if let Some(v) = args.poll_interval_ms {
        config.driver.poll_interval_ms = v;
    }
    if let Some(v) = args.batch_size {
        config.driver.batch_size = v;
    }
    if let Some(v) = args.stall_timeout_ms {
        config.driver.stall_timeout_ms = v;
    }
    if args.max_peer_failures.is_some() {
        config.driver.max_peer_failures = args.max_peer_failures;
    }
    config.scheduler = config.scheduler.normalized();
    Ok(config)
}

fn build_swarm(args: &CliArgs) -> (SimulatedSwarm, Vec<String>) {
    let file_len = args.chunks as usize * args.chunk_size as usize;
    let data = SimulatedSwarm::random_file(file_len, args.seed);
    let swarm = SimulatedSwarm::new(data, args.chunk_size, args.seed);

    let groups = [
        ("honest", args.honest_peers, PeerBehavior::Honest),
        ("corrupt", args.corrupt_peers, PeerBehavior::Corrupting),
        (
            "flaky",
            args.flaky_peers,
            PeerBehavior::Flaky {
                failure_rate: args.flaky_rate,
            },
        ),
        ("silent", args.silent_peers, PeerBehavior::Unresponsive),
    ];

    let mut peer_ids = Vec::new();
    for (prefix, count, behavior) in groups {
        for n in 0..count {
            let peer_id = format!("{prefix}-{n}");
            swarm.add_peer(peer_id.clone(), behavior, args.latency_ms);
            peer_ids.push(peer_id);
        }
    }
    (swarm, peer_ids)
}

fn print_summary(report: &DownloadReport) {
    println!("{}", "Download complete".green().bold());
    println!(
        "  {} chunks, {} bytes in {} ms",
        report.completed_chunks, report.total_bytes, report.elapsed_ms
    );
    println!(
        "  requests: {}  verified: {}  corrupted: {}  dropped: {}  stale: {}",
        report.requests_issued,
        report.verified_reports,
        report.corrupted_reports.to_string().yellow(),
        report.connection_failures.to_string().yellow(),
        report.stale_reports
    );
    if !report.evicted_peers.is_empty() {
        println!("  evicted: {}", report.evicted_peers.join(", ").red());
    }
    println!("{}", "Peers".bold());
    for peer in &report.peers {
        println!(
            "  {:<12} avg {:>8.1} ms  failures {:>3}  {}",
            peer.peer_id,
            peer.avg_response_time_ms,
            peer.failure_count,
            if peer.available { "available".normal() } else { "unavailable".red() }
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_level);

    let config = resolve_config(&args)?;
    info!("Configuration: {:?}", config);

    let (swarm, peer_ids) = build_swarm(&args);
    let manifest = swarm.manifest()?;
    let swarm = Arc::new(swarm);

    let mut scheduler = Scheduler::new(config.scheduler.clone());
    scheduler.start_session(manifest)?;
    let shared = SharedScheduler::new(scheduler);

    // Peers arrive through the discovery feed, the way a DHT lookup would
    // deliver them.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    for peer_id in &peer_ids {
        let _ = events_tx.send(PeerEvent::Discovered {
            peer_id: peer_id.clone(),
            max_concurrent: None,
        });
    }

    if let (Some(delay), Some(first)) = (args.drop_peer_after_ms, peer_ids.first().cloned()) {
        let swarm = Arc::clone(&swarm);
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            swarm.remove_peer(&first);
            info!(peer_id = %first, "Simulated peer left the swarm");
            let _ = events_tx.send(PeerEvent::Gone { peer_id: first });
        });
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let driver = DownloadDriver::new(shared, Arc::clone(&swarm), config.driver.clone());
    match driver.run(Some(events_rx), cancel).await {
        Ok(report) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
            Ok(())
        }
        Err(err) => {
            error!("Download failed: {}", err);
            let snapshot = driver.scheduler().snapshot();
            eprintln!(
                "{} {} ({}/{} chunks)",
                "Download failed:".red().bold(),
                err,
                snapshot.completed_chunks,
                snapshot.total_chunks
            );
            Err(err.into())
        }
    }
}
