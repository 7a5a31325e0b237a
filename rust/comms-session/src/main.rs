//! Communicator Session Runner
//!
//! This binary starts an in-process cluster, brings up one communicator
//! session across all of its workers, runs the collective checks and tears
//! the session down again.
//!
//! # Usage
//!
//! ```bash
//! # Four workers, collective substrate only
//! comms-session
//!
//! # Eight workers with the direct transport
//! comms-session --workers 8 --p2p
//!
//! # Start with configuration file
//! comms-session --config comms.toml
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comms_core::{Cluster, CommsConfig, DefaultComms, LocalClusterBuilder};

/// Communicator session runner
#[derive(Parser, Debug)]
#[command(name = "comms-session")]
#[command(about = "Bootstrap a communicator session on a local cluster and verify it")]
struct Args {
    /// Number of workers (overrides cluster.workers)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Request the direct point-to-point transport
    #[arg(long)]
    p2p: bool,

    /// Send/recv trials per worker
    #[arg(long, default_value = "3")]
    n_trials: u32,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Bootstrap timeout in milliseconds (overrides session.bootstrap_timeout_ms)
    #[arg(long)]
    bootstrap_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration, then apply command-line overrides
    let mut config = match &args.config {
        Some(path) => CommsConfig::from_file(path)?,
        None => CommsConfig::default(),
    }
    .with_env_overrides();

    if let Some(workers) = args.workers {
        config.cluster.workers = workers;
    }
    if let Some(timeout) = args.bootstrap_timeout_ms {
        config.session.bootstrap_timeout_ms = timeout;
    }
    config.session.p2p |= args.p2p;
    config.validate()?;

    tracing::info!("Starting communicator session");
    tracing::info!("  Workers: {}", config.cluster.workers);
    tracing::info!("  P2P requested: {}", config.session.p2p);
    tracing::info!("  Bootstrap timeout: {}ms", config.session.bootstrap_timeout_ms);

    let cluster = Arc::new(LocalClusterBuilder::from_config(&config).build());
    let mut defaults = DefaultComms::with_config(config.session.clone());

    let outcome = run(&mut defaults, cluster.clone(), args.n_trials).await;

    if let Err(e) = defaults.destroy_all().await {
        tracing::warn!("Teardown incomplete: {}", e);
    }
    cluster.shutdown().await;

    outcome
}

async fn run(
    defaults: &mut DefaultComms,
    cluster: Arc<dyn Cluster>,
    n_trials: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let shared = defaults.get_or_init(cluster).await?;
    let context = shared.lock().await;

    tracing::info!("Session {} ready", context.session_id());
    tracing::info!("  Collective initialized: {}", context.collective_initialized());
    tracing::info!("  P2P initialized: {}", context.p2p_initialized());
    for (rank, handle) in context.lookup_handles().await?.iter().enumerate() {
        tracing::info!(
            "  Rank {} on {} (size {}, p2p: {})",
            rank,
            context.worker_addresses()[rank],
            handle.size,
            handle.p2p
        );
    }

    let allreduce = context.allreduce().await?;
    if !allreduce.iter().all(|ok| *ok) {
        return Err(format!("allreduce check failed: {:?}", allreduce).into());
    }
    tracing::info!("Allreduce check passed on {} workers", allreduce.len());

    if context.p2p_initialized() {
        let send_recv = context.send_recv(n_trials).await?;
        if !send_recv.iter().all(|ok| *ok) {
            return Err(format!("send/recv check failed: {:?}", send_recv).into());
        }
        tracing::info!(
            "Send/recv check passed on {} workers ({} trials)",
            send_recv.len(),
            n_trials
        );
    } else if context.p2p_requested() {
        tracing::warn!("Direct transport unavailable, skipping send/recv check");
    }

    Ok(())
}
