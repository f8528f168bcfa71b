use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, TollgateConfig};
use tollgate::{FixedWindowLimiter, LeakyBucketLimiter, Packet, TokenBucketLimiter};

/// Run admission-control demonstrations against the Tollgate limiters.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (overrides the configuration file)
    #[arg(long, global = true, value_enum)]
    log_format: Option<FormatArg>,

    /// Log filter directive (overrides the configuration file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

impl From<FormatArg> for LogFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Text => LogFormat::Text,
            FormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Concurrent requests with random delays against a fixed window
    FixedWindow {
        /// Number of requests
        #[arg(long, default_value_t = 15)]
        requests: u64,
        /// Requests arrive at a random offset within this many milliseconds
        #[arg(long, default_value_t = 3000)]
        spread_ms: u64,
    },
    /// Evenly spaced calls against a token bucket
    TokenBucket {
        /// Number of calls
        #[arg(long, default_value_t = 10)]
        calls: u64,
        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 150)]
        pause_ms: u64,
    },
    /// Randomly sized packets arriving at a leaky bucket
    LeakyBucket {
        /// Number of packets
        #[arg(long, default_value_t = 20)]
        packets: u64,
        /// Packets arrive at a random offset within this many milliseconds
        #[arg(long, default_value_t = 1500)]
        spread_ms: u64,
        /// Largest packet weight
        #[arg(long, default_value_t = 7)]
        max_weight: u64,
        /// How long to watch the bucket drain, in seconds
        #[arg(long, default_value_t = 15)]
        observe_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig::default(),
    };
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    init_tracing(&config);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::FixedWindow { requests, spread_ms } => {
            run_fixed_window(&config, requests, spread_ms).await
        }
        Command::TokenBucket { calls, pause_ms } => run_token_bucket(&config, calls, pause_ms).await,
        Command::LeakyBucket {
            packets,
            spread_ms,
            max_weight,
            observe_secs,
        } => run_leaky_bucket(&config, packets, spread_ms, max_weight, observe_secs).await,
    }
}

fn init_tracing(config: &TollgateConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_fixed_window(config: &TollgateConfig, requests: u64, spread_ms: u64) -> anyhow::Result<()> {
    let limiter = Arc::new(FixedWindowLimiter::from_config(&config.fixed_window)?);
    info!(
        window_ms = config.fixed_window.window_ms,
        max_requests = config.fixed_window.max_requests,
        "Running fixed window demo"
    );

    let mut rng = rand::thread_rng();
    let handles: Vec<_> = (1..=requests)
        .map(|id| {
            let delay = Duration::from_millis(rng.gen_range(0..=spread_ms));
            let limiter = limiter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if limiter.allow() {
                    info!(id = id, "Request processed");
                } else {
                    info!(id = id, "Request limited");
                }
            })
        })
        .collect();

    tokio::select! {
        _ = futures::future::join_all(handles) => {}
        _ = shutdown_signal() => {}
    }

    print_snapshot(&limiter.snapshot())
}

async fn run_token_bucket(config: &TollgateConfig, calls: u64, pause_ms: u64) -> anyhow::Result<()> {
    let bucket = TokenBucketLimiter::from_config(&config.token_bucket)?;
    info!(
        capacity = config.token_bucket.capacity,
        tokens_per_refill = config.token_bucket.tokens_per_refill,
        refill_interval_ms = config.token_bucket.refill_interval_ms,
        "Running token bucket demo"
    );

    let workload = async {
        for call in 1..=calls {
            if bucket.allow() {
                info!(call = call, remaining = bucket.tokens(), "Token taken");
            } else {
                info!(call = call, "Not enough tokens");
            }
            tokio::time::sleep(Duration::from_millis(pause_ms)).await;
        }
    };

    tokio::select! {
        _ = workload => {}
        _ = shutdown_signal() => {}
    }

    let snapshot = bucket.snapshot();
    bucket.shutdown().await?;
    print_snapshot(&snapshot)
}

async fn run_leaky_bucket(
    config: &TollgateConfig,
    packets: u64,
    spread_ms: u64,
    max_weight: u64,
    observe_secs: u64,
) -> anyhow::Result<()> {
    let max_weight = NonZeroU64::new(max_weight)
        .ok_or_else(|| anyhow::anyhow!("max-weight must be greater than zero"))?;
    let bucket = Arc::new(LeakyBucketLimiter::from_config(&config.leaky_bucket)?);
    info!(
        capacity = config.leaky_bucket.capacity,
        leak_per_tick = config.leaky_bucket.leak_per_tick,
        tick_interval_ms = config.leaky_bucket.tick_interval_ms,
        "Running leaky bucket demo"
    );

    let mut transmitted = bucket.transmissions();
    let reporter = tokio::spawn(async move {
        while let Some(packet) = transmitted.recv().await {
            info!(id = packet.id, weight = packet.weight(), "Packet transmitted");
        }
    });

    let mut rng = rand::thread_rng();
    for id in 1..=packets {
        let delay = Duration::from_millis(rng.gen_range(0..=spread_ms));
        let weight = NonZeroU64::new(rng.gen_range(1..=max_weight.get())).unwrap_or(max_weight);
        let bucket = bucket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if bucket.enqueue(Packet::new(id, weight)) {
                info!(id = id, weight = weight.get(), "Packet added to the bucket");
            } else {
                info!(id = id, weight = weight.get(), "Bucket is full, packet rejected");
            }
        });
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(observe_secs)) => {}
        _ = shutdown_signal() => {}
    }

    bucket.stop();
    info!("Transmission stopped");
    let snapshot = bucket.snapshot();
    match Arc::try_unwrap(bucket) {
        Ok(bucket) => bucket.shutdown().await?,
        Err(_) => warn!("Packets still in flight; leaving the drain task to exit on drop"),
    }
    reporter.abort();

    print_snapshot(&snapshot)
}

fn print_snapshot<T: Serialize>(snapshot: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping early");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping early");
        }
    }
}
