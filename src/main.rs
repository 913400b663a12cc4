use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use globallock::config::{self, Config};
use globallock::coordination::redis::create_pool;
use globallock::{GlobalLock, MetricsRegistry, RedisLockStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "globallock", about = "Distributed lock client")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/globallock/config.yaml")]
    config: String,

    /// Print the Prometheus text exposition before exiting.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether a resource is currently unclaimed.
    Probe { key: String },
    /// Try once to take the lock and leave the lease to expire.
    Acquire {
        key: String,
        /// Lease duration; defaults to `lock.default_ttl_ms`.
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// Wait for the lock, keep it alive for `hold_ms`, then release it.
    Hold {
        key: String,
        #[arg(long)]
        ttl_ms: Option<u64>,
        #[arg(long, default_value_t = 10_000)]
        hold_ms: u64,
        /// Extension interval; defaults to a third of the TTL.
        #[arg(long)]
        renew_ms: Option<u64>,
    },
}

type Lock = GlobalLock<RedisLockStore>;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn probe(lock: &Lock, key: &str) -> Result<bool> {
    let free = lock.is_free(key).await?;
    println!("{key}: {}", if free { "free" } else { "held" });
    Ok(free)
}

async fn acquire(lock: &Lock, key: &str, ttl: Duration) -> Result<bool> {
    match lock.try_acquire(key, ttl).await? {
        Some(lease) => {
            println!("{key}: acquired token={} ttl_ms={}", lease.token, ttl.as_millis());
            Ok(true)
        }
        None => {
            println!("{key}: busy");
            Ok(false)
        }
    }
}

async fn hold(
    lock: &Lock,
    key: &str,
    ttl: Duration,
    hold_for: Duration,
    renew: Duration,
) -> Result<bool> {
    let lease = lock.acquire(key, ttl).await?;
    println!("{key}: acquired token={}", lease.token);

    let until = tokio::time::sleep(hold_for);
    tokio::pin!(until);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + renew, renew);

    loop {
        tokio::select! {
            () = &mut until => break,
            () = &mut shutdown => break,
            _ = ticker.tick() => {
                if !lock.extend(key, ttl).await? {
                    tracing::warn!(%key, "lease lost while holding");
                    println!("{key}: lost");
                    return Ok(false);
                }
            }
        }
    }

    let released = lock.release(key).await?;
    println!("{key}: {}", if released { "released" } else { "already gone" });
    Ok(released)
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config: Config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    tracing::info!(config_path = %cli.config, "starting globallock");

    // ---- Store ----
    let pool = create_pool(&config.store)
        .await
        .context("failed to set up lock store")?;
    let store = RedisLockStore::new(pool, config.store.max_wait());

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();
    let lock =
        GlobalLock::new(store, config.lock.clone()).with_metrics(Arc::clone(&metrics.metrics));

    let ttl_or_default = |ttl_ms: Option<u64>| {
        ttl_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.lock.default_ttl())
    };

    let ok = match &cli.command {
        Command::Probe { key } => probe(&lock, key).await?,
        Command::Acquire { key, ttl_ms } => acquire(&lock, key, ttl_or_default(*ttl_ms)).await?,
        Command::Hold {
            key,
            ttl_ms,
            hold_ms,
            renew_ms,
        } => {
            let ttl = ttl_or_default(*ttl_ms);
            let renew = renew_ms
                .map(Duration::from_millis)
                .unwrap_or(ttl / 3)
                .max(Duration::from_millis(1));
            hold(&lock, key, ttl, Duration::from_millis(*hold_ms), renew).await?
        }
    };

    if cli.metrics {
        print!("{}", metrics.encode()?);
    }

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
