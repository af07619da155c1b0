use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use prometheus::{Encoder, TextEncoder};
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LimiterConfig, LogFormat, LoggingConfig, Strategy, TurnstileConfig};
use turnstile::metrics::PrometheusMetrics;
use turnstile::ratelimit::{Decision, Limiter, RateLimiter};

#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Drive a rate limiter from the command line")]
struct Cli {
    /// YAML configuration file; TURNSTILE__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// fixed_window, sliding_window, token_bucket or leaky_bucket
    #[arg(long, global = true)]
    strategy: Option<Strategy>,

    /// Maximum admissions per window
    #[arg(long, global = true)]
    limit: Option<u64>,

    /// Window length in milliseconds
    #[arg(long, global = true)]
    window_ms: Option<u64>,

    /// Redis connection string; omit for the in-process backend
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Allow requests when the backend is unavailable
    #[arg(long, global = true)]
    fail_open: bool,

    /// Log output format
    #[arg(long, global = true, value_parser = ["text", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send sequential requests for one key and print each decision
    Check {
        #[arg(long, default_value = "demo")]
        key: String,

        #[arg(long, default_value_t = 10)]
        requests: u32,

        /// Pause between requests
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },

    /// Hammer the limiter from concurrent workers and print a JSON report
    Load {
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Requests per worker
        #[arg(long, default_value_t = 1000)]
        requests: u32,

        /// Number of distinct keys, chosen at random per request
        #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u32).range(1..))]
        keys: u32,

        /// Print the Prometheus exposition after the report
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Debug, Default)]
struct WorkerStats {
    allowed: u64,
    denied: u64,
    degraded: u64,
}

impl WorkerStats {
    fn record(&mut self, decision: &Decision) {
        if decision.is_allowed() {
            self.allowed += 1;
        } else {
            self.denied += 1;
        }
        if decision.is_degraded() {
            self.degraded += 1;
        }
    }
}

#[derive(Debug, Serialize)]
struct LoadReport {
    strategy: Strategy,
    backend: &'static str,
    workers: usize,
    requests: u64,
    allowed: u64,
    denied: u64,
    degraded: u64,
    elapsed_ms: u64,
    requests_per_second: f64,
    interrupted: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    init_tracing(&config.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Check {
            key,
            requests,
            interval_ms,
        } => {
            let limiter = Arc::new(RateLimiter::from_config(config.limiter)?);
            let interval = Duration::from_millis(interval_ms);
            tokio::task::spawn_blocking(move || run_check(&limiter, &key, requests, interval))
                .await?;
        }
        Command::Load {
            workers,
            requests,
            keys,
            metrics,
        } => {
            let registry = prometheus::Registry::new();
            let mut builder = RateLimiter::builder(config.limiter);
            if metrics {
                let sink = PrometheusMetrics::new("turnstile", "limiter")?;
                sink.register(&registry)?;
                builder = builder.metrics(Arc::new(sink));
            }
            let limiter = Arc::new(builder.build()?);

            let report = run_load(limiter, workers, requests, keys).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if metrics {
                let mut buffer = Vec::new();
                TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
                println!("{}", String::from_utf8(buffer)?);
            }
        }
    }

    info!("Turnstile stopped");
    Ok(())
}

/// Layer command line flags over the file (or built-in defaults).
fn resolve_config(cli: &Cli) -> anyhow::Result<TurnstileConfig> {
    let mut config = match &cli.config {
        Some(path) => TurnstileConfig::load(path)?,
        None => TurnstileConfig {
            limiter: LimiterConfig::new(Strategy::TokenBucket, 10, Duration::from_secs(1)),
            logging: LoggingConfig::default(),
        },
    };

    let limiter = &mut config.limiter;
    if let Some(strategy) = cli.strategy {
        limiter.strategy = strategy;
    }
    if let Some(limit) = cli.limit {
        limiter.limit = limit;
    }
    if let Some(window_ms) = cli.window_ms {
        limiter.window_ms = window_ms;
    }
    if let Some(url) = &cli.backend_url {
        limiter.backend_url = Some(url.clone());
    }
    if cli.fail_open {
        limiter.fail_open = true;
    }
    match cli.log_format.as_deref() {
        Some("json") => config.logging.format = LogFormat::Json,
        Some("text") => config.logging.format = LogFormat::Text,
        _ => {}
    }

    Ok(config)
}

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn run_check(limiter: &RateLimiter, key: &str, requests: u32, interval: Duration) {
    for i in 1..=requests {
        let decision = limiter.allow(key);
        match decision.error() {
            Some(err) => println!(
                "Req {} - key={} allowed={} error={}",
                i,
                key,
                decision.is_allowed(),
                err
            ),
            None => println!("Req {} - key={} allowed={}", i, key, decision.is_allowed()),
        }
        if !interval.is_zero() && i < requests {
            std::thread::sleep(interval);
        }
    }
}

async fn run_load(
    limiter: Arc<RateLimiter>,
    workers: usize,
    requests: u32,
    keys: u32,
) -> anyhow::Result<LoadReport> {
    let stop = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    info!(workers, requests, keys, "Starting load");

    let tasks = (0..workers).map(|_| {
        let limiter = limiter.clone();
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || {
            let mut rng = rand::thread_rng();
            let mut stats = WorkerStats::default();
            for _ in 0..requests {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let key = format!("key-{}", rng.gen_range(0..keys));
                stats.record(&limiter.allow(&key));
            }
            stats
        })
    });

    let all = futures::future::join_all(tasks);
    tokio::pin!(all);
    let mut interrupted = false;
    let results = tokio::select! {
        results = &mut all => results,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping workers");
            interrupted = true;
            stop.store(true, Ordering::Relaxed);
            all.await
        }
    };

    let mut total = WorkerStats::default();
    for result in results {
        let stats = result?;
        total.allowed += stats.allowed;
        total.denied += stats.denied;
        total.degraded += stats.degraded;
    }

    let elapsed = started.elapsed();
    let requests = total.allowed + total.denied;
    Ok(LoadReport {
        strategy: limiter.strategy(),
        backend: limiter.storage().name(),
        workers,
        requests,
        allowed: total.allowed,
        denied: total.denied,
        degraded: total.degraded,
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        requests_per_second: requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        interrupted,
    })
}
