//! conduit CLI - drive a pool of conduit workers.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use conduit_core::{
    ProcessLauncher, RemoteInterface, WorkerOptions, WorkerPool, WorkerPoolConfig,
    find_worker_binary,
};
use tracing_subscriber::EnvFilter;

/// Methods served by conduit-worker.
const WORKER_METHODS: [&str; 5] = ["decrement", "echo", "sleep", "fail", "pid"];

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Run calls across an elastic pool of worker processes")]
#[command(version)]
struct Cli {
    /// Workers kept alive at all times [env: CONDUIT_MIN_WORKERS]
    #[arg(long)]
    min_workers: Option<usize>,

    /// Upper bound on live workers [env: CONDUIT_MAX_WORKERS]
    #[arg(long)]
    max_workers: Option<usize>,

    /// Idle time before a worker above the floor is retired [env: CONDUIT_IDLE_TIMEOUT_MS]
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Time a call may wait for its acknowledgement
    #[arg(long, default_value = "2000")]
    call_timeout_ms: u64,

    /// Number of concurrent calls to issue
    #[arg(long, default_value = "4")]
    calls: usize,

    /// Argument of the first `decrement` call; each later call adds one
    #[arg(long, default_value = "10", allow_hyphen_values = true)]
    value: i64,

    /// Path to the conduit-worker binary
    #[arg(long, env = "CONDUIT_WORKER_PATH")]
    worker: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Environment config overridden by flags.
    fn pool_config(&self) -> conduit_core::Result<WorkerPoolConfig> {
        let mut config = WorkerPoolConfig::from_env()?;
        if let Some(min) = self.min_workers {
            config.min_workers = min;
        }
        if let Some(max) = self.max_workers {
            config.max_workers = max;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose, rust_log.as_deref()))
        .with_target(false)
        .init();

    let config = cli.pool_config()?;
    let program = match &cli.worker {
        Some(path) => path.clone(),
        None => find_worker_binary()?,
    };
    tracing::debug!(program = %program.display(), ?config, "Starting worker pool");

    let options = WorkerOptions {
        remote: RemoteInterface::new(WORKER_METHODS),
        call_timeout: Duration::from_millis(cli.call_timeout_ms),
        ..Default::default()
    };
    let pool = WorkerPool::new(config, ProcessLauncher::new(program), options)
        .context("Failed to start worker pool")?;

    let outcome = run_calls(&pool, cli.calls, cli.value).await;
    pool.quit().await;
    outcome
}

/// `RUST_LOG` when set, otherwise warnings only. `--verbose` adds debug.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let from_env = rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok());
    match (from_env, verbose) {
        (Some(filter), true) => filter.add_directive(tracing::Level::DEBUG.into()),
        (Some(filter), false) => filter,
        (None, true) => EnvFilter::new("debug"),
        (None, false) => EnvFilter::new("warn"),
    }
}

/// Issue `calls` concurrent `decrement` calls and report each result.
async fn run_calls(pool: &WorkerPool, calls: usize, value: i64) -> anyhow::Result<()> {
    let started = Instant::now();

    let results = futures::future::join_all((0..calls).map(|i| async move {
        let argument = value + i as i64;
        let worker = pool.get_worker()?;
        let remote = worker.remote().await?;
        let result: i64 = remote.call("decrement", &argument).await?;
        Ok::<_, conduit_core::Error>((argument, result, worker.id(), worker.pid()))
    }))
    .await;

    let mut failures = 0;
    for (i, outcome) in results.into_iter().enumerate() {
        match outcome {
            Ok((argument, result, worker, pid)) => {
                let pid = pid.map_or_else(|| "?".to_string(), |p| p.to_string());
                println!("call {i}: decrement({argument}) = {result} [worker {worker}, pid {pid}]");
            }
            Err(e) => {
                failures += 1;
                eprintln!("call {i}: failed: {e}");
            }
        }
    }

    let stats = pool.stats();
    println!(
        "{} calls in {:.2?}: {} workers spawned, {} live, {} retired",
        calls,
        started.elapsed(),
        stats.spawned,
        stats.live_workers,
        stats.retired
    );

    if failures > 0 {
        anyhow::bail!("{} of {} calls failed", failures, calls);
    }
    Ok(())
}
