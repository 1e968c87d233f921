//! conduit-worker - child process serving calls for a conduit worker pool.
//!
//! Talks to its parent over stdin/stdout, so all logging goes to stderr.

use std::time::Duration;

use anyhow::Context;
use conduit_core::launcher::{WORKER_ID_ENV, is_worker_process};
use conduit_core::process::child::ParentHandle;
use conduit_core::{LocalInterface, MasterOptions, MasterProcess};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Methods served to the parent.
fn interface() -> LocalInterface {
    LocalInterface::new()
        .method("decrement", |n: i64| async move { Ok::<_, String>(n - 1) })
        .raw_method("echo", |value| async move { Ok::<_, Value>(value) })
        .method("sleep", |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
        .method("fail", |message: String| async move { Err::<(), _>(message) })
        .method("pid", |_: ()| async { Ok::<_, String>(std::process::id()) })
}

/// `RUST_LOG` when set, otherwise warnings only.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    // The stdin reader may still be parked in a blocking read.
    std::process::exit(code);
}

async fn run() -> anyhow::Result<()> {
    if !is_worker_process() {
        anyhow::bail!("conduit-worker must be started by a conduit worker pool");
    }

    let endpoint = ParentHandle::from_stdio().context("Failed to attach to parent process")?;
    let master = MasterProcess::start(
        endpoint,
        MasterOptions {
            local: interface(),
            ..Default::default()
        },
    )
    .await
    .context("Failed to announce readiness")?;

    tracing::info!(
        ordinal = ?std::env::var(WORKER_ID_ENV).ok(),
        pid = std::process::id(),
        "Worker serving"
    );

    tokio::select! {
        _ = master.closed() => tracing::debug!("Parent went away"),
        _ = tokio::signal::ctrl_c() => master.shutdown().await,
    }
    Ok(())
}
