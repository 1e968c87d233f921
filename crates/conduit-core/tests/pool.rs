//! WorkerPool behaviour with workers served in-process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::process::memory;
use conduit_core::{
    DisconnectReason, Endpoint, Envelope, Error, Launcher, LocalInterface, MasterOptions,
    MasterProcess, ProcessHandle, RemoteInterface, Result, Signal, WorkerOptions, WorkerPool,
    WorkerPoolConfig,
};
use futures::future::BoxFuture;
use serde_json::json;

// =============================================================================
// Test Helpers
// =============================================================================

/// Serve a worker from a task in this process and return the parent's end.
fn serve_in_process() -> Endpoint {
    let (child, parent) = memory::pair();
    tokio::spawn(async move {
        let options = MasterOptions {
            local: LocalInterface::new()
                .method("decrement", |n: i64| async move { Ok::<_, String>(n - 1) })
                .method("hold", |ms: u64| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, String>(ms)
                }),
            ..Default::default()
        };
        if let Ok(master) = MasterProcess::start(child, options).await {
            master.closed().await;
        }
    });
    parent
}

struct InProcessLauncher;

impl Launcher for InProcessLauncher {
    fn launch(&self, _ordinal: u64) -> Result<Endpoint> {
        Ok(serve_in_process())
    }
}

/// A process that takes `delay` to go away after being told to.
struct SlowExit {
    inner: Arc<dyn ProcessHandle>,
    delay: Duration,
}

impl ProcessHandle for SlowExit {
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        self.inner.send(envelope)
    }

    fn disconnect(&self, signal: Signal) {
        let inner = Arc::clone(&self.inner);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.disconnect(signal);
        });
    }

    fn pid(&self) -> Option<u32> {
        self.inner.pid()
    }
}

struct SlowExitLauncher(Duration);

impl Launcher for SlowExitLauncher {
    fn launch(&self, _ordinal: u64) -> Result<Endpoint> {
        let Endpoint { handle, events } = serve_in_process();
        Ok(Endpoint {
            handle: Arc::new(SlowExit {
                inner: handle,
                delay: self.0,
            }),
            events,
        })
    }
}

/// Refuses the launches with the listed ordinals.
struct FlakyLauncher(Vec<u64>);

impl Launcher for FlakyLauncher {
    fn launch(&self, ordinal: u64) -> Result<Endpoint> {
        if self.0.contains(&ordinal) {
            return Err(Error::Process(format!("launch {} refused", ordinal)));
        }
        Ok(serve_in_process())
    }
}

fn pool_with(
    launcher: impl Launcher,
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Duration,
) -> WorkerPool {
    WorkerPool::new(
        WorkerPoolConfig {
            min_workers,
            max_workers,
            idle_timeout,
        },
        launcher,
        WorkerOptions {
            remote: RemoteInterface::new(["decrement", "hold"]),
            ..Default::default()
        },
    )
    .unwrap()
}

fn pool(min_workers: usize, max_workers: usize, idle_timeout: Duration) -> WorkerPool {
    pool_with(InProcessLauncher, min_workers, max_workers, idle_timeout)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_idle(pool: &WorkerPool) {
    wait_until("workers to connect", || pool.stats().total_tasks == 0).await;
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_get_worker_spawns_until_max_then_prefers_idle() {
    let pool = pool(0, 3, Duration::from_secs(30));

    let workers: Vec<_> = (0..3).map(|_| pool.get_worker().unwrap()).collect();
    let ids: HashSet<u64> = workers.iter().map(|w| w.id()).collect();
    assert_eq!(ids.len(), 3);

    for worker in &workers {
        worker.remote().await.unwrap();
    }
    wait_idle(&pool).await;

    // Keep the last two busy; the first one is the only idle worker.
    let busy: Vec<_> = workers[1..]
        .iter()
        .map(|worker| {
            let worker = worker.clone();
            tokio::spawn(async move { worker.remote().await?.call_value("hold", json!(300)).await })
        })
        .collect();
    wait_until("two busy workers", || pool.stats().busy_workers == 2).await;

    assert_eq!(pool.get_worker().unwrap().id(), workers[0].id());
    assert_eq!(pool.stats().spawned, 3);

    for call in busy {
        assert_eq!(call.await.unwrap().unwrap(), json!(300));
    }
    pool.quit().await;
}

#[tokio::test]
async fn test_full_pool_reuses_least_loaded_worker() {
    let pool = pool(0, 1, Duration::from_secs(30));

    let first = pool.get_worker().unwrap();
    let second = pool.get_worker().unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(pool.len(), 1);

    let remote = second.remote().await.unwrap();
    assert_eq!(remote.call::<_, i64>("decrement", &5).await.unwrap(), 4);
    pool.quit().await;
}

#[tokio::test]
async fn test_floor_is_replenished_after_disconnects() {
    let pool = pool(2, 4, Duration::from_secs(30));
    assert_eq!(pool.len(), 2);

    for round in 1..=3u64 {
        wait_idle(&pool).await;
        let victim = pool.get_worker().unwrap();
        assert_eq!(victim.kill(Signal::Kill).await, DisconnectReason::Killed);

        wait_until("replacement worker", || {
            let stats = pool.stats();
            stats.spawned == 2 + round && stats.live_workers == 2
        })
        .await;
    }

    // Replacements are usable.
    wait_idle(&pool).await;
    let worker = pool.get_worker().unwrap();
    let remote = worker.remote().await.unwrap();
    assert_eq!(remote.call::<_, i64>("decrement", &1).await.unwrap(), 0);
    assert_eq!(pool.stats().retired, 0);
    pool.quit().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_worker_above_floor_is_retired() {
    let pool = pool(0, 2, Duration::from_millis(100));

    let worker = pool.get_worker().unwrap();
    let remote = worker.remote().await.unwrap();
    assert_eq!(remote.call::<_, i64>("decrement", &5).await.unwrap(), 4);

    wait_until("idle retirement", || pool.stats().retired == 1).await;
    assert!(worker.is_disconnected());
    assert!(pool.is_empty());
    assert_eq!(pool.stats().spawned, 1);
}

#[tokio::test(start_paused = true)]
async fn test_busy_worker_is_not_retired() {
    let pool = pool(0, 2, Duration::from_millis(100));

    let worker = pool.get_worker().unwrap();
    let remote = worker.remote().await.unwrap();
    assert_eq!(remote.call::<_, u64>("hold", &1_000).await.unwrap(), 1_000);
    assert!(!worker.is_disconnected());

    wait_until("idle retirement", || pool.stats().retired == 1).await;
    assert!(pool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retiring_worker_keeps_its_slot_until_it_exits() {
    let pool = pool_with(
        SlowExitLauncher(Duration::from_secs(1)),
        0,
        1,
        Duration::from_millis(100),
    );

    let first = pool.get_worker().unwrap();
    first.remote().await.unwrap();
    wait_until("retirement to start", || pool.stats().retiring_workers == 1).await;
    assert!(!first.is_disconnected());

    // The only slot is still taken by a live process.
    assert!(matches!(pool.get_worker(), Err(Error::PoolFull(1))));
    assert_eq!(pool.stats().spawned, 1);

    wait_until("retired worker to exit", || pool.stats().retired == 1).await;
    assert!(first.is_disconnected());

    let second = pool.get_worker().unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(pool.stats().spawned, 2);
    assert_eq!(
        second.remote().await.unwrap().call::<_, i64>("decrement", &3).await.unwrap(),
        2
    );
    pool.quit().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_replenish_is_retried() {
    // Ordinal 0 is the initial worker; its first two replacements fail.
    let pool = pool_with(FlakyLauncher(vec![1, 2]), 1, 2, Duration::from_secs(30));
    wait_idle(&pool).await;

    let victim = pool.get_worker().unwrap();
    victim.kill(Signal::Term).await;

    wait_until("floor to be restored", || {
        let stats = pool.stats();
        stats.live_workers == 1 && stats.spawned == 2
    })
    .await;

    wait_idle(&pool).await;
    let worker = pool.get_worker().unwrap();
    assert_ne!(worker.id(), victim.id());
    let remote = worker.remote().await.unwrap();
    assert_eq!(remote.call::<_, i64>("decrement", &1).await.unwrap(), 0);
    pool.quit().await;
}

#[tokio::test(start_paused = true)]
async fn test_floor_workers_are_never_retired() {
    let pool = pool(1, 2, Duration::from_millis(50));
    wait_idle(&pool).await;

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(pool.len(), 1);
    assert_eq!(pool.stats().retired, 0);
}

#[tokio::test]
async fn test_quit_is_idempotent_and_stops_respawning() {
    let pool = pool(2, 4, Duration::from_secs(30));
    wait_idle(&pool).await;
    let worker = pool.get_worker().unwrap();

    tokio::join!(pool.quit(), pool.quit());
    pool.quit().await;

    assert!(pool.is_empty());
    assert!(pool.is_quitting());
    assert!(worker.is_disconnected());
    assert!(matches!(pool.get_worker(), Err(Error::PoolClosed)));

    // Disconnects seen after quit do not bring workers back.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats().spawned, 2);
    assert!(pool.is_empty());
}
