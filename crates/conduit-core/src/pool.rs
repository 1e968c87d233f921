//! Elastic pool of worker processes with least-loaded dispatch.
//!
//! The pool keeps between `min_workers` and `max_workers` workers alive. It
//! tracks in-flight calls per worker from the worker's own task events, so
//! callers only need to use the worker they were handed.
//!
//! A freshly spawned worker starts with a task count of one. The hold is
//! released when the worker connects, so a worker handed out before it is
//! ready cannot be retired as idle in between.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::process::Signal;
use crate::process::worker::{
    DisconnectReason, WorkerEvent, WorkerEvents, WorkerOptions, WorkerProcess,
};

/// Environment variable overriding [`WorkerPoolConfig::min_workers`].
pub const MIN_WORKERS_ENV: &str = "CONDUIT_MIN_WORKERS";
/// Environment variable overriding [`WorkerPoolConfig::max_workers`].
pub const MAX_WORKERS_ENV: &str = "CONDUIT_MAX_WORKERS";
/// Environment variable overriding [`WorkerPoolConfig::idle_timeout`], in ms.
pub const IDLE_TIMEOUT_ENV: &str = "CONDUIT_IDLE_TIMEOUT_MS";

/// Default time an idle worker above the floor is kept alive.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before the pool retries a failed replenishing spawn.
pub const REPLENISH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Sizing and retirement policy of a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Workers kept alive at all times.
    pub min_workers: usize,
    /// Upper bound on live workers.
    pub max_workers: usize,
    /// How long a worker above the floor may stay idle.
    pub idle_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            min_workers: 0,
            max_workers: cpus.max(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl WorkerPoolConfig {
    /// Defaults overridden by `CONDUIT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(MIN_WORKERS_ENV) {
            config.min_workers = parse_var(MIN_WORKERS_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_WORKERS_ENV) {
            config.max_workers = parse_var(MAX_WORKERS_ENV, &value)?;
        }
        if let Some(value) = lookup(IDLE_TIMEOUT_ENV) {
            config.idle_timeout = Duration::from_millis(parse_var(IDLE_TIMEOUT_ENV, &value)?);
        }
        Ok(config)
    }

    /// Check the bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".to_string()));
        }
        if self.min_workers > self.max_workers {
            return Err(Error::Config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{}={:?}: {}", key, value, e)))
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Workers not being retired.
    pub live_workers: usize,
    /// Workers being retired that have not exited yet. They still hold a slot.
    pub retiring_workers: usize,
    /// Workers with at least one task (or still connecting).
    pub busy_workers: usize,
    /// Sum of task counts.
    pub total_tasks: usize,
    /// Workers spawned over the pool's lifetime.
    pub spawned: u64,
    /// Workers retired for idleness.
    pub retired: u64,
}

/// Pool of worker processes. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkerPoolConfig,
    launcher: Box<dyn Launcher>,
    worker_options: WorkerOptions,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    records: Vec<WorkerRecord>,
    quitting: bool,
    retry_timer: Option<JoinHandle<()>>,
    next_ordinal: u64,
    spawned: u64,
    retired: u64,
}

struct WorkerRecord {
    worker: WorkerProcess,
    task_count: usize,
    idle_timer: Option<JoinHandle<()>>,
    retiring: bool,
}

impl PoolState {
    fn live(&self) -> usize {
        self.records.iter().filter(|r| !r.retiring).count()
    }

    fn has_room(&self, max_workers: usize) -> bool {
        self.records.len() < max_workers
    }

    fn record_mut(&mut self, id: u64) -> Option<&mut WorkerRecord> {
        self.records.iter_mut().find(|r| r.worker.id() == id)
    }
}

impl WorkerPool {
    /// Validate `config` and spawn the initial `min_workers`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: WorkerPoolConfig,
        launcher: impl Launcher,
        worker_options: WorkerOptions,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            inner: Arc::new(Inner {
                config,
                launcher: Box::new(launcher),
                worker_options,
                state: Mutex::new(PoolState::default()),
            }),
        };

        {
            let mut state = pool.lock();
            for _ in 0..pool.inner.config.min_workers {
                pool.spawn_worker(&mut state)?;
            }
        }
        tracing::info!(
            min = pool.inner.config.min_workers,
            max = pool.inner.config.max_workers,
            idle_timeout = ?pool.inner.config.idle_timeout,
            "Worker pool started"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Get the least-loaded worker, spawning one if every worker is busy
    /// and the pool has room.
    ///
    /// Workers being retired keep their slot until they exit. If they hold
    /// every slot, this fails with [`Error::PoolFull`].
    pub fn get_worker(&self) -> Result<WorkerProcess> {
        let mut state = self.lock();
        if state.quitting {
            return Err(Error::PoolClosed);
        }

        let least_loaded = state
            .records
            .iter()
            .filter(|r| !r.retiring && !r.worker.is_disconnected())
            .min_by_key(|r| r.task_count)
            .map(|r| (r.worker.clone(), r.task_count));

        let max_workers = self.inner.config.max_workers;
        match least_loaded {
            Some((worker, 0)) => Ok(worker),
            Some((worker, _)) if !state.has_room(max_workers) => Ok(worker),
            None if !state.has_room(max_workers) => Err(Error::PoolFull(max_workers)),
            _ => self.spawn_worker(&mut state),
        }
    }

    /// Kill every worker and stop spawning new ones. Idempotent.
    pub async fn quit(&self) {
        let workers: Vec<WorkerProcess> = {
            let mut state = self.lock();
            state.quitting = true;
            if let Some(timer) = state.retry_timer.take() {
                timer.abort();
            }
            state
                .records
                .drain(..)
                .map(|record| {
                    if let Some(timer) = record.idle_timer {
                        timer.abort();
                    }
                    record.worker
                })
                .collect()
        };

        if !workers.is_empty() {
            tracing::info!(count = workers.len(), "Shutting down worker pool");
        }
        futures::future::join_all(workers.iter().map(|w| w.kill(Signal::Term))).await;
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let state = self.lock();
        WorkerPoolStats {
            live_workers: state.live(),
            retiring_workers: state.records.iter().filter(|r| r.retiring).count(),
            busy_workers: state.records.iter().filter(|r| r.task_count > 0).count(),
            total_tasks: state.records.iter().map(|r| r.task_count).sum(),
            spawned: state.spawned,
            retired: state.retired,
        }
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.lock().live()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_quitting(&self) -> bool {
        self.lock().quitting
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self, state: &mut PoolState) -> Result<WorkerProcess> {
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;

        let endpoint = self.inner.launcher.launch(ordinal)?;
        let (worker, events) = WorkerProcess::start(endpoint, self.inner.worker_options.clone());
        state.records.push(WorkerRecord {
            worker: worker.clone(),
            task_count: 1,
            idle_timer: None,
            retiring: false,
        });
        state.spawned += 1;

        self.watch(worker.id(), events);
        tracing::info!(worker = worker.id(), ordinal, live = state.live(), "Added worker to pool");
        Ok(worker)
    }

    fn watch(&self, id: u64, mut events: WorkerEvents) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let pool = WorkerPool { inner };
                match event {
                    WorkerEvent::TaskStart { .. } => pool.task_started(id),
                    WorkerEvent::Connect | WorkerEvent::TaskEnd { .. } | WorkerEvent::TaskFail { .. } => {
                        pool.task_finished(id);
                    }
                    WorkerEvent::Disconnect { reason } => {
                        pool.on_disconnect(id, reason);
                        return;
                    }
                }
            }
        });
    }

    fn task_started(&self, id: u64) {
        let mut state = self.lock();
        if let Some(record) = state.record_mut(id) {
            record.task_count += 1;
            if let Some(timer) = record.idle_timer.take() {
                timer.abort();
            }
        }
    }

    fn task_finished(&self, id: u64) {
        let mut state = self.lock();
        let above_floor = state.live() > self.inner.config.min_workers;
        let quitting = state.quitting;
        let Some(record) = state.record_mut(id) else {
            return;
        };

        record.task_count = record.task_count.saturating_sub(1);
        if record.task_count == 0 && above_floor && !quitting && record.idle_timer.is_none() {
            record.idle_timer = Some(self.arm_idle_timer(id));
        }
    }

    fn arm_idle_timer(&self, id: u64) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.idle_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let pool = WorkerPool { inner };
            if let Some(worker) = pool.begin_retire(id) {
                tracing::info!(worker = id, ?timeout, "Retiring idle worker");
                worker.kill(Signal::Term).await;
            }
        })
    }

    /// Mark an idle worker as retiring, if it is still idle and above the
    /// floor.
    fn begin_retire(&self, id: u64) -> Option<WorkerProcess> {
        let mut state = self.lock();
        if state.quitting {
            return None;
        }
        let above_floor = state.live() > self.inner.config.min_workers;
        let record = state.record_mut(id)?;
        record.idle_timer = None;
        if record.task_count != 0 || !above_floor {
            return None;
        }
        record.retiring = true;
        Some(record.worker.clone())
    }

    fn on_disconnect(&self, id: u64, reason: DisconnectReason) {
        let mut state = self.lock();
        let Some(index) = state.records.iter().position(|r| r.worker.id() == id) else {
            return;
        };
        let record = state.records.remove(index);
        if let Some(timer) = record.idle_timer {
            timer.abort();
        }

        if record.retiring {
            state.retired += 1;
            tracing::debug!(worker = id, "Retired worker left the pool");
        } else {
            tracing::warn!(worker = id, %reason, "Worker left the pool");
        }

        if !state.quitting {
            self.replenish(&mut state);
        }
    }

    /// Spawn workers until the floor is met again. A failed spawn is
    /// retried after [`REPLENISH_RETRY_DELAY`].
    fn replenish(&self, state: &mut PoolState) {
        let config = &self.inner.config;
        while state.live() < config.min_workers && state.has_room(config.max_workers) {
            if let Err(e) = self.spawn_worker(state) {
                tracing::error!(
                    live = state.live(),
                    min = config.min_workers,
                    "Failed to replenish worker pool: {}",
                    e
                );
                if state.retry_timer.is_none() {
                    state.retry_timer = Some(self.arm_retry_timer());
                }
                return;
            }
        }
    }

    fn arm_retry_timer(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(REPLENISH_RETRY_DELAY).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let pool = WorkerPool { inner };
            let mut state = pool.lock();
            state.retry_timer = None;
            if !state.quitting {
                tracing::debug!("Retrying worker pool replenishment");
                pool.replenish(&mut state);
            }
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Endpoint;
    use std::collections::HashMap;

    struct RefusingLauncher;

    impl Launcher for RefusingLauncher {
        fn launch(&self, _ordinal: u64) -> Result<Endpoint> {
            Err(Error::Process("no workers here".to_string()))
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.min_workers, 0);
        assert!(config.max_workers >= 1);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let zero_max = WorkerPoolConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(matches!(zero_max.validate(), Err(Error::Config(_))));

        let inverted = WorkerPoolConfig {
            min_workers: 3,
            max_workers: 2,
            ..Default::default()
        };
        assert!(matches!(inverted.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (MIN_WORKERS_ENV, "2"),
            (MAX_WORKERS_ENV, " 6 "),
            (IDLE_TIMEOUT_ENV, "250"),
        ]
        .into_iter()
        .collect();

        let config =
            WorkerPoolConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.max_workers, 6);
        assert_eq!(config.idle_timeout, Duration::from_millis(250));

        let err = WorkerPoolConfig::from_lookup(|key| {
            (key == MAX_WORKERS_ENV).then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains(MAX_WORKERS_ENV));
    }

    #[tokio::test]
    async fn test_construction_errors() {
        let config = WorkerPoolConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            WorkerPool::new(config, RefusingLauncher, WorkerOptions::default()),
            Err(Error::Config(_))
        ));

        let config = WorkerPoolConfig {
            min_workers: 1,
            max_workers: 1,
            ..Default::default()
        };
        assert!(matches!(
            WorkerPool::new(config, RefusingLauncher, WorkerOptions::default()),
            Err(Error::Process(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_surfaces_from_get_worker() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::default(),
            RefusingLauncher,
            WorkerOptions::default(),
        )
        .unwrap();

        assert!(matches!(pool.get_worker(), Err(Error::Process(_))));
        assert!(pool.is_empty());

        pool.quit().await;
        assert!(matches!(pool.get_worker(), Err(Error::PoolClosed)));
    }
}
