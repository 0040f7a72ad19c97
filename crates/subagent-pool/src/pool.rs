//! Pool (component C5): owns workers, admits/acquires/releases, runs
//! cleanup and health, performs graceful shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use subagent_protocol::InjectionSanitizer;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::PoolConfig;
use crate::container::ContainerAdapter;
use crate::error::PoolError;
use crate::rate_limiter::RateLimiter;
use crate::worker::{Worker, WorkerStatus};

const CLEANUP_TICK: Duration = Duration::from_secs(10);

/// Read-only metrics snapshot, the seam a Prometheus exporter would read
/// from (Prometheus wiring itself is out of scope per spec §1).
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub queue_full_hits: u64,
    pub recreations: u64,
    pub oom_kills: u64,
}

#[derive(Default)]
struct Counters {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
    queue_full_hits: AtomicU64,
    recreations: AtomicU64,
    oom_kills: AtomicU64,
}

/// Health status of one worker, as returned by [`Pool::health_check`].
#[derive(Debug, Clone)]
pub struct WorkerHealth {
    pub id: String,
    pub healthy: bool,
    pub last_check: Instant,
    pub error: Option<String>,
    pub oom_killed: bool,
}

pub struct Pool {
    pub(crate) config: PoolConfig,
    pub(crate) adapter: Arc<dyn ContainerAdapter>,
    workers: RwLock<Vec<Arc<Worker>>>,
    pub(crate) draining: AtomicBool,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) sanitizer: InjectionSanitizer,
    counters: Counters,
    next_worker_id: AtomicU64,
    cleanup_cancel: watch::Sender<bool>,
    cleanup_handle: AsyncMutex<Option<JoinHandle<()>>>,
    health_in_progress: AtomicBool,
}

impl Pool {
    /// Pulls the image per policy, creates and starts `container_count`
    /// workers (on-demand mode, `container_count == 0`, pre-creates none),
    /// and spawns the 10 s cleanup fiber. On partial startup failure, makes
    /// a best-effort attempt to stop and remove any workers already
    /// created before returning the error.
    pub async fn start(config: PoolConfig, adapter: Arc<dyn ContainerAdapter>) -> Result<Arc<Self>, PoolError> {
        adapter.pull_image(&config).await?;

        let (cleanup_cancel, cleanup_rx) = watch::channel(false);
        let pool = Arc::new(Self {
            rate_limiter: RateLimiter::new(config.max_tasks_per_minute),
            breaker: CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_timeout()),
            sanitizer: InjectionSanitizer::default(),
            workers: RwLock::new(Vec::new()),
            draining: AtomicBool::new(false),
            counters: Counters::default(),
            next_worker_id: AtomicU64::new(1),
            cleanup_cancel,
            cleanup_handle: AsyncMutex::new(None),
            health_in_progress: AtomicBool::new(false),
            config,
            adapter,
        });

        let mut created = Vec::new();
        for _ in 0..pool.config.container_count {
            match pool.create_worker().await {
                Ok(worker) => created.push(worker),
                Err(e) => {
                    for worker in &created {
                        let _ = pool.adapter.stop_container(&worker.container_id, Some(Duration::from_secs(5))).await;
                        let _ = pool.adapter.remove_container(&worker.container_id).await;
                    }
                    return Err(PoolError::Adapter(e));
                }
            }
        }
        *pool.workers.write().await = created;

        let cleanup_pool = pool.clone();
        let handle = tokio::spawn(cleanup_fiber(cleanup_pool, cleanup_rx));
        *pool.cleanup_handle.lock().await = Some(handle);

        Ok(pool)
    }

    async fn create_worker(&self) -> Result<Arc<Worker>, crate::error::AdapterError> {
        let container_id = self.adapter.create_container(&self.config).await?;
        self.adapter.start_container(&container_id).await?;
        let id = format!("worker-{}", self.next_worker_id.fetch_add(1, Ordering::SeqCst));
        Worker::attach(
            id,
            container_id,
            self.adapter.clone(),
            self.config.max_pending_per_container,
            self.config.inspect_ttl(),
        )
        .await
    }

    /// Scans workers in insertion order for the first `Idle` worker that
    /// passes a cached `IsRunning` check; creates a fresh one if none
    /// qualify. Worker creation happens without the pool lock held.
    pub async fn acquire(&self) -> Result<Arc<Worker>, PoolError> {
        {
            let workers = self.workers.read().await;
            for worker in workers.iter() {
                if worker.status().await == WorkerStatus::Idle {
                    match worker.is_running().await {
                        Ok(true) => {
                            worker.set_status(WorkerStatus::Busy).await;
                            worker.touch().await;
                            return Ok(worker.clone());
                        }
                        _ => continue,
                    }
                }
            }
        }

        let worker = self
            .create_worker()
            .await
            .map_err(PoolError::Adapter)?;
        worker.set_status(WorkerStatus::Busy).await;
        worker.touch().await;
        self.workers.write().await.push(worker.clone());
        Ok(worker)
    }

    /// On-demand mode: stops, removes, and drops the worker. Pre-warmed
    /// mode: flips it back to `Idle` and keeps it, unless it is already
    /// `Error` — a dead worker's reader task has permanently exited, so
    /// reviving it to `Idle` here would hand it back out via `acquire`
    /// with nothing left able to deliver a response. It stays `Error`
    /// until the health checker removes and recreates it.
    pub async fn release(&self, worker: &Arc<Worker>) {
        if self.config.is_on_demand() {
            let _ = self.adapter.stop_container(&worker.container_id, Some(Duration::from_secs(5))).await;
            let _ = self.adapter.remove_container(&worker.container_id).await;
            worker.shutdown_reader().await;
            self.workers.write().await.retain(|w| w.id != worker.id);
        } else if worker.status().await != WorkerStatus::Error {
            worker.set_status(WorkerStatus::Idle).await;
        }
    }

    /// Marks a worker `Error` without removing it; the health-check path
    /// performs removal and recreation.
    pub async fn mark_dead(&self, worker: &Arc<Worker>) {
        worker.set_status(WorkerStatus::Error).await;
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn record_completed(&self) {
        self.counters.tasks_completed.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn record_failed(&self) {
        self.counters.tasks_failed.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn record_timed_out(&self) {
        self.counters.tasks_timed_out.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn record_queue_full(&self) {
        self.counters.queue_full_hits.fetch_add(1, Ordering::AcqRel);
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            tasks_completed: self.counters.tasks_completed.load(Ordering::Acquire),
            tasks_failed: self.counters.tasks_failed.load(Ordering::Acquire),
            tasks_timed_out: self.counters.tasks_timed_out.load(Ordering::Acquire),
            queue_full_hits: self.counters.queue_full_hits.load(Ordering::Acquire),
            recreations: self.counters.recreations.load(Ordering::Acquire),
            oom_kills: self.counters.oom_kills.load(Ordering::Acquire),
        }
    }

    /// Runs the health check pass for every worker. A pool-level
    /// in-progress flag ensures concurrent invocations never overlap —
    /// a caller that invokes this while a previous pass is still running
    /// gets an empty result immediately rather than racing it.
    pub async fn health_check(&self) -> Vec<WorkerHealth> {
        if self
            .health_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Vec::new();
        }

        let result = self.health_check_inner().await;
        self.health_in_progress.store(false, Ordering::Release);
        result
    }

    async fn health_check_inner(&self) -> Vec<WorkerHealth> {
        let workers = self.workers.read().await.clone();
        let mut statuses = Vec::with_capacity(workers.len());

        for worker in &workers {
            worker.invalidate_inspect_cache().await;
            let now = Instant::now();
            let is_error_status = worker.status().await == WorkerStatus::Error;

            match self.adapter.inspect_container(&worker.container_id).await {
                Ok(inspect) => {
                    let healthy = inspect.running && !inspect.oom_killed && !is_error_status;
                    if inspect.oom_killed {
                        self.counters.oom_kills.fetch_add(1, Ordering::AcqRel);
                    }
                    statuses.push(WorkerHealth {
                        id: worker.id.clone(),
                        healthy,
                        last_check: now,
                        error: None,
                        oom_killed: inspect.oom_killed,
                    });
                }
                Err(e) => {
                    statuses.push(WorkerHealth {
                        id: worker.id.clone(),
                        healthy: false,
                        last_check: now,
                        error: Some(e.message),
                        oom_killed: false,
                    });
                }
            }
        }
        statuses
    }

    /// For each unhealthy worker: closes it, drops it from the map,
    /// stops+removes it (best effort), and creates a replacement.
    pub async fn recreate_unhealthy(&self, statuses: &[WorkerHealth]) {
        for status in statuses.iter().filter(|s| !s.healthy) {
            let worker = {
                let mut workers = self.workers.write().await;
                let idx = workers.iter().position(|w| w.id == status.id);
                idx.map(|i| workers.remove(i))
            };
            let Some(worker) = worker else { continue };

            worker.shutdown_reader().await;
            let _ = self.adapter.stop_container(&worker.container_id, Some(Duration::from_secs(5))).await;
            let _ = self.adapter.remove_container(&worker.container_id).await;

            match self.create_worker().await {
                Ok(fresh) => {
                    self.workers.write().await.push(fresh);
                    self.counters.recreations.fetch_add(1, Ordering::AcqRel);
                    info!(worker_id = %status.id, "recreated unhealthy worker");
                }
                Err(e) => {
                    warn!(worker_id = %status.id, error = %e, "failed to recreate unhealthy worker");
                }
            }
        }
    }

    /// Sets `draining`, waits for in-flight tasks to finish (bounded by
    /// `drain_timeout`), then force-cancels: stops and removes every worker
    /// in parallel (bounded by `shutdown_timeout`), clears the map, and
    /// closes the adapter exactly once.
    pub async fn graceful_shutdown(&self, drain_timeout: Duration, shutdown_timeout: Duration) {
        self.draining.store(true, Ordering::Release);

        let drain_deadline = Instant::now() + drain_timeout;
        loop {
            let any_busy = {
                let workers = self.workers.read().await;
                let mut busy = false;
                for w in workers.iter() {
                    if w.status().await == WorkerStatus::Busy {
                        busy = true;
                        break;
                    }
                }
                busy
            };
            if !any_busy || Instant::now() >= drain_deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let _ = self.cleanup_cancel.send(true);
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            let _ = handle.await;
        }

        let workers = self.workers.write().await.drain(..).collect::<Vec<_>>();
        let stop_futures = workers.iter().map(|w| {
            let adapter = self.adapter.clone();
            let container_id = w.container_id.clone();
            async move {
                let _ = adapter.stop_container(&container_id, Some(Duration::from_secs(5))).await;
                let _ = adapter.remove_container(&container_id).await;
            }
        });
        let _ = tokio::time::timeout(shutdown_timeout, futures_join_all(stop_futures)).await;
        for w in &workers {
            w.shutdown_reader().await;
        }

        let _ = self.adapter.close().await;
        info!("pool shutdown complete");
    }

    #[cfg(test)]
    pub(crate) async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }
}

/// Minimal stand-in for `futures::future::join_all` so the pool does not
/// need the full `futures` crate just for this one call site.
async fn futures_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()>,
{
    let handles: Vec<_> = iter.into_iter().map(tokio::spawn).collect();
    for handle in handles {
        let _ = handle.await;
    }
}

async fn cleanup_fiber(pool: Arc<Pool>, mut cancel_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CLEANUP_TICK) => {
                let workers = pool.workers.read().await.clone();
                for worker in workers {
                    let swept = worker.sweep_stale_pending().await;
                    if swept > 0 {
                        warn!(worker_id = %worker.id, count = swept, "swept stale pending entries");
                    }
                }
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return;
                }
            }
        }
    }
}
