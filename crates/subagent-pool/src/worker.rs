//! Worker (Container) Entity (component C4): one long-lived container with
//! an attached duplex byte stream, a single reader task, a correlation map,
//! and a status the pool mutates under its own lock.
//!
//! Invariants carried from spec §3/§5: exactly one reader task per worker;
//! `pending_count == |{p in pending : !p.done}|` within write/cleanup
//! windows; `status` mutates only while the pool holds its lock, except
//! `Error` set directly by the reader on an unrecoverable I/O failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use subagent_protocol::Response;

use crate::container::{ContainerAdapter, InspectResult};
use crate::error::AdapterError;

const INITIAL_LINE_BUF: usize = 64 * 1024;
const MAX_LINE_BUF: usize = 1024 * 1024;
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Worker status; mutated only while the pool's lock is held, except the
/// `Error` transition the reader task performs on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
}

/// Per-request rendezvous between the writer path (executor) and the
/// shared reader task. The channel is logically capacity-1,
/// first-write-wins: once `done` flips true under `state`'s lock, later
/// writers silently drop their value instead of blocking.
pub struct PendingEntry {
    state: AsyncMutex<PendingState>,
    pub created_at: Instant,
}

struct PendingState {
    done: bool,
    tx: Option<oneshot::Sender<Response>>,
}

impl PendingEntry {
    fn new(tx: oneshot::Sender<Response>) -> Self {
        Self {
            state: AsyncMutex::new(PendingState { done: false, tx: Some(tx) }),
            created_at: Instant::now(),
        }
    }

    /// Reader-side delivery: non-blocking, first-write-wins. Returns `true`
    /// if this call delivered the response.
    async fn deliver(&self, response: Response) -> bool {
        let mut state = self.state.lock().await;
        if state.done {
            return false;
        }
        state.done = true;
        if let Some(tx) = state.tx.take() {
            let _ = tx.send(response);
            true
        } else {
            false
        }
    }

    /// Idempotent "done" transition used by the cleanup fiber (staleness)
    /// and by the executor's deferred cleanup on timeout/response.
    pub async fn mark_done(&self) {
        let mut state = self.state.lock().await;
        state.done = true;
        state.tx.take();
    }

    pub async fn is_done(&self) -> bool {
        self.state.lock().await.done
    }
}

/// One long-lived sandboxed worker.
pub struct Worker {
    pub id: String,
    pub container_id: String,
    status: AsyncMutex<WorkerStatus>,
    stdin: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: RwLock<HashMap<String, Arc<PendingEntry>>>,
    pending_count: AtomicUsize,
    pub max_pending: usize,
    last_used: AsyncMutex<Instant>,
    last_inspect: AsyncMutex<Option<(Instant, InspectResult)>>,
    inspect_ttl: Duration,
    cancel_tx: watch::Sender<bool>,
    reader_handle: AsyncMutex<Option<JoinHandle<()>>>,
    adapter: Arc<dyn ContainerAdapter>,
}

impl Worker {
    /// Attaches to an already-created, already-started container and spawns
    /// the single reader task that will own its stdout for the worker's
    /// lifetime.
    pub async fn attach(
        id: String,
        container_id: String,
        adapter: Arc<dyn ContainerAdapter>,
        max_pending: usize,
        inspect_ttl: Duration,
    ) -> Result<Arc<Self>, AdapterError> {
        let attached = adapter.attach_container(&container_id).await?;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let worker = Arc::new(Self {
            id,
            container_id,
            status: AsyncMutex::new(WorkerStatus::Idle),
            stdin: AsyncMutex::new(attached.stdin),
            pending: RwLock::new(HashMap::new()),
            pending_count: AtomicUsize::new(0),
            max_pending,
            last_used: AsyncMutex::new(Instant::now()),
            last_inspect: AsyncMutex::new(None),
            inspect_ttl,
            cancel_tx,
            reader_handle: AsyncMutex::new(None),
            adapter,
        });

        let reader_worker = worker.clone();
        let handle = tokio::spawn(reader_loop(reader_worker, attached.stdout, cancel_rx));
        *worker.reader_handle.lock().await = Some(handle);

        Ok(worker)
    }

    pub async fn status(&self) -> WorkerStatus {
        *self.status.lock().await
    }

    pub async fn set_status(&self, status: WorkerStatus) {
        *self.status.lock().await = status;
    }

    pub async fn touch(&self) {
        *self.last_used.lock().await = Instant::now();
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Atomically reserves one pending slot, enforcing `max_pending`.
    /// Returns `false` (no slot reserved) when the worker is already full —
    /// the executor maps that to `QUEUE_FULL`.
    pub fn try_reserve_pending(&self) -> bool {
        loop {
            let current = self.pending_count.load(Ordering::Acquire);
            if current >= self.max_pending {
                return false;
            }
            if self
                .pending_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Registers a `PendingEntry` for `request_id` and returns the receiver
    /// half the executor awaits. Must be paired with exactly one
    /// [`Worker::release_pending`] on every code path (spec §4.6 invariant).
    pub async fn register_pending(&self, request_id: String) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(PendingEntry::new(tx));
        self.pending.write().await.insert(request_id, entry);
        rx
    }

    /// Deferred cleanup pair to [`Worker::try_reserve_pending`] +
    /// [`Worker::register_pending`]: marks the entry done, removes it, and
    /// decrements `pending_count` exactly once.
    pub async fn release_pending(&self, request_id: &str) {
        let entry = self.pending.write().await.remove(request_id);
        if let Some(entry) = entry {
            entry.mark_done().await;
        }
        self.pending_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Writes one protocol line to stdin, bounded by a write deadline
    /// (spec §4.6 step 9). The deadline is enforced from the caller's side
    /// with `tokio::time::timeout`; a write that races past the deadline is
    /// abandoned (the underlying stream may still absorb it, but the
    /// executor does not wait on it further).
    pub async fn write_line(&self, line: &str, deadline: Duration) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        tokio::time::timeout(deadline, async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        })
        .await
        .unwrap_or_else(|_| Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded")))
    }

    /// `IsRunning`: caches the inspect result for `inspect_ttl`; on miss,
    /// calls through the adapter and propagates its error unchanged.
    pub async fn is_running(&self) -> Result<bool, AdapterError> {
        let mut cache = self.last_inspect.lock().await;
        if let Some((checked_at, result)) = *cache {
            if checked_at.elapsed() < self.inspect_ttl {
                return Ok(result.running && !result.oom_killed);
            }
        }
        let result = self.adapter.inspect_container(&self.container_id).await?;
        *cache = Some((Instant::now(), result));
        Ok(result.running && !result.oom_killed)
    }

    /// Forces the next [`Worker::is_running`] call to bypass the cache —
    /// used by the health checker right before deciding recreation.
    pub async fn invalidate_inspect_cache(&self) {
        *self.last_inspect.lock().await = None;
    }

    /// Walks `pending`, marking entries older than `STALE_AFTER` done and
    /// removing them, decrementing `pending_count` exactly once per entry.
    /// Called by the pool's cleanup fiber every 10 s.
    pub async fn sweep_stale_pending(&self) -> usize {
        let now = Instant::now();
        let mut stale_ids = Vec::new();
        for (id, entry) in self.pending.read().await.iter() {
            if now.duration_since(entry.created_at) > STALE_AFTER && !entry.is_done().await {
                stale_ids.push(id.clone());
            }
        }
        let count = stale_ids.len();
        for id in stale_ids {
            self.release_pending(&id).await;
        }
        count
    }

    /// Cancels the reader task and awaits its exit. Idempotent.
    pub async fn shutdown_reader(&self) {
        let _ = self.cancel_tx.send(true);
        if let Some(handle) = self.reader_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn reader_loop(
    worker: Arc<Worker>,
    mut stdout: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(INITIAL_LINE_BUF);
    let mut chunk = [0u8; 8192];

    loop {
        // Only arm the inactivity watchdog while a response is actually
        // outstanding — an idle pre-warmed worker with no pending requests
        // has nothing to say on stdout and that is not a fault.
        let watchdog = async {
            if worker.pending_count() == 0 {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(INACTIVITY_TIMEOUT).await
            }
        };

        tokio::select! {
            biased;

            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    debug!(worker_id = %worker.id, "reader task cancelled");
                    return;
                }
            }

            _ = watchdog => {
                warn!(worker_id = %worker.id, "reader inactivity watchdog fired while requests were pending");
                worker.set_status(WorkerStatus::Error).await;
                return;
            }

            read_result = stdout.read(&mut chunk) => {
                match read_result {
                    Ok(0) => {
                        debug!(worker_id = %worker.id, "stdout EOF");
                        worker.set_status(WorkerStatus::Error).await;
                        return;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        process_lines(&worker, &mut buf).await;
                    }
                    Err(e) => {
                        warn!(worker_id = %worker.id, error = %e, "stdout read error");
                        worker.set_status(WorkerStatus::Error).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn process_lines(worker: &Arc<Worker>, buf: &mut Vec<u8>) {
    loop {
        let newline_pos = buf.iter().position(|&b| b == b'\n');
        let Some(pos) = newline_pos else {
            if buf.len() > MAX_LINE_BUF {
                warn!(worker_id = %worker.id, "line exceeded 1 MiB without newline, dropping buffer");
                buf.clear();
            }
            return;
        };

        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = &line[..line.len() - 1]; // trim '\n'
        let line = if line.last() == Some(&b'\r') { &line[..line.len() - 1] } else { line };

        if line.is_empty() {
            continue;
        }

        match serde_json::from_slice::<Response>(line) {
            Ok(response) => dispatch_response(worker, response).await,
            Err(e) => {
                warn!(worker_id = %worker.id, error = %e, "dropping unparsable protocol line");
            }
        }
    }
}

async fn dispatch_response(worker: &Arc<Worker>, response: Response) {
    let entry = worker.pending.read().await.get(&response.id).cloned();
    let Some(entry) = entry else {
        debug!(worker_id = %worker.id, request_id = %response.id, "stale response dropped");
        return;
    };
    entry.deliver(response).await;
}
