//! Per-session lanes with a global concurrency cap.
//!
//! A lane is a FIFO of pending work for one session, drained by a single
//! worker task, so two submissions to the same session run in submission
//! order and never overlap. Before running, every work item also takes a
//! permit from the global semaphore; at most `max_concurrent` lanes are
//! active at any moment.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use crate::steering::CancelToken;

/// Boxed work passed across the lane boundary. Boxing here also breaks the
/// type cycle between the reactive loop and subagent spawning.
pub type BoxedWork<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Invoked with the elapsed wait in milliseconds when a ready work item is
/// blocked on the global cap beyond the configured threshold.
pub type WaitCallback = Arc<dyn Fn(u64) + Send + Sync>;

struct QueuedJob {
    cancel: CancelToken,
    on_wait: Option<WaitCallback>,
    /// Metered jobs take a global permit before running. Subagent runs are
    /// unmetered: their concurrency is bounded by the separate worker pool,
    /// and gating them here as well could deadlock a parent joining its
    /// child while holding the last permit.
    metered: bool,
    work: BoxedWork<()>,
}

struct Lane {
    tx: mpsc::UnboundedSender<QueuedJob>,
    /// Queued plus running items. Guarded by the lane map's mutex.
    depth: Arc<AtomicUsize>,
}

/// Process-wide scheduler mapping `session_id -> lane`.
pub struct LaneQueue {
    lanes: Mutex<HashMap<String, Lane>>,
    global: Arc<Semaphore>,
    max_concurrent: usize,
    warn_wait: Duration,
}

impl LaneQueue {
    pub fn new(max_concurrent: usize, lane_warn_wait_ms: u64) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            lanes: Mutex::new(HashMap::new()),
            global: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            warn_wait: Duration::from_millis(lane_warn_wait_ms.max(1)),
        }
    }

    /// Enqueue work on a session's lane. The returned receiver resolves with
    /// the work's output; it resolves with `Err` when the item was cancelled
    /// before it started (removed silently).
    pub fn submit<T: Send + 'static>(
        &self,
        session_id: &str,
        cancel: CancelToken,
        on_wait: Option<WaitCallback>,
        work: BoxedWork<T>,
    ) -> oneshot::Receiver<T> {
        self.submit_inner(session_id, cancel, on_wait, true, work)
    }

    /// Like [`submit`](Self::submit), but exempt from the global cap. Used
    /// for subagent runs, which are bounded by their own worker pool.
    pub(crate) fn submit_unmetered<T: Send + 'static>(
        &self,
        session_id: &str,
        cancel: CancelToken,
        work: BoxedWork<T>,
    ) -> oneshot::Receiver<T> {
        self.submit_inner(session_id, cancel, None, false, work)
    }

    fn submit_inner<T: Send + 'static>(
        &self,
        session_id: &str,
        cancel: CancelToken,
        on_wait: Option<WaitCallback>,
        metered: bool,
        work: BoxedWork<T>,
    ) -> oneshot::Receiver<T> {
        let (tx_result, rx_result) = oneshot::channel();
        let job = QueuedJob {
            cancel,
            on_wait,
            metered,
            work: Box::pin(async move {
                let _ = tx_result.send(work.await);
            }),
        };

        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(session_id.to_owned()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let depth = Arc::new(AtomicUsize::new(0));
            tokio::spawn(lane_worker(
                rx,
                self.global.clone(),
                self.warn_wait,
                depth.clone(),
            ));
            Lane { tx, depth }
        });
        lane.depth.fetch_add(1, Ordering::SeqCst);
        if lane.tx.send(job).is_err() {
            // Worker gone (runtime shutdown); the receiver reports Err.
            lane.depth.fetch_sub(1, Ordering::SeqCst);
        }
        rx_result
    }

    /// Lanes currently holding a global permit.
    pub fn active_count(&self) -> usize {
        self.max_concurrent - self.global.available_permits()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Drop lanes with no queued or running work.
    pub fn prune_idle(&self) {
        let mut lanes = self.lanes.lock();
        lanes.retain(|_, lane| lane.depth.load(Ordering::SeqCst) > 0);
    }
}

async fn lane_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    global: Arc<Semaphore>,
    warn_wait: Duration,
    depth: Arc<AtomicUsize>,
) {
    while let Some(job) = rx.recv().await {
        if !job.cancel.is_cancelled() {
            if job.metered {
                match acquire_global(&global, warn_wait, job.on_wait.as_ref()).await {
                    Some(_permit) => {
                        // Re-check: the item may have been cancelled while
                        // the lane waited on the cap.
                        if !job.cancel.is_cancelled() {
                            job.work.await;
                        }
                    }
                    None => {
                        tracing::error!("global semaphore closed; dropping lane work");
                    }
                }
            } else {
                job.work.await;
            }
        }
        depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Take a global permit, firing the wait callback once when the wait
/// exceeds the warn threshold.
async fn acquire_global(
    global: &Arc<Semaphore>,
    warn_wait: Duration,
    on_wait: Option<&WaitCallback>,
) -> Option<OwnedSemaphorePermit> {
    let started = Instant::now();
    match tokio::time::timeout(warn_wait, global.clone().acquire_owned()).await {
        Ok(result) => result.ok(),
        Err(_) => {
            if let Some(cb) = on_wait {
                cb(started.elapsed().as_millis() as u64);
            }
            global.clone().acquire_owned().await.ok()
        }
    }
}
