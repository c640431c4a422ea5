use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{MarketDashError, MarketDashResult};

/// A unit of ingestion work. The owner rides along so the worker can open its
/// tenant-scoped session before reading anything.
#[derive(Debug, Clone)]
pub enum Task {
    ProcessJob { job_id: Uuid, owner_id: i64 },
    ProcessChunk { job_id: Uuid, owner_id: i64, chunk_index: i32 },
}

impl Task {
    pub fn job_id(&self) -> Uuid {
        match self {
            Task::ProcessJob { job_id, .. } | Task::ProcessChunk { job_id, .. } => *job_id,
        }
    }
}

/// Bounded in-process task queue. The bound is the backpressure signal:
/// when the channel is full, job commits are refused with `Unavailable`.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
}

pub type TaskReceiver = Arc<Mutex<mpsc::Receiver<Task>>>;

impl TaskQueue {
    pub fn new(capacity: usize) -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, Arc::new(Mutex::new(rx)))
    }

    pub fn try_enqueue(&self, task: Task) -> MarketDashResult<()> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MarketDashError::Unavailable("Processing queue is saturated, retry later".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                MarketDashError::Upstream("Processing queue is shut down".into())
            }
        })
    }

    /// Waiting enqueue for internal fan-out (chunk tasks). API-facing
    /// submission always goes through `try_enqueue` so saturation surfaces
    /// as backpressure instead of a stalled request.
    pub async fn enqueue_wait(&self, task: Task) -> MarketDashResult<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| MarketDashError::Upstream("Processing queue is shut down".into()))
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// High-water mark reached: no free slot in the channel.
    pub fn is_saturated(&self) -> bool {
        self.tx.capacity() == 0
    }
}

/// Spawn the worker pool. Workers drain the queue until cancellation or
/// channel close; each task is processed to completion before the next recv,
/// so shutdown never abandons a half-written batch mid-await.
pub fn start_workers(
    workers: usize,
    state: crate::state::AppState,
    rx: TaskReceiver,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker_id| {
            let state = state.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tracing::info!(worker_id, "ingest worker started");
                loop {
                    let task = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            task = guard.recv() => task,
                        }
                    };
                    let Some(task) = task else { break };

                    let job_id = task.job_id();
                    if let Err(e) =
                        crate::ingest::worker::run_task(&state, task, cancel.clone()).await
                    {
                        tracing::error!(worker_id, %job_id, "task failed: {}", e);
                    }
                }
                tracing::info!(worker_id, "ingest worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_refuses_enqueue() {
        let (queue, _rx) = TaskQueue::new(1);
        let task = Task::ProcessJob {
            job_id: Uuid::new_v4(),
            owner_id: 1,
        };
        queue.try_enqueue(task.clone()).unwrap();
        let err = queue.try_enqueue(task).unwrap_err();
        assert!(matches!(err, MarketDashError::Unavailable(_)));
    }

    #[tokio::test]
    async fn closed_queue_reports_upstream() {
        let (queue, rx) = TaskQueue::new(4);
        drop(rx);
        // receiver dropped => channel closed
        let err = queue
            .try_enqueue(Task::ProcessJob {
                job_id: Uuid::new_v4(),
                owner_id: 1,
            })
            .unwrap_err();
        assert!(matches!(err, MarketDashError::Upstream(_)));
        assert!(!queue.is_running());
    }
}
