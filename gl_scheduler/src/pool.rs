//! ABOUTME: Bounded worker pool executing claimed job bodies
//! ABOUTME: Fixed worker count over a bounded mpsc queue; shutdown via cancellation, not queue close

use crate::events::EventSink;
use crate::job::Job;
use crate::logger::Logger;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Executes one claimed job. Implemented by the scheduler facade; kept as
/// a trait so the pool itself stays free of scheduling concerns (backfill,
/// concurrency caps, next-run recomputation all live in the implementor).
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job);
}

/// Fixed-size pool of worker tasks pulling from a bounded, shared queue.
///
/// The queue is never closed while workers may still be receiving;
/// shutdown is signalled purely through `cancel`. Enqueue is non-blocking
/// — a full queue is the dispatcher's problem, not the pool's (see
/// `Scheduler::claim_and_dispatch`).
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        worker_count: usize,
        queue_size: usize,
        executor: Arc<dyn JobExecutor>,
        events: Arc<dyn EventSink>,
        logger: Arc<dyn Logger>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_size);
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver = receiver.clone();
            let executor = executor.clone();
            let events = events.clone();
            let logger = logger.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, worker_count, receiver, executor, events, logger, cancel)
                    .await;
            }));
        }

        Self { sender, handles }
    }

    /// Non-blocking enqueue. `false` means the queue was full; the caller
    /// (dispatcher) is responsible for leaving the job Pending.
    pub fn try_enqueue(&self, job: Job) -> bool {
        self.sender.try_send(job).is_ok()
    }

    /// Wait for all workers to exit, up to `timeout`. Callers should have
    /// already cancelled the shared token; this only waits for the tasks
    /// spawned by `spawn` to observe it and return.
    pub async fn join(self, timeout: std::time::Duration) -> Result<(), ()> {
        let joined = tokio::time::timeout(timeout, futures_all(self.handles)).await;
        joined.map_err(|_| ())
    }
}

async fn futures_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    worker_count: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    executor: Arc<dyn JobExecutor>,
    events: Arc<dyn EventSink>,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
) {
    events.emit(
        "worker.started",
        json!({ "worker_id": worker_id, "worker_count": worker_count }),
    );

    loop {
        let next_job = {
            let mut guard = receiver.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = guard.recv() => job,
            }
        };

        let Some(job) = next_job else {
            break;
        };

        events.emit(
            "worker.busy",
            json!({ "worker_id": worker_id, "job_id": job.id }),
        );
        let job_id = job.id.clone();
        executor.execute(job).await;
        events.emit(
            "worker.idle",
            json!({ "worker_id": worker_id, "job_id": job_id }),
        );
    }

    logger.debug("worker stopped", &[("worker_id", &worker_id.to_string())]);
    events.emit("worker.stopped", json!({ "worker_id": worker_id }));
}
