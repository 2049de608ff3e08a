//! Bounded ingestion job queue and worker pool.
//!
//! Jobs carry `(tenant, document id, attempt)`. Enqueueing past capacity
//! returns [`ServiceError::QueueFull`] — back-pressure is the caller's
//! problem, not silent buffering. A fixed pool of workers consumes jobs;
//! transient failures re-enqueue with `attempt + 1` after a backoff,
//! permanent failures leave the document `failed` and drop the job.
//! Shutdown stops intake, drains in-flight work under a deadline, then
//! cancels whatever remains — those documents stay `queued`/`failed` in the
//! store for the next start.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::backoff_delay;
use crate::config::WorkerConfig;
use crate::errors::ServiceError;
use crate::ingest::coordinator::IngestionCoordinator;
use crate::tenant::TenantId;

/// One unit of ingestion work.
#[derive(Clone, Debug)]
pub struct IngestJob {
    pub tenant: TenantId,
    pub document_id: String,
    pub attempt: u32,
}

/// Producer side of the bounded job queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: flume::Sender<IngestJob>,
}

impl JobQueue {
    /// Enqueue without blocking; a full queue is surfaced to the caller.
    pub fn enqueue(&self, job: IngestJob) -> Result<(), ServiceError> {
        self.tx.try_send(job).map_err(|err| match err {
            flume::TrySendError::Full(_) => ServiceError::QueueFull,
            flume::TrySendError::Disconnected(_) => {
                ServiceError::Internal("ingestion workers are gone".into())
            }
        })
    }

    /// Jobs currently waiting in the queue.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}

/// Handle over the spawned workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    /// Graceful stop: workers finish their current job, then exit.
    drain: CancellationToken,
    /// Hard stop: in-flight jobs abort at their next await point.
    cancel: CancellationToken,
    drain_deadline: std::time::Duration,
}

impl WorkerPool {
    /// Stop intake, drain in-flight jobs under the configured deadline, then
    /// cancel stragglers. Remaining queue entries are dropped here — their
    /// documents are still `queued` in the metadata store and will be
    /// re-enqueued on the next start.
    pub async fn shutdown(self) {
        self.drain.cancel();
        let mut joined = join_all(self.handles);
        if tokio::time::timeout(self.drain_deadline, &mut joined)
            .await
            .is_err()
        {
            warn!("worker drain deadline elapsed; cancelling in-flight jobs");
            self.cancel.cancel();
            let _ = joined.await;
        }
        info!("ingestion worker pool stopped");
    }
}

/// Spawn the worker pool and hand back the queue.
///
/// `retry_backoff` is the base for whole-document re-enqueue delays:
/// attempt `n` waits `retry_backoff · 2^n` before the job re-enters the
/// queue.
pub fn start(
    coordinator: Arc<IngestionCoordinator>,
    config: &WorkerConfig,
    max_attempts: u32,
    retry_backoff: std::time::Duration,
) -> (JobQueue, WorkerPool) {
    let (tx, rx) = flume::bounded(config.queue_capacity);
    let drain = CancellationToken::new();
    let cancel = CancellationToken::new();

    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers.max(1) {
        let rx = rx.clone();
        let retry_tx = tx.clone();
        let coordinator = coordinator.clone();
        let drain = drain.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(
                worker_id,
                coordinator,
                rx,
                retry_tx,
                drain,
                cancel,
                max_attempts,
                retry_backoff,
            )
            .await;
        }));
    }

    (
        JobQueue { tx },
        WorkerPool {
            handles,
            drain,
            cancel,
            drain_deadline: config.drain_deadline,
        },
    )
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    coordinator: Arc<IngestionCoordinator>,
    rx: flume::Receiver<IngestJob>,
    retry_tx: flume::Sender<IngestJob>,
    drain: CancellationToken,
    cancel: CancellationToken,
    max_attempts: u32,
    retry_backoff: std::time::Duration,
) {
    loop {
        let job = tokio::select! {
            () = drain.cancelled() => break,
            () = cancel.cancelled() => break,
            job = rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        debug!(
            worker = worker_id,
            tenant = %job.tenant,
            document = %job.document_id,
            attempt = job.attempt,
            "worker picked up ingestion job"
        );

        match coordinator
            .process(&job.tenant, &job.document_id, &cancel)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_cancelled() => {
                // Shutdown hard-cancel: the coordinator already put the
                // document back to queued.
                debug!(document = %job.document_id, "job cancelled");
            }
            Err(err) if err.is_transient() && job.attempt + 1 < max_attempts => {
                let delay = backoff_delay(retry_backoff, job.attempt);
                let retry = IngestJob {
                    attempt: job.attempt + 1,
                    ..job.clone()
                };
                let retry_tx = retry_tx.clone();
                let cancel = cancel.clone();
                // Delayed re-enqueue off the worker so this worker keeps
                // consuming. A dropped retry (full or closed queue) leaves
                // the document `failed` with retry budget remaining; the
                // next start picks it up.
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(delay) => {
                            if retry_tx.try_send(retry).is_err() {
                                warn!("retry re-enqueue dropped: queue full or closed");
                            }
                        }
                    }
                });
            }
            Err(err) => {
                warn!(
                    tenant = %job.tenant,
                    document = %job.document_id,
                    attempt = job.attempt,
                    error = %err,
                    "ingestion job failed terminally"
                );
            }
        }
    }
    debug!(worker = worker_id, "ingestion worker exited");
}
