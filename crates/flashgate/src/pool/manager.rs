use core::{future::Future, time::Duration};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use super::{
    PoolConfig,
    worker::{WorkRequest, worker_loop},
};
use crate::error::{Error, Result};

/// A fixed set of workers running background tasks.
///
/// Each worker listens on its own bounded [`mpsc`] queue. [`spawn`] picks a
/// starting worker round-robin and, if that queue is full, falls over to the
/// next one; it never waits for room. Tasks are fire-and-forget: their
/// outcome is not reported back, and a panic is logged and contained inside
/// the worker.
///
/// [`spawn`]: RebuildPool::spawn
pub struct RebuildPool {
    workers: Vec<mpsc::Sender<WorkRequest>>,
    next_worker: AtomicUsize,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl RebuildPool {
    /// Starts the workers on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: &PoolConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let (tx, rx) = mpsc::channel(capacity);
                tokio::spawn(worker_loop(worker_id, rx));
                tx
            })
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Started rebuild pool with {} workers (queue capacity {capacity})",
            config.workers.max(1)
        );

        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            shutdown_token: CancellationToken::new(),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Queues `task` on the next worker with room.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once the pool is shutting down.
    /// - [`Error::PoolSaturated`] if every worker queue is full. The task is
    ///   dropped without running.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let start = self.next_worker_index();
        let mut request = WorkRequest::Run {
            task: Box::pin(task),
        };
        for offset in 0..self.workers.len() {
            let worker_idx = (start + offset) % self.workers.len();
            match self.workers[worker_idx].try_send(request) {
                Ok(()) => return Ok(()),
                Err(
                    mpsc::error::TrySendError::Full(back)
                    | mpsc::error::TrySendError::Closed(back),
                ) => request = back,
            }
        }

        #[cfg(feature = "tracing")]
        tracing::warn!("All {} rebuild workers are busy", self.workers.len());
        Err(Error::PoolSaturated)
    }

    /// Stops intake and waits for every worker to finish its queue.
    ///
    /// Work already queued runs before a worker acknowledges. Each worker gets
    /// the configured shutdown timeout; a worker that does not answer in time
    /// is logged and left behind. Calling this twice is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for reporting.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Ok(());
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("Refusing new background tasks");
        self.shutdown_token.cancel();

        let mut shutdown_handles = Vec::with_capacity(self.workers.len());
        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            match timeout(
                self.shutdown_timeout,
                worker.send(WorkRequest::Shutdown { response: tx }),
            )
            .await
            {
                Ok(Ok(())) => shutdown_handles.push((i, rx)),
                Ok(Err(_)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {i} exited before shutdown");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {i} queue stayed full during shutdown");
                }
            }
        }

        let shutdown_timeout = self.shutdown_timeout;
        let acks = shutdown_handles.into_iter().map(|(_i, rx)| async move {
            match timeout(shutdown_timeout, rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_i} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_i} dropped its acknowledgement: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_i} shutdown timed out");
                }
            }
        });
        futures::future::join_all(acks).await;

        #[cfg(feature = "tracing")]
        tracing::debug!("Rebuild pool shutdown complete");
        Ok(())
    }
}

impl core::fmt::Debug for RebuildPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RebuildPool")
            .field("workers", &self.workers.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
