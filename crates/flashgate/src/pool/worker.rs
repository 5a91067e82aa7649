use core::{any::Any, panic::AssertUnwindSafe};

use futures::{FutureExt, future::BoxFuture};
use tokio::sync::{mpsc, oneshot};

/// A message sent to one pool worker.
pub(crate) enum WorkRequest {
    /// Run a task to completion.
    Run { task: BoxFuture<'static, ()> },
    /// Stop after everything queued before this message, then acknowledge.
    Shutdown { response: oneshot::Sender<()> },
}

/// Drains one worker queue until a shutdown request or until every sender
/// is dropped.
///
/// Tasks run one at a time. A panicking task is caught at this boundary and
/// logged; the worker moves on to the next request.
pub(crate) async fn worker_loop(worker_id: usize, mut rx: mpsc::Receiver<WorkRequest>) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Run { task } => {
                if let Err(_panic) = AssertUnwindSafe(task).catch_unwind().await {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        "Worker {worker_id} task panicked: {}",
                        panic_message(_panic.as_ref())
                    );
                }
            }
            WorkRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
