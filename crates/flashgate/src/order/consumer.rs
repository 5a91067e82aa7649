use core::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::{ConsumerConfig, ConsumerStats, OrderIntent, OrderOutcome, OrderRepository, create_order};
use crate::{
    error::{Error, Result},
    lock::{DistributedLock, lock_key},
    pool::panic_message,
    store::{EntryId, KvStore, ReadOffset, StreamEntry},
};

/// What happened to one delivered record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Processed {
    /// Persisted (or found already persisted) and acknowledged.
    Acked(OrderOutcome),
    /// The buyer's lock was held elsewhere. The record stays pending for the
    /// next recovery pass.
    Deferred,
}

/// Totals of one recovery pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replayed: usize,
    pub acked: usize,
    pub deferred: usize,
    pub failed: usize,
}

/// Drains the order log into the repository.
///
/// Records are read through a consumer group, so each one is delivered to a
/// single consumer and stays on that consumer's pending list until
/// acknowledged. A record is acknowledged only after its order has been
/// persisted (or was already there); a failure or lock contention leaves it
/// pending, and a recovery pass replays it later. Delivery is therefore at
/// least once, and [`create_order`] absorbs the repeats.
pub struct OrderConsumer<S: KvStore, R: OrderRepository> {
    store: Arc<S>,
    repo: Arc<R>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

impl<S: KvStore, R: OrderRepository> OrderConsumer<S, R> {
    pub fn new(store: Arc<S>, repo: Arc<R>, config: ConsumerConfig) -> Self {
        Self {
            store,
            repo,
            config,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Creates the consumer group if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn ensure_group(&self) -> Result<()> {
        if self
            .store
            .xgroup_create(&self.config.stream, &self.config.group)
            .await?
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "Created group `{}` on `{}`",
                self.config.group,
                self.config.stream
            );
        }
        Ok(())
    }

    /// Number of records delivered to the group and not yet acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the group is missing.
    pub async fn pending(&self) -> Result<usize> {
        self.store
            .xpending(&self.config.stream, &self.config.group)
            .await
    }

    /// Persists one delivered record under the buyer's lock and acknowledges
    /// it.
    ///
    /// # Errors
    ///
    /// Returns decoding, lock, persistence or acknowledgement failures, and
    /// [`Error::TaskPanicked`] if the unit of work panics. The buyer lock is
    /// released and the record left pending in every error case.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(record = %entry.id)))]
    pub async fn process_entry(&self, entry: &StreamEntry) -> Result<Processed> {
        let intent = OrderIntent::from_entry(entry)?;

        let lock = DistributedLock::new(Arc::clone(&self.store), lock_key("order", intent.user_id));
        if !lock.try_acquire(self.config.lock_ttl).await? {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "User {} is already being processed, deferring order {}",
                intent.user_id,
                intent.order_id
            );
            self.stats.record_deferred();
            return Ok(Processed::Deferred);
        }

        let created = AssertUnwindSafe(create_order(self.repo.as_ref(), &intent))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::TaskPanicked {
                    context: format!(
                        "order {} unit of work: {}",
                        intent.order_id,
                        panic_message(panic.as_ref())
                    ),
                })
            });
        if let Err(_e) = lock.release().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Could not release `{}`, it will expire: {_e}", lock.key());
        }
        let outcome = created?;

        self.store
            .xack(&self.config.stream, &self.config.group, entry.id)
            .await?;

        match outcome {
            OrderOutcome::Created => self.stats.record_created(),
            OrderOutcome::AlreadyExists => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Order for user {} already exists", intent.user_id);
                self.stats.record_already_existed();
            }
            OrderOutcome::OutOfStock => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Persisted stock of voucher {} exhausted, dropping order {}",
                    intent.voucher_id,
                    intent.order_id
                );
                self.stats.record_out_of_stock();
            }
        }
        Ok(Processed::Acked(outcome))
    }

    /// [`Self::process_entry`] behind a panic boundary, so one bad record
    /// cannot take the worker down. A panic leaves the record pending.
    async fn process_caught(&self, entry: &StreamEntry) -> Result<Processed> {
        AssertUnwindSafe(self.process_entry(entry))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::TaskPanicked {
                    context: format!("record {}: {}", entry.id, panic_message(panic.as_ref())),
                })
            })
    }

    /// Replays this consumer's pending records, oldest first, until the
    /// list has been walked once.
    ///
    /// The cursor moves past every record it replays, so a record that is
    /// deferred or fails again is left for the next pass rather than retried
    /// in a loop.
    ///
    /// # Errors
    ///
    /// Returns an error only if reading the pending list fails; per-record
    /// failures are logged and counted in the report.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub async fn recover_pending(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut cursor = EntryId::ZERO;
        loop {
            let batch = self
                .store
                .xread_group(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer,
                    ReadOffset::After(cursor),
                    self.config.batch_size.max(1),
                    None,
                )
                .await?;
            if batch.is_empty() {
                break;
            }
            for entry in &batch {
                cursor = entry.id;
                report.replayed += 1;
                self.stats.record_replayed();
                match self.process_caught(entry).await {
                    Ok(Processed::Acked(_)) => report.acked += 1,
                    Ok(Processed::Deferred) => report.deferred += 1,
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!("Replaying record {} failed: {_e}", entry.id);
                        self.stats.record_failed();
                        report.failed += 1;
                    }
                }
            }
        }

        if report.replayed > 0 {
            #[cfg(feature = "tracing")]
            tracing::info!(
                "Recovery replayed {} records ({} acked, {} deferred, {} failed)",
                report.replayed,
                report.acked,
                report.deferred,
                report.failed
            );
        }
        Ok(report)
    }

    /// Reads new records, waiting up to the block timeout for one to arrive.
    async fn read_new(&self) -> Result<Vec<StreamEntry>> {
        self.store
            .xread_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                ReadOffset::NewEntries,
                self.config.batch_size.max(1),
                Some(self.config.block),
            )
            .await
    }

    /// Processes a freshly read batch. Returns `true` when something was
    /// left pending.
    async fn process_batch(&self, batch: &[StreamEntry]) -> bool {
        let mut left_pending = false;
        for entry in batch {
            match self.process_caught(entry).await {
                Ok(Processed::Acked(_)) => {}
                Ok(Processed::Deferred) => left_pending = true,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Processing record {} failed: {_e}", entry.id);
                    self.stats.record_failed();
                    left_pending = true;
                }
            }
        }
        left_pending
    }

    async fn recover_logged(&self) {
        if let Err(_e) = self.recover_pending().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Recovery pass failed: {_e}");
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Order consumer `{}` started on `{}`",
            self.config.consumer,
            self.config.stream
        );

        if let Err(_e) = self.ensure_group().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Could not create consumer group: {_e}");
        }
        self.recover_logged().await;

        loop {
            // Only the blocking read is interrupted; a batch in hand is
            // processed to the end.
            let read = tokio::select! {
                biased;
                () = token.cancelled() => break,
                read = self.read_new() => read,
            };
            let needs_recovery = match read {
                Ok(batch) => self.process_batch(&batch).await,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Reading the order log failed: {_e}");
                    true
                }
            };
            if needs_recovery {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(self.config.retry_backoff) => {}
                }
                self.recover_logged().await;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Order consumer `{}` stopped", self.config.consumer);
    }

    /// Starts the long-lived worker on the current Tokio runtime.
    ///
    /// The worker runs a recovery pass first, then loops on blocking reads.
    /// Any failure or deferral is followed by a short pause and another
    /// recovery pass. It stops between reads once the handle is shut down;
    /// a record already being processed runs to completion.
    pub fn spawn(self) -> ConsumerHandle {
        let token = CancellationToken::new();
        let shutdown_timeout = self.config.shutdown_timeout;
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(Arc::new(self).run(token.clone()));
        ConsumerHandle {
            token,
            task,
            stats,
            shutdown_timeout,
        }
    }
}

impl<S: KvStore, R: OrderRepository> core::fmt::Debug for OrderConsumer<S, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OrderConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Owner of a running [`OrderConsumer`] worker.
#[derive(Debug)]
pub struct ConsumerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<ConsumerStats>,
    shutdown_timeout: core::time::Duration,
}

impl ConsumerHandle {
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the worker and waits for it, up to the configured timeout.
    /// A worker that does not stop in time is aborted.
    pub async fn shutdown(self) {
        self.token.cancel();
        let mut task = self.task;
        match timeout(self.shutdown_timeout, &mut task).await {
            Ok(Ok(())) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Order consumer shut down");
            }
            Ok(Err(_e)) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Order consumer task failed: {_e}");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Order consumer did not stop in time, aborting");
                task.abort();
            }
        }
    }
}
