use core::time::Duration;

use crate::admission::ORDER_STREAM;

/// Settings for an [`OrderConsumer`](crate::OrderConsumer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Stream the admission script appends to.
    pub stream: String,
    /// Consumer group shared by every process.
    pub group: String,
    /// This process's name within the group. Recovery replays only the
    /// records delivered to this name, so it must survive restarts.
    pub consumer: String,
    /// Longest a read waits for new records.
    pub block: Duration,
    /// Records taken per read.
    pub batch_size: usize,
    /// Expiry of the per-user lock held while an order is persisted.
    pub lock_ttl: Duration,
    /// Pause before a recovery pass that follows a failure or deferral.
    pub retry_backoff: Duration,
    /// How long shutdown waits for the worker to stop.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream: ORDER_STREAM.to_string(),
            group: "g1".to_string(),
            consumer: "c1".to_string(),
            block: Duration::from_secs(2),
            batch_size: 1,
            lock_ttl: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
