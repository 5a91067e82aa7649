use core::time::Duration;

/// Sizing of a [`RebuildPool`](crate::RebuildPool).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker tasks. Values below 1 are treated as 1.
    pub workers: usize,
    /// Capacity of each worker's queue.
    pub queue_capacity: usize,
    /// How long `shutdown` waits for each worker to acknowledge.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 64,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
