use core::time::Duration;

/// Tuning for a [`CacheClient`](crate::CacheClient).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Expiry of the empty sentinel written for ids the loader cannot find.
    pub null_ttl: Duration,
    /// Expiry of the per-key lock held while a logical-expiry rebuild runs.
    pub rebuild_lock_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            null_ttl: Duration::from_secs(120),
            rebuild_lock_ttl: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_null_ttl(mut self, ttl: Duration) -> Self {
        self.null_ttl = ttl;
        self
    }

    pub fn with_rebuild_lock_ttl(mut self, ttl: Duration) -> Self {
        self.rebuild_lock_ttl = ttl;
        self
    }
}
