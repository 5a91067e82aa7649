use core::time::Duration;

use crate::{
    cache::CacheConfig, order::ConsumerConfig, pool::PoolConfig, time::DEFAULT_EPOCH_SECS,
};

/// Everything a [`FlashSale`](crate::FlashSale) node needs to know.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashSaleConfig {
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub consumer: ConsumerConfig,
    /// Physical expiry of cached vouchers.
    pub voucher_cache_ttl: Duration,
    /// Epoch of minted order ids, in seconds since the Unix epoch.
    pub id_epoch_secs: u64,
}

impl Default for FlashSaleConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            consumer: ConsumerConfig::default(),
            voucher_cache_ttl: Duration::from_secs(30 * 60),
            id_epoch_secs: DEFAULT_EPOCH_SECS,
        }
    }
}

impl FlashSaleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_voucher_cache_ttl(mut self, ttl: Duration) -> Self {
        self.voucher_cache_ttl = ttl;
        self
    }

    pub fn with_id_epoch_secs(mut self, epoch_secs: u64) -> Self {
        self.id_epoch_secs = epoch_secs;
        self
    }
}
