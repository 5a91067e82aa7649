use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::FlashSaleConfig;
use crate::{
    admission::{Admission, AdmissionController},
    cache::{CacheClient, Loader, cache_key},
    error::Result,
    id::IdGenerator,
    order::{
        ConsumerHandle, ConsumerStats, OrderConsumer, OrderRepository, SaleWindow, Voucher,
        VoucherRepository,
    },
    pool::RebuildPool,
    store::KvStore,
    time::{SystemClock, TimeSource},
};

/// Key prefix of cached vouchers; the full key is `cache:voucher:<id>`.
pub const VOUCHER_CACHE_PREFIX: &str = "cache:voucher:";

/// Tag of the order id counter.
pub const ORDER_ID_TAG: &str = "order";

/// The authenticated buyer making a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Caller {
    pub user_id: u64,
}

impl Caller {
    pub const fn new(user_id: u64) -> Self {
        Self { user_id }
    }
}

/// Answer to a purchase attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PurchaseOutcome {
    /// Admitted. The order is persisted asynchronously under `order_id`.
    Accepted { order_id: i64 },
    SoldOut,
    /// The caller already holds an order for this voucher.
    Duplicate,
    /// No such voucher.
    NotFound,
    NotStarted,
    Ended,
}

impl PurchaseOutcome {
    pub const fn order_id(&self) -> Option<i64> {
        match self {
            Self::Accepted { order_id } => Some(*order_id),
            _ => None,
        }
    }
}

/// Loads vouchers for the cache from the repository.
struct VoucherLoader<R> {
    repo: Arc<R>,
}

#[async_trait]
impl<R: VoucherRepository> Loader<u64, Voucher> for VoucherLoader<R> {
    async fn load(&self, id: &u64) -> Result<Option<Voucher>> {
        self.repo.find_voucher(*id).await
    }
}

/// A flash-sale node.
///
/// A purchase reads the voucher through the cache, checks the sale window,
/// mints an order id, and asks the admission gate. Admitted purchases return
/// at once; the order consumer started by [`start`](Self::start) persists
/// them in the background.
pub struct FlashSale<S, R, T = SystemClock>
where
    S: KvStore,
    R: OrderRepository + VoucherRepository,
    T: TimeSource + Clone,
{
    store: Arc<S>,
    repo: Arc<R>,
    clock: T,
    config: FlashSaleConfig,
    ids: IdGenerator<S, T>,
    admission: AdmissionController<S>,
    cache: CacheClient<S, T>,
    pool: Arc<RebuildPool>,
    voucher_loader: VoucherLoader<R>,
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl<S, R> FlashSale<S, R, SystemClock>
where
    S: KvStore,
    R: OrderRepository + VoucherRepository,
{
    /// Builds a node on the host clock. Must be called inside a Tokio
    /// runtime (the rebuild pool starts its workers here).
    pub fn new(store: Arc<S>, repo: Arc<R>, config: FlashSaleConfig) -> Self {
        Self::with_clock(store, repo, SystemClock, config)
    }
}

impl<S, R, T> FlashSale<S, R, T>
where
    S: KvStore,
    R: OrderRepository + VoucherRepository,
    T: TimeSource + Clone,
{
    pub fn with_clock(store: Arc<S>, repo: Arc<R>, clock: T, config: FlashSaleConfig) -> Self {
        let pool = Arc::new(RebuildPool::new(&config.pool));
        Self {
            ids: IdGenerator::with_epoch(Arc::clone(&store), clock.clone(), config.id_epoch_secs),
            admission: AdmissionController::with_stream(
                Arc::clone(&store),
                config.consumer.stream.clone(),
            ),
            cache: CacheClient::with_config(
                Arc::clone(&store),
                Arc::clone(&pool),
                clock.clone(),
                config.cache.clone(),
            ),
            voucher_loader: VoucherLoader {
                repo: Arc::clone(&repo),
            },
            consumer: Mutex::new(None),
            store,
            repo,
            clock,
            config,
            pool,
        }
    }

    pub fn config(&self) -> &FlashSaleConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn admission(&self) -> &AdmissionController<S> {
        &self.admission
    }

    pub fn cache(&self) -> &CacheClient<S, T> {
        &self.cache
    }

    /// Saves `voucher`, opens it for admission with its full stock and warms
    /// its cache entry.
    ///
    /// # Errors
    ///
    /// Returns repository, store or encoding failures.
    pub async fn publish_voucher(&self, voucher: &Voucher) -> Result<()> {
        self.repo.save_voucher(voucher).await?;
        self.admission.publish(voucher.id, voucher.stock).await?;
        self.cache
            .set(
                &cache_key("voucher", voucher.id),
                voucher,
                self.config.voucher_cache_ttl,
            )
            .await?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Published voucher {} with {} units, {} to {}",
            voucher.id,
            voucher.stock,
            voucher.begin_time,
            voucher.end_time
        );
        Ok(())
    }

    /// Saves changed voucher details, then drops the cached copy. Admission
    /// stock is not touched.
    ///
    /// # Errors
    ///
    /// Returns repository or store failures.
    pub async fn update_voucher(&self, voucher: &Voucher) -> Result<()> {
        self.repo.save_voucher(voucher).await?;
        self.cache
            .invalidate(&cache_key("voucher", voucher.id))
            .await?;
        Ok(())
    }

    /// Attempts one purchase for `caller`.
    ///
    /// The order id is minted before the admission check, so rejected
    /// attempts consume ids too.
    ///
    /// # Errors
    ///
    /// Store or repository failures. No order was admitted in that case.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), fields(user = caller.user_id)))]
    pub async fn purchase(&self, caller: &Caller, voucher_id: u64) -> Result<PurchaseOutcome> {
        let voucher: Option<Voucher> = self
            .cache
            .get_with_pass_through(
                VOUCHER_CACHE_PREFIX,
                voucher_id,
                &self.voucher_loader,
                self.config.voucher_cache_ttl,
            )
            .await?;
        let Some(voucher) = voucher else {
            return Ok(PurchaseOutcome::NotFound);
        };

        match voucher.window_at(self.now()) {
            SaleWindow::NotStarted => return Ok(PurchaseOutcome::NotStarted),
            SaleWindow::Ended => return Ok(PurchaseOutcome::Ended),
            SaleWindow::Open => {}
        }

        let order_id = self.ids.next_id(ORDER_ID_TAG).await?.to_i64();
        let outcome = match self
            .admission
            .admit(voucher_id, caller.user_id, order_id)
            .await?
        {
            Admission::Accepted => PurchaseOutcome::Accepted { order_id },
            Admission::SoldOut => PurchaseOutcome::SoldOut,
            Admission::Duplicate => PurchaseOutcome::Duplicate,
        };
        Ok(outcome)
    }

    /// Number of admitted orders delivered to the consumer but not yet
    /// persisted and acknowledged.
    ///
    /// # Errors
    ///
    /// Returns store failures, including a missing group before
    /// [`start`](Self::start).
    pub async fn pending_orders(&self) -> Result<usize> {
        self.store
            .xpending(&self.config.consumer.stream, &self.config.consumer.group)
            .await
    }

    /// Starts the order consumer. Calling it again while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a store error if the consumer group cannot be created.
    pub async fn start(&self) -> Result<()> {
        if self.consumer.lock().is_some() {
            return Ok(());
        }
        let consumer = OrderConsumer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.repo),
            self.config.consumer.clone(),
        );
        consumer.ensure_group().await?;

        let handle = consumer.spawn();
        let surplus = {
            let mut slot = self.consumer.lock();
            if slot.is_none() {
                *slot = Some(handle);
                None
            } else {
                Some(handle)
            }
        };
        // Lost a race with another `start`; the first worker stays.
        if let Some(handle) = surplus {
            handle.shutdown().await;
        }
        Ok(())
    }

    /// Statistics of the running consumer, if started.
    pub fn consumer_stats(&self) -> Option<Arc<ConsumerStats>> {
        self.consumer.lock().as_ref().map(ConsumerHandle::stats)
    }

    /// Stops the order consumer, then drains the rebuild pool.
    ///
    /// # Errors
    ///
    /// Currently infallible; mirrors [`RebuildPool::shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.pool.shutdown().await
    }

    fn now(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.clock.current_millis()).unwrap_or(i64::MAX);
        DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
