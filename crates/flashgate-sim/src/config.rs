use core::time::Duration;

use anyhow::bail;
use clap::Parser;
use flashgate::{CacheConfig, ConsumerConfig, FlashSaleConfig, PoolConfig};

/// Runtime configuration for the `flashgate-sim` binary.
///
/// One run publishes a single voucher, fires a burst of concurrent purchase
/// attempts at it and waits for every admitted order to be persisted. All
/// values are parsed from CLI arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "flashgate-sim",
    version,
    about = "Fires a burst of buyers at one flash-sale voucher and checks the books balance"
)]
pub struct CliArgs {
    /// Identifier of the voucher put on sale.
    ///
    /// Environment variable: `VOUCHER_ID`
    #[arg(long, env = "VOUCHER_ID", default_value_t = 1)]
    pub voucher_id: u64,

    /// Units available for sale.
    ///
    /// Environment variable: `STOCK`
    #[arg(long, env = "STOCK", default_value_t = 100)]
    pub stock: u32,

    /// Number of distinct buyers. Each makes one purchase attempt.
    ///
    /// Environment variable: `BUYERS`
    #[arg(long, env = "BUYERS", default_value_t = 1_000)]
    pub buyers: u64,

    /// Number of buyers that try a second time. Every retry must be refused
    /// as a duplicate or as sold out.
    ///
    /// Environment variable: `REPEAT_BUYERS`
    #[arg(long, env = "REPEAT_BUYERS", default_value_t = 50)]
    pub repeat_buyers: u64,

    /// Length of the sale window, starting now.
    ///
    /// Environment variable: `SALE_WINDOW_SECS`
    #[arg(long, env = "SALE_WINDOW_SECS", default_value_t = 3_600)]
    pub sale_window_secs: u64,

    /// Workers of the background cache rebuild pool. Defaults to the number
    /// of logical CPUs.
    ///
    /// Environment variable: `REBUILD_WORKERS`
    #[arg(long, env = "REBUILD_WORKERS")]
    pub rebuild_workers: Option<usize>,

    /// Queued rebuilds per worker before new ones are refused.
    ///
    /// Environment variable: `REBUILD_QUEUE`
    #[arg(long, env = "REBUILD_QUEUE", default_value_t = 64)]
    pub rebuild_queue: usize,

    /// How long one consumer read waits for new order intents.
    ///
    /// Environment variable: `CONSUMER_BLOCK_MS`
    #[arg(long, env = "CONSUMER_BLOCK_MS", default_value_t = 200)]
    pub consumer_block_ms: u64,

    /// Expiry of the per-buyer lock held while an order is persisted.
    ///
    /// Environment variable: `ORDER_LOCK_TTL_MS`
    #[arg(long, env = "ORDER_LOCK_TTL_MS", default_value_t = 10_000)]
    pub order_lock_ttl_ms: u64,

    /// Upper bound on waiting for the consumer to persist every admitted
    /// order.
    ///
    /// Environment variable: `DRAIN_TIMEOUT_SECS`
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub voucher_id: u64,
    pub stock: u32,
    pub buyers: u64,
    pub repeat_buyers: u64,
    pub sale_window: Duration,
    pub drain_timeout: Duration,
    pub flash_sale: FlashSaleConfig,
}

impl TryFrom<CliArgs> for SimConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.buyers == 0 {
            bail!("BUYERS must be greater than 0");
        }

        if args.repeat_buyers > args.buyers {
            bail!(
                "REPEAT_BUYERS ({}) exceeds BUYERS ({})",
                args.repeat_buyers,
                args.buyers
            );
        }

        if args.sale_window_secs == 0 {
            bail!("SALE_WINDOW_SECS must be greater than 0");
        }

        let rebuild_workers = args.rebuild_workers.unwrap_or_else(num_cpus::get);
        if rebuild_workers == 0 {
            bail!("REBUILD_WORKERS must be greater than 0");
        }

        if args.rebuild_queue == 0 {
            bail!("REBUILD_QUEUE must be greater than 0");
        }

        if args.order_lock_ttl_ms == 0 {
            bail!("ORDER_LOCK_TTL_MS must be greater than 0");
        }

        let flash_sale = FlashSaleConfig::new()
            .with_cache(CacheConfig::new())
            .with_pool(
                PoolConfig::new()
                    .with_workers(rebuild_workers)
                    .with_queue_capacity(args.rebuild_queue),
            )
            .with_consumer(
                ConsumerConfig::new()
                    .with_block(Duration::from_millis(args.consumer_block_ms))
                    .with_lock_ttl(Duration::from_millis(args.order_lock_ttl_ms)),
            );

        Ok(Self {
            voucher_id: args.voucher_id,
            stock: args.stock,
            buyers: args.buyers,
            repeat_buyers: args.repeat_buyers,
            sale_window: Duration::from_secs(args.sale_window_secs),
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
            flash_sale,
        })
    }
}
