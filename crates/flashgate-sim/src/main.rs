#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use core::time::Duration;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::Parser;
use config::{CliArgs, SimConfig};
use flashgate::{Caller, FlashSale, MemoryRepository, MemoryStore, PurchaseOutcome, Voucher};
use portable_atomic::{AtomicU64, Ordering};
use telemetry::{TelemetryProviders, init_telemetry};
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type Node = FlashSale<MemoryStore, MemoryRepository>;

/// Purchase outcomes seen by the buyer tasks.
#[derive(Debug, Default)]
struct Tally {
    accepted: AtomicU64,
    sold_out: AtomicU64,
    duplicate: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl Tally {
    fn record(&self, outcome: &PurchaseOutcome) {
        let counter = match outcome {
            PurchaseOutcome::Accepted { .. } => &self.accepted,
            PurchaseOutcome::SoldOut => &self.sold_out,
            PurchaseOutcome::Duplicate => &self.duplicate,
            PurchaseOutcome::NotFound | PurchaseOutcome::NotStarted | PurchaseOutcome::Ended => {
                &self.rejected
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        telemetry::record_admission(outcome);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = SimConfig::try_from(args)?;

    let providers = init_telemetry()?;

    log_startup_info(&config);

    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let node: Arc<Node> = Arc::new(FlashSale::new(
        store,
        Arc::clone(&repo),
        config.flash_sale.clone(),
    ));

    let res = tokio::select! {
        res = run(&node, &repo, &config) => res,
        () = shutdown_signal() => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Interrupted before the sale was settled");
            Ok(())
        }
    };

    if let Err(_e) = node.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Error during node shutdown: {:?}", _e);
    }

    flush(providers);
    res
}

async fn run(node: &Arc<Node>, repo: &MemoryRepository, config: &SimConfig) -> anyhow::Result<()> {
    let now = Utc::now();
    let sale_window =
        chrono::Duration::from_std(config.sale_window).context("sale window out of range")?;
    let voucher = Voucher {
        id: config.voucher_id,
        title: format!("Flash voucher #{}", config.voucher_id),
        stock: config.stock,
        begin_time: now - chrono::Duration::seconds(1),
        end_time: now + sale_window,
    };

    node.publish_voucher(&voucher).await?;
    node.start().await?;

    let tally = Arc::new(Tally::default());
    let _started = std::time::Instant::now();

    // Repeat buyers come straight after the first wave so their retries race
    // the consumer persisting their first order.
    let attempts = (1..=config.buyers).chain(1..=config.repeat_buyers);
    let handles: Vec<_> = attempts
        .map(|user_id| {
            let node = Arc::clone(node);
            let tally = Arc::clone(&tally);
            let voucher_id = config.voucher_id;
            tokio::spawn(async move {
                match node.purchase(&Caller::new(user_id), voucher_id).await {
                    Ok(outcome) => tally.record(&outcome),
                    Err(_e) => {
                        tally.errors.fetch_add(1, Ordering::Relaxed);
                        #[cfg(feature = "tracing")]
                        tracing::error!("Purchase by user {} failed: {}", user_id, _e);
                    }
                }
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        result.context("buyer task panicked")?;
    }

    let accepted = tally.accepted.load(Ordering::Relaxed);

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Burst finished in {:?}: {} accepted, {} sold out, {} duplicate, {} rejected, {} errors",
        _started.elapsed(),
        accepted,
        tally.sold_out.load(Ordering::Relaxed),
        tally.duplicate.load(Ordering::Relaxed),
        tally.rejected.load(Ordering::Relaxed),
        tally.errors.load(Ordering::Relaxed),
    );

    let expected = usize::try_from(accepted).context("accepted count out of range")?;
    tokio::time::timeout(config.drain_timeout, drain(node, repo, expected))
        .await
        .with_context(|| {
            format!(
                "orders not settled within {:?}",
                config.drain_timeout
            )
        })??;

    if let Some(stats) = node.consumer_stats() {
        let stats = stats.snapshot();
        telemetry::increment_orders_persisted(stats.created);
        telemetry::increment_intents_deferred(stats.deferred);
        telemetry::increment_recovery_replays(stats.replayed);

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Settled in {:?}: consumer stats {:?}",
            _started.elapsed(),
            stats
        );
    }

    settle(repo, config, accepted).await
}

/// Waits until the consumer has acknowledged everything and `expected`
/// orders are stored.
async fn drain(node: &Node, repo: &MemoryRepository, expected: usize) -> anyhow::Result<()> {
    loop {
        let pending = node.pending_orders().await?;
        let persisted = repo.order_count().await;
        if pending == 0 && persisted >= expected {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Waiting on the consumer: {} pending, {}/{} persisted",
            pending,
            persisted,
            expected
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Checks that stored stock and stored orders agree with what was admitted.
async fn settle(repo: &MemoryRepository, config: &SimConfig, accepted: u64) -> anyhow::Result<()> {
    let orders = repo.orders().await;
    let remaining = repo
        .stock(config.voucher_id)
        .await
        .context("voucher vanished from the repository")?;

    if accepted > u64::from(config.stock) {
        bail!(
            "oversold: {} admitted against {} units",
            accepted,
            config.stock
        );
    }

    if u64::try_from(orders.len()).unwrap_or(u64::MAX) != accepted {
        bail!(
            "{} orders stored but {} were admitted",
            orders.len(),
            accepted
        );
    }

    let expected_stock = u64::from(config.stock) - accepted;
    if u64::from(remaining) != expected_stock {
        bail!(
            "stored stock is {} but {} units should remain",
            remaining,
            expected_stock
        );
    }

    let mut buyers: Vec<u64> = orders.iter().map(|order| order.user_id).collect();
    buyers.sort_unstable();
    buyers.dedup();
    if buyers.len() != orders.len() {
        bail!("a buyer holds more than one order");
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Books balance: {} orders, {} units left",
        orders.len(),
        remaining
    );
    Ok(())
}

fn log_startup_info(_config: &SimConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting flash-sale simulation with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting flash-sale simulation: {} buyers ({} repeating) for {} units",
            _config.buyers,
            _config.repeat_buyers,
            _config.stock
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to install SIGTERM handler: {}", _e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }
}

fn flush(_providers: TelemetryProviders) {
    #[cfg(feature = "metrics")]
    {
        if let Err(err) = _providers.meter_provider.force_flush() {
            eprintln!("Error flushing metrics: {:#?}", err);
        }
        if let Err(err) = _providers.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {:#?}", err);
        }
    }
}
