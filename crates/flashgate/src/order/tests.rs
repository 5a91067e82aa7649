use crate::{
    Admission, AdmissionController, ConsumerConfig, DistributedLock, EntryId, Error, KvStore,
    MemoryRepository, MemoryStore, MemoryTransaction, ORDER_STREAM, OrderConsumer, OrderIntent,
    OrderOutcome, OrderRepository, OrderTransaction, Processed, ReadOffset, RecoveryReport,
    Result, SaleWindow, StreamEntry, Voucher, VoucherOrder, VoucherRepository, create_order,
};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

const VOUCHER: u64 = 10;

fn voucher(stock: u32) -> Voucher {
    let now = Utc::now();
    Voucher {
        id: VOUCHER,
        title: "Half-price hotpot".to_string(),
        stock,
        begin_time: now - TimeDelta::hours(1),
        end_time: now + TimeDelta::hours(1),
    }
}

fn config() -> ConsumerConfig {
    ConsumerConfig::default()
        .with_block(Duration::from_millis(50))
        .with_retry_backoff(Duration::from_millis(10))
}

struct Fixture {
    store: Arc<MemoryStore>,
    repo: Arc<MemoryRepository>,
    gate: AdmissionController<MemoryStore>,
}

impl Fixture {
    async fn new(stock: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(MemoryRepository::new());
        repo.save_voucher(&voucher(stock)).await.unwrap();
        let gate = AdmissionController::new(Arc::clone(&store));
        gate.publish(VOUCHER, stock).await.unwrap();
        Self { store, repo, gate }
    }

    fn consumer(&self) -> OrderConsumer<MemoryStore, MemoryRepository> {
        OrderConsumer::new(Arc::clone(&self.store), Arc::clone(&self.repo), config())
    }

    async fn admit(&self, user_id: u64, order_id: i64) {
        assert_eq!(
            self.gate.admit(VOUCHER, user_id, order_id).await.unwrap(),
            Admission::Accepted
        );
    }

    /// Takes delivery of new records as `c1` without processing them, as a
    /// process that crashes right after reading would.
    async fn read_and_crash(&self) -> Vec<StreamEntry> {
        self.store
            .xread_group(ORDER_STREAM, "g1", "c1", ReadOffset::NewEntries, 100, None)
            .await
            .unwrap()
    }
}

fn entry(fields: &[(&str, &str)]) -> StreamEntry {
    StreamEntry {
        id: EntryId::new(1, 0),
        fields: fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    }
}

async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: core::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[test]
fn intent_fields() {
    let intent = OrderIntent::new(9_001, 42, VOUCHER);
    let decoded = OrderIntent::from_entry(&StreamEntry {
        id: EntryId::new(5, 1),
        fields: intent.to_fields(),
    })
    .unwrap();
    assert_eq!(decoded, intent);

    let missing = OrderIntent::from_entry(&entry(&[("id", "1"), ("userId", "2")])).unwrap_err();
    assert!(matches!(missing, Error::MalformedRecord { ref id, .. } if id == "1-0"));
    let garbled = OrderIntent::from_entry(&entry(&[
        ("id", "1"),
        ("userId", "bob"),
        ("voucherId", "3"),
    ]))
    .unwrap_err();
    assert!(matches!(garbled, Error::MalformedRecord { .. }));
}

#[test]
fn sale_window() {
    let v = voucher(1);
    assert_eq!(v.window_at(Utc::now()), SaleWindow::Open);
    assert_eq!(v.window_at(v.begin_time - TimeDelta::seconds(1)), SaleWindow::NotStarted);
    assert_eq!(v.window_at(v.end_time + TimeDelta::seconds(1)), SaleWindow::Ended);
}

#[tokio::test]
async fn create_order_is_idempotent() {
    let repo = MemoryRepository::new();
    repo.save_voucher(&voucher(3)).await.unwrap();
    let intent = OrderIntent::new(1, 7, VOUCHER);

    assert_eq!(create_order(&repo, &intent).await.unwrap(), OrderOutcome::Created);
    assert_eq!(
        create_order(&repo, &intent).await.unwrap(),
        OrderOutcome::AlreadyExists
    );
    // A second intent for the same buyer with a different id is refused too.
    assert_eq!(
        create_order(&repo, &OrderIntent::new(2, 7, VOUCHER)).await.unwrap(),
        OrderOutcome::AlreadyExists
    );

    assert_eq!(repo.order_count().await, 1);
    assert_eq!(repo.stock(VOUCHER).await, Some(2));
    let orders = repo.orders().await;
    assert_eq!((orders[0].id, orders[0].user_id), (1, 7));
}

#[tokio::test]
async fn create_order_stops_at_zero_stock() {
    let repo = MemoryRepository::new();
    repo.save_voucher(&voucher(1)).await.unwrap();

    assert_eq!(
        create_order(&repo, &OrderIntent::new(1, 1, VOUCHER)).await.unwrap(),
        OrderOutcome::Created
    );
    assert_eq!(
        create_order(&repo, &OrderIntent::new(2, 2, VOUCHER)).await.unwrap(),
        OrderOutcome::OutOfStock
    );
    assert_eq!(
        create_order(&repo, &OrderIntent::new(3, 3, 999)).await.unwrap(),
        OrderOutcome::OutOfStock
    );
    assert_eq!(repo.stock(VOUCHER).await, Some(0));
    assert_eq!(repo.order_count().await, 1);
}

#[tokio::test]
async fn dropped_transaction_rolls_back() {
    let repo = MemoryRepository::new();
    repo.save_voucher(&voucher(5)).await.unwrap();
    {
        let mut tx = repo.begin().await.unwrap();
        assert!(tx.decrement_stock(VOUCHER).await.unwrap());
        tx.insert(&VoucherOrder::from_intent(&OrderIntent::new(1, 1, VOUCHER), Utc::now()))
            .await
            .unwrap();
        assert!(tx.order_exists(1, VOUCHER).await.unwrap());
    }
    assert_eq!(repo.stock(VOUCHER).await, Some(5));
    assert_eq!(repo.order_count().await, 0);
}

#[tokio::test]
async fn unique_constraint_rejects_second_insert() {
    let repo = MemoryRepository::new();
    let mut tx = repo.begin().await.unwrap();
    let first = VoucherOrder::from_intent(&OrderIntent::new(1, 1, VOUCHER), Utc::now());
    let same_buyer = VoucherOrder::from_intent(&OrderIntent::new(2, 1, VOUCHER), Utc::now());
    let same_id = VoucherOrder::from_intent(&OrderIntent::new(1, 2, VOUCHER), Utc::now());

    tx.insert(&first).await.unwrap();
    assert!(matches!(
        tx.insert(&same_buyer).await,
        Err(Error::PersistenceConflict { .. })
    ));
    assert!(matches!(
        tx.insert(&same_id).await,
        Err(Error::PersistenceConflict { .. })
    ));
    tx.commit().await.unwrap();
    assert_eq!(repo.order_count().await, 1);
}

#[tokio::test]
async fn processed_record_is_persisted_then_acked() {
    let fx = Fixture::new(5).await;
    let consumer = fx.consumer();
    consumer.ensure_group().await.unwrap();
    fx.admit(1, 100).await;

    let entries = fx.read_and_crash().await;
    assert_eq!(consumer.pending().await.unwrap(), 1);

    let processed = consumer.process_entry(&entries[0]).await.unwrap();
    assert_eq!(processed, Processed::Acked(OrderOutcome::Created));
    assert_eq!(consumer.pending().await.unwrap(), 0);
    assert_eq!(fx.repo.stock(VOUCHER).await, Some(4));
    assert_eq!(consumer.stats().snapshot().created, 1);
}

#[tokio::test]
async fn recovery_replays_an_unacked_record_exactly_once() {
    let fx = Fixture::new(5).await;
    fx.consumer().ensure_group().await.unwrap();
    fx.admit(1, 100).await;
    fx.admit(2, 101).await;

    // The first process reads both records and dies before acknowledging.
    assert_eq!(fx.read_and_crash().await.len(), 2);

    // Its replacement, under the same consumer name, recovers them.
    let restarted = fx.consumer();
    let report = restarted.recover_pending().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            replayed: 2,
            acked: 2,
            deferred: 0,
            failed: 0
        }
    );
    assert_eq!(restarted.pending().await.unwrap(), 0);
    assert_eq!(fx.repo.order_count().await, 2);

    let again = restarted.recover_pending().await.unwrap();
    assert_eq!(again, RecoveryReport::default());
    assert_eq!(fx.repo.order_count().await, 2);
    assert_eq!(restarted.stats().snapshot().replayed, 2);
}

#[tokio::test]
async fn lock_contention_defers_to_the_next_pass() {
    let fx = Fixture::new(5).await;
    let consumer = fx.consumer();
    consumer.ensure_group().await.unwrap();
    fx.admit(7, 100).await;
    let entries = fx.read_and_crash().await;

    let other = DistributedLock::new(Arc::clone(&fx.store), "lock:order:7");
    assert!(other.try_acquire(Duration::from_secs(10)).await.unwrap());

    assert_eq!(
        consumer.process_entry(&entries[0]).await.unwrap(),
        Processed::Deferred
    );
    // The pass walks past the deferred record instead of retrying it forever.
    let blocked = consumer.recover_pending().await.unwrap();
    assert_eq!((blocked.replayed, blocked.deferred), (1, 1));
    assert_eq!(consumer.pending().await.unwrap(), 1);
    assert_eq!(fx.repo.order_count().await, 0);

    assert!(other.release().await.unwrap());
    let report = consumer.recover_pending().await.unwrap();
    assert_eq!((report.replayed, report.acked), (1, 1));
    assert_eq!(consumer.pending().await.unwrap(), 0);
    assert_eq!(fx.repo.order_count().await, 1);
    assert_eq!(consumer.stats().snapshot().deferred, 2);
}

#[tokio::test]
async fn duplicate_intents_persist_one_order() {
    let fx = Fixture::new(5).await;
    let consumer = fx.consumer();
    consumer.ensure_group().await.unwrap();

    // Bypass admission: the same buyer reaches the log twice.
    for order_id in [100, 101] {
        fx.store
            .xadd(ORDER_STREAM, &OrderIntent::new(order_id, 7, VOUCHER).to_fields())
            .await
            .unwrap();
    }
    let entries = fx.read_and_crash().await;
    let outcomes: Vec<_> = {
        let mut out = Vec::new();
        for entry in &entries {
            out.push(consumer.process_entry(entry).await.unwrap());
        }
        out
    };

    assert_eq!(
        outcomes,
        [
            Processed::Acked(OrderOutcome::Created),
            Processed::Acked(OrderOutcome::AlreadyExists)
        ]
    );
    assert_eq!(consumer.pending().await.unwrap(), 0);
    assert_eq!(fx.repo.order_count().await, 1);
    assert_eq!(fx.repo.stock(VOUCHER).await, Some(4));
}

#[tokio::test]
async fn malformed_record_stays_pending() {
    let fx = Fixture::new(5).await;
    let consumer = fx.consumer();
    consumer.ensure_group().await.unwrap();
    fx.store
        .xadd(ORDER_STREAM, &[("userId".to_string(), "1".to_string())])
        .await
        .unwrap();
    let entries = fx.read_and_crash().await;

    assert!(matches!(
        consumer.process_entry(&entries[0]).await,
        Err(Error::MalformedRecord { .. })
    ));
    assert_eq!(consumer.pending().await.unwrap(), 1);
    let report = consumer.recover_pending().await.unwrap();
    assert_eq!((report.replayed, report.failed), (1, 1));
}

/// Fails the first `failures` transactions, then behaves.
struct FlakyRepository {
    inner: MemoryRepository,
    failures: AtomicUsize,
}

#[async_trait]
impl OrderRepository for FlakyRepository {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::persistence("connection reset"));
        }
        self.inner.begin().await
    }
}

#[tokio::test]
async fn persistence_failure_leaves_record_for_recovery() {
    let fx = Fixture::new(5).await;
    let flaky = Arc::new(FlakyRepository {
        inner: (*fx.repo).clone(),
        failures: AtomicUsize::new(1),
    });
    let consumer = OrderConsumer::new(Arc::clone(&fx.store), Arc::clone(&flaky), config());
    consumer.ensure_group().await.unwrap();
    fx.admit(3, 100).await;
    let entries = fx.read_and_crash().await;

    assert!(matches!(
        consumer.process_entry(&entries[0]).await,
        Err(Error::Persistence { .. })
    ));
    assert_eq!(consumer.pending().await.unwrap(), 1);
    // The lock was released despite the failure.
    assert!(fx.store.get("lock:order:3").await.unwrap().is_none());

    let report = consumer.recover_pending().await.unwrap();
    assert_eq!(report.acked, 1);
    assert_eq!(fx.repo.order_count().await, 1);
}

/// Panics inside the first transaction it is asked for, then behaves.
struct PanickingRepository {
    inner: MemoryRepository,
    panics: AtomicUsize,
}

#[async_trait]
impl OrderRepository for PanickingRepository {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let armed = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            panic!("connection pool poisoned");
        }
        self.inner.begin().await
    }
}

fn panicking(fx: &Fixture) -> Arc<PanickingRepository> {
    Arc::new(PanickingRepository {
        inner: (*fx.repo).clone(),
        panics: AtomicUsize::new(1),
    })
}

#[tokio::test]
async fn panicking_unit_of_work_releases_the_lock() {
    let fx = Fixture::new(5).await;
    let consumer = OrderConsumer::new(Arc::clone(&fx.store), panicking(&fx), config());
    consumer.ensure_group().await.unwrap();
    fx.admit(4, 100).await;
    let entries = fx.read_and_crash().await;

    assert!(matches!(
        consumer.process_entry(&entries[0]).await,
        Err(Error::TaskPanicked { .. })
    ));
    assert!(fx.store.get("lock:order:4").await.unwrap().is_none());
    assert_eq!(consumer.pending().await.unwrap(), 1);

    let report = consumer.recover_pending().await.unwrap();
    assert_eq!(report.acked, 1);
    assert_eq!(fx.repo.order_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_consumer_survives_a_panicking_record() {
    let fx = Fixture::new(5).await;
    let handle = OrderConsumer::new(Arc::clone(&fx.store), panicking(&fx), config()).spawn();

    fx.admit(1, 100).await;
    let store = Arc::clone(&fx.store);
    eventually(|| {
        let store = Arc::clone(&store);
        async move { store.xpending(ORDER_STREAM, "g1").await.is_ok() }
    })
    .await;
    fx.admit(2, 101).await;

    let repo = Arc::clone(&fx.repo);
    eventually(|| {
        let repo = Arc::clone(&repo);
        async move { repo.order_count().await == 2 }
    })
    .await;
    assert!(!handle.is_finished());

    let stats = handle.stats();
    handle.shutdown().await;
    assert_eq!(stats.snapshot().failed, 1);
    assert_eq!(stats.snapshot().created, 2);
    assert_eq!(fx.store.xpending(ORDER_STREAM, "g1").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_consumer_drains_the_log() {
    let fx = Fixture::new(5).await;
    let handle = fx.consumer().spawn();

    for user in 0..20 {
        let _ = fx.gate.admit(VOUCHER, user, 1_000 + user as i64).await.unwrap();
    }

    let repo = Arc::clone(&fx.repo);
    eventually(|| {
        let repo = Arc::clone(&repo);
        async move { repo.order_count().await == 5 }
    })
    .await;
    let store = Arc::clone(&fx.store);
    eventually(|| {
        let store = Arc::clone(&store);
        async move { store.xpending(ORDER_STREAM, "g1").await.unwrap() == 0 }
    })
    .await;
    assert_eq!(fx.repo.stock(VOUCHER).await, Some(0));

    let stats = handle.stats();
    handle.shutdown().await;
    assert_eq!(stats.snapshot().created, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_consumer_recovers_on_start() {
    let fx = Fixture::new(5).await;
    fx.consumer().ensure_group().await.unwrap();
    fx.admit(1, 100).await;
    fx.read_and_crash().await;

    let handle = fx.consumer().spawn();
    let repo = Arc::clone(&fx.repo);
    eventually(|| {
        let repo = Arc::clone(&repo);
        async move { repo.order_count().await == 1 }
    })
    .await;
    let stats = handle.stats();
    handle.shutdown().await;
    assert_eq!(stats.snapshot().replayed, 1);
    assert_eq!(fx.store.xpending(ORDER_STREAM, "g1").await.unwrap(), 0);
}

#[tokio::test]
async fn shutdown_stops_an_idle_consumer() {
    let fx = Fixture::new(1).await;
    let handle = OrderConsumer::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.repo),
        config().with_block(Duration::from_secs(30)),
    )
    .spawn();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_finished());

    let started = std::time::Instant::now();
    handle.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
}
