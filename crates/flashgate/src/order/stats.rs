use portable_atomic::{AtomicU64, Ordering};

/// Running totals kept by an [`OrderConsumer`](crate::OrderConsumer).
#[derive(Debug, Default)]
pub struct ConsumerStats {
    created: AtomicU64,
    already_existed: AtomicU64,
    out_of_stock: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
    replayed: AtomicU64,
}

/// A point-in-time copy of [`ConsumerStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub created: u64,
    pub already_existed: u64,
    pub out_of_stock: u64,
    pub deferred: u64,
    pub failed: u64,
    pub replayed: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            already_existed: self.already_existed.load(Ordering::Relaxed),
            out_of_stock: self.out_of_stock.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_already_existed(&self) {
        self.already_existed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_out_of_stock(&self) {
        self.out_of_stock.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }
}
