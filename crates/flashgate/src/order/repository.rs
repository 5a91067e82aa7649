use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Voucher, VoucherOrder};
use crate::error::{Error, Result};

/// Read and seed access to vouchers.
#[async_trait]
pub trait VoucherRepository: Send + Sync + 'static {
    async fn find_voucher(&self, voucher_id: u64) -> Result<Option<Voucher>>;

    /// Inserts or replaces a voucher.
    async fn save_voucher(&self, voucher: &Voucher) -> Result<()>;
}

/// Transactional access to orders and persisted stock.
#[async_trait]
pub trait OrderRepository: Send + Sync + 'static {
    type Transaction: OrderTransaction;

    /// Opens a unit of work. Nothing it does is visible to others until
    /// [`OrderTransaction::commit`]; dropping it rolls everything back.
    async fn begin(&self) -> Result<Self::Transaction>;
}

/// One unit of work against the order tables.
#[async_trait]
pub trait OrderTransaction: Send {
    /// Whether an order for `(user_id, voucher_id)` exists.
    async fn order_exists(&mut self, user_id: u64, voucher_id: u64) -> Result<bool>;

    /// Decrements the voucher's stock if it is above zero. Returns `false`
    /// (and changes nothing) for zero stock or an unknown voucher.
    async fn decrement_stock(&mut self, voucher_id: u64) -> Result<bool>;

    /// Inserts an order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PersistenceConflict`] if the order id or the
    /// `(user_id, voucher_id)` pair is already taken.
    async fn insert(&mut self, order: &VoucherOrder) -> Result<()>;

    async fn commit(self) -> Result<()>
    where
        Self: Sized;
}

#[derive(Debug, Default)]
struct Tables {
    vouchers: HashMap<u64, Voucher>,
    orders: HashMap<i64, VoucherOrder>,
    buyers: HashSet<(u64, u64)>,
}

/// An in-process repository.
///
/// Transactions are serialized: [`begin`](OrderRepository::begin) waits for
/// the previous transaction to finish, and changes are buffered until
/// commit.
#[derive(Clone, Debug, Default)]
pub struct MemoryRepository {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted order, sorted by id.
    pub async fn orders(&self) -> Vec<VoucherOrder> {
        let mut orders: Vec<_> = self.tables.lock().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }

    /// Persisted stock of a voucher.
    pub async fn stock(&self, voucher_id: u64) -> Option<u32> {
        self.tables
            .lock()
            .await
            .vouchers
            .get(&voucher_id)
            .map(|v| v.stock)
    }
}

#[async_trait]
impl VoucherRepository for MemoryRepository {
    async fn find_voucher(&self, voucher_id: u64) -> Result<Option<Voucher>> {
        Ok(self.tables.lock().await.vouchers.get(&voucher_id).cloned())
    }

    async fn save_voucher(&self, voucher: &Voucher) -> Result<()> {
        self.tables
            .lock()
            .await
            .vouchers
            .insert(voucher.id, voucher.clone());
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for MemoryRepository {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction {
            tables: Arc::clone(&self.tables).lock_owned().await,
            decrements: HashMap::new(),
            inserts: Vec::new(),
        })
    }
}

/// A [`MemoryRepository`] unit of work. Holds the tables exclusively until
/// committed or dropped.
pub struct MemoryTransaction {
    tables: OwnedMutexGuard<Tables>,
    decrements: HashMap<u64, u32>,
    inserts: Vec<VoucherOrder>,
}

impl MemoryTransaction {
    fn staged_stock(&self, voucher_id: u64) -> Option<u32> {
        let stock = self.tables.vouchers.get(&voucher_id)?.stock;
        let taken = self.decrements.get(&voucher_id).copied().unwrap_or(0);
        Some(stock.saturating_sub(taken))
    }
}

#[async_trait]
impl OrderTransaction for MemoryTransaction {
    async fn order_exists(&mut self, user_id: u64, voucher_id: u64) -> Result<bool> {
        let key = (user_id, voucher_id);
        Ok(self.tables.buyers.contains(&key)
            || self
                .inserts
                .iter()
                .any(|o| (o.user_id, o.voucher_id) == key))
    }

    async fn decrement_stock(&mut self, voucher_id: u64) -> Result<bool> {
        match self.staged_stock(voucher_id) {
            Some(stock) if stock > 0 => {
                *self.decrements.entry(voucher_id).or_default() += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert(&mut self, order: &VoucherOrder) -> Result<()> {
        if self.order_exists(order.user_id, order.voucher_id).await? {
            return Err(Error::PersistenceConflict {
                context: format!(
                    "order for user {} and voucher {} already exists",
                    order.user_id, order.voucher_id
                ),
            });
        }
        if self.tables.orders.contains_key(&order.id) || self.inserts.iter().any(|o| o.id == order.id)
        {
            return Err(Error::PersistenceConflict {
                context: format!("order id {} already exists", order.id),
            });
        }
        self.inserts.push(order.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        let Self {
            tables,
            decrements,
            inserts,
        } = &mut self;
        for (voucher_id, taken) in decrements.drain() {
            if let Some(voucher) = tables.vouchers.get_mut(&voucher_id) {
                voucher.stock = voucher.stock.saturating_sub(taken);
            }
        }
        for order in inserts.drain(..) {
            tables.buyers.insert((order.user_id, order.voucher_id));
            tables.orders.insert(order.id, order);
        }
        Ok(())
    }
}
