use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::OrderIntent;

/// A voucher on flash sale, as kept by the persistence layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    pub id: u64,
    pub title: String,
    /// Units left in storage. Decremented once per persisted order.
    pub stock: u32,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Voucher {
    /// Where `at` falls relative to the sale window `[begin_time, end_time]`.
    pub fn window_at(&self, at: DateTime<Utc>) -> SaleWindow {
        if at < self.begin_time {
            SaleWindow::NotStarted
        } else if at > self.end_time {
            SaleWindow::Ended
        } else {
            SaleWindow::Open
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaleWindow {
    NotStarted,
    Open,
    Ended,
}

/// A persisted order. `(user_id, voucher_id)` is unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherOrder {
    pub id: i64,
    pub user_id: u64,
    pub voucher_id: u64,
    pub created_at: DateTime<Utc>,
}

impl VoucherOrder {
    pub fn from_intent(intent: &OrderIntent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: intent.order_id,
            user_id: intent.user_id,
            voucher_id: intent.voucher_id,
            created_at,
        }
    }
}
