use chrono::Utc;
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::{OrderIntent, OrderRepository, OrderTransaction, VoucherOrder};
use crate::error::{Error, Result};

/// What persisting one intent did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrderOutcome {
    /// The order row was inserted and persisted stock decremented.
    Created,
    /// The user already has an order for this voucher; nothing changed.
    AlreadyExists,
    /// Persisted stock is exhausted (or the voucher is unknown); nothing
    /// changed.
    OutOfStock,
}

/// Persists `intent` in one unit of work: re-check uniqueness, decrement
/// stock only while it is positive, insert the order, commit.
///
/// Safe to run more than once for the same intent; replays end as
/// [`OrderOutcome::AlreadyExists`]. A unique-constraint conflict from the
/// repository is treated the same way.
///
/// # Errors
///
/// Returns repository failures other than
/// [`Error::PersistenceConflict`]. Nothing is committed in that case.
#[cfg_attr(feature = "tracing", instrument(level = "debug", skip(repo)))]
pub async fn create_order<R: OrderRepository>(
    repo: &R,
    intent: &OrderIntent,
) -> Result<OrderOutcome> {
    let mut tx = repo.begin().await?;

    if tx.order_exists(intent.user_id, intent.voucher_id).await? {
        return Ok(OrderOutcome::AlreadyExists);
    }
    if !tx.decrement_stock(intent.voucher_id).await? {
        return Ok(OrderOutcome::OutOfStock);
    }

    let order = VoucherOrder::from_intent(intent, Utc::now());
    let inserted = tx.insert(&order).await;
    let written = match inserted {
        Ok(()) => tx.commit().await,
        Err(e) => Err(e),
    };
    match written {
        Ok(()) => Ok(OrderOutcome::Created),
        Err(Error::PersistenceConflict { context: _context }) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Order {} already persisted: {_context}", intent.order_id);
            Ok(OrderOutcome::AlreadyExists)
        }
        Err(e) => Err(e),
    }
}
