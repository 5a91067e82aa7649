use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::instrument;

use super::SECKILL_SCRIPT;
use crate::{
    error::{Error, Result},
    store::KvStore,
};

/// The stream every admitted purchase is appended to.
pub const ORDER_STREAM: &str = "stream.orders";

pub fn stock_key(voucher_id: u64) -> String {
    format!("seckill:stock:{voucher_id}")
}

pub fn buyers_key(voucher_id: u64) -> String {
    format!("seckill:order:{voucher_id}")
}

/// Result of one admission attempt. Rejections are ordinary outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Admission {
    /// Stock was reserved and the order intent appended.
    Accepted,
    /// No stock left.
    SoldOut,
    /// The user was already admitted for this voucher.
    Duplicate,
}

impl Admission {
    /// The script's return code for this outcome.
    pub const fn code(self) -> i64 {
        match self {
            Self::Accepted => 0,
            Self::SoldOut => 1,
            Self::Duplicate => 2,
        }
    }
}

impl TryFrom<i64> for Admission {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::SoldOut),
            2 => Ok(Self::Duplicate),
            code => Err(Error::UnexpectedScriptResult {
                script: SECKILL_SCRIPT.name(),
                code,
            }),
        }
    }
}

/// Runs [`SECKILL_SCRIPT`] against a shared store.
pub struct AdmissionController<S: KvStore> {
    store: Arc<S>,
    stream: String,
}

impl<S: KvStore> AdmissionController<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_stream(store, ORDER_STREAM)
    }

    /// Appends intents to `stream` instead of [`ORDER_STREAM`].
    pub fn with_stream(store: Arc<S>, stream: impl Into<String>) -> Self {
        Self {
            store,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Opens a voucher for sale: sets its stock counter and forgets earlier
    /// buyers.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn publish(&self, voucher_id: u64, stock: u32) -> Result<()> {
        self.store.del(&buyers_key(voucher_id)).await?;
        self.store
            .set(&stock_key(voucher_id), &stock.to_string(), None)
            .await
    }

    /// Returns the stock still available for admission, or `None` if the
    /// voucher was never published.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the counter is
    /// corrupt.
    pub async fn remaining(&self, voucher_id: u64) -> Result<Option<i64>> {
        let key = stock_key(voucher_id);
        self.store
            .get(&key)
            .await?
            .map(|raw| {
                raw.parse()
                    .map_err(|_| Error::store(format!("stock at `{key}` is not an integer")))
            })
            .transpose()
    }

    /// Decides one purchase in a single round trip.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the store fails, in which case nothing was
    /// reserved, or [`Error::UnexpectedScriptResult`] for an unknown code.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn admit(&self, voucher_id: u64, user_id: u64, order_id: i64) -> Result<Admission> {
        let keys = [
            stock_key(voucher_id),
            buyers_key(voucher_id),
            self.stream.clone(),
        ];
        let args = [
            voucher_id.to_string(),
            user_id.to_string(),
            order_id.to_string(),
        ];
        let code = self.store.eval(&SECKILL_SCRIPT, &keys, &args).await?;
        Admission::try_from(code)
    }
}

impl<S: KvStore> core::fmt::Debug for AdmissionController<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}
