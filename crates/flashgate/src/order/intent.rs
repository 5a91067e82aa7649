use crate::{
    error::{Error, Result},
    store::StreamEntry,
};

/// Log field holding the order id.
pub const FIELD_ORDER_ID: &str = "id";
/// Log field holding the buyer's user id.
pub const FIELD_USER_ID: &str = "userId";
/// Log field holding the voucher id.
pub const FIELD_VOUCHER_ID: &str = "voucherId";

/// An admitted purchase waiting to be persisted.
///
/// Written to the order log by the admission script as three flat fields and
/// read back by the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OrderIntent {
    pub order_id: i64,
    pub user_id: u64,
    pub voucher_id: u64,
}

impl OrderIntent {
    pub const fn new(order_id: i64, user_id: u64, voucher_id: u64) -> Self {
        Self {
            order_id,
            user_id,
            voucher_id,
        }
    }

    /// The intent as log fields, in the order the admission script writes
    /// them.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_ORDER_ID.to_string(), self.order_id.to_string()),
            (FIELD_USER_ID.to_string(), self.user_id.to_string()),
            (FIELD_VOUCHER_ID.to_string(), self.voucher_id.to_string()),
        ]
    }

    /// Decodes a log record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRecord`] if a field is missing or is not a
    /// number.
    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        Ok(Self {
            order_id: parse_field(entry, FIELD_ORDER_ID)?,
            user_id: parse_field(entry, FIELD_USER_ID)?,
            voucher_id: parse_field(entry, FIELD_VOUCHER_ID)?,
        })
    }
}

fn parse_field<N: core::str::FromStr>(entry: &StreamEntry, name: &str) -> Result<N> {
    let malformed = |reason: String| Error::MalformedRecord {
        id: entry.id.to_string(),
        reason,
    };
    entry
        .field(name)
        .ok_or_else(|| malformed(format!("missing field `{name}`")))?
        .parse()
        .map_err(|_| malformed(format!("field `{name}` is not a number")))
}
