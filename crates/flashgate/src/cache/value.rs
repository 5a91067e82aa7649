use serde::{Deserialize, Serialize};

/// A cached payload stamped with its logical expiry.
///
/// The store keeps the blob physically forever; `expire_at` (milliseconds
/// since the Unix epoch) only tells readers when a rebuild is due, so stale
/// data stays readable while a fresh copy is loaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedValue<V> {
    pub data: V,
    pub expire_at: u64,
}

impl<V> CachedValue<V> {
    pub const fn new(data: V, expire_at: u64) -> Self {
        Self { data, expire_at }
    }

    pub const fn is_expired(&self, now_millis: u64) -> bool {
        self.expire_at <= now_millis
    }
}
