use std::sync::Arc;

use chrono::{DateTime, Utc};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{Error, Result},
    id::CompositeId,
    store::KvStore,
    time::{DEFAULT_EPOCH_SECS, SystemClock, TimeSource},
};

/// Store-backed generator of [`CompositeId`]s.
///
/// Each call reads the local clock for the timestamp half and atomically
/// increments a per-(tag, day) counter in the shared store for the sequence
/// half. Because the counter lives in the store, any number of processes can
/// mint ids for the same tag without coordinating with each other: two calls
/// never receive the same counter value on the same day, so their ids differ
/// even when they land in the same second.
///
/// The counter key rolls over at UTC midnight, which keeps counters small and
/// doubles as a per-day volume statistic.
///
/// ## Caveats
/// - A host clock that steps backwards produces smaller timestamps. Ids stay
///   unique (the counter still increments) but are no longer ordered.
/// - At most 2^32 ids per tag per day; past that [`Error::SequenceExhausted`]
///   is returned instead of letting the counter spill into the timestamp.
pub struct IdGenerator<S, T = SystemClock>
where
    S: KvStore,
    T: TimeSource,
{
    store: Arc<S>,
    clock: T,
    epoch_secs: u64,
}

impl<S: KvStore> IdGenerator<S, SystemClock> {
    /// Creates a generator on the host clock and [`DEFAULT_EPOCH_SECS`].
    pub fn new(store: Arc<S>) -> Self {
        Self::with_epoch(store, SystemClock, DEFAULT_EPOCH_SECS)
    }
}

impl<S, T> IdGenerator<S, T>
where
    S: KvStore,
    T: TimeSource,
{
    /// Creates a generator whose timestamps count from `epoch_secs` (seconds
    /// since the Unix epoch).
    pub fn with_epoch(store: Arc<S>, clock: T, epoch_secs: u64) -> Self {
        Self {
            store,
            clock,
            epoch_secs,
        }
    }

    pub const fn epoch_secs(&self) -> u64 {
        self.epoch_secs
    }

    /// Returns the counter key for `tag` on the UTC day containing
    /// `unix_secs`: `counter:<tag>:<yyyy:MM:dd>`.
    pub fn counter_key(tag: &str, unix_secs: u64) -> String {
        let day = i64::try_from(unix_secs)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .format("%Y:%m:%d");
        format!("counter:{tag}:{day}")
    }

    /// Mints the next id for `tag`.
    ///
    /// # Errors
    ///
    /// - [`Error::ClockBeforeEpoch`] if the clock reads before the epoch.
    /// - [`Error::SequenceExhausted`] once the day's counter passes 2^32 - 1.
    /// - Any store error from the increment.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn next_id(&self, tag: &str) -> Result<CompositeId> {
        let now_secs = self.clock.current_secs();
        let elapsed = now_secs
            .checked_sub(self.epoch_secs)
            .ok_or(Error::ClockBeforeEpoch)?;

        let key = Self::counter_key(tag, now_secs);
        let counter = self.store.incr(&key).await?;
        let sequence = u64::try_from(counter)
            .ok()
            .filter(|seq| *seq <= CompositeId::SEQUENCE_MASK)
            .ok_or_else(|| Error::SequenceExhausted { key: key.clone() })?;

        Ok(CompositeId::from_components(elapsed, sequence))
    }
}
