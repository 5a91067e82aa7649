use core::fmt;

/// A time-ordered 64-bit identifier.
///
/// ```text
///  Bit Index:  63                 32 31                  0
///              +---------------------+---------------------+
///  Field:      | elapsed secs (32)   | daily counter (32)  |
///              +---------------------+---------------------+
///              |<----- MSB ------------------- LSB ------->|
/// ```
///
/// - The upper half holds whole seconds elapsed since the generator's epoch.
/// - The lower half holds the per-(tag, day) counter taken from the store.
///
/// Ids compare by their raw value, so an id minted in a later second always
/// sorts after one minted earlier, whatever the counters were.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeId(u64);

impl CompositeId {
    pub const TIMESTAMP_BITS: u32 = 32;
    pub const SEQUENCE_BITS: u32 = 32;
    pub const SEQUENCE_MASK: u64 = (1 << Self::SEQUENCE_BITS) - 1;

    /// Composes an id. Bits of `sequence` beyond the lower 32 are discarded;
    /// the generator refuses to produce such counters in the first place.
    pub const fn from_components(elapsed_secs: u64, sequence: u64) -> Self {
        Self((elapsed_secs << Self::SEQUENCE_BITS) | (sequence & Self::SEQUENCE_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Seconds since the epoch the id was minted against.
    pub const fn timestamp(&self) -> u64 {
        self.0 >> Self::SEQUENCE_BITS
    }

    /// The daily counter value.
    pub const fn sequence(&self) -> u64 {
        self.0 & Self::SEQUENCE_MASK
    }

    pub const fn to_raw(&self) -> u64 {
        self.0
    }

    /// The id as a signed 64-bit integer, the representation used for
    /// persisted order ids. Ids minted within ~68 years of the epoch are
    /// non-negative.
    pub const fn to_i64(&self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<CompositeId> for i64 {
    fn from(id: CompositeId) -> Self {
        id.to_i64()
    }
}
