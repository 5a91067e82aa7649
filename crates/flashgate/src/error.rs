//! Error types for the flash-sale building blocks.
//!
//! This module defines the central [`Error`] enum. Expected business outcomes
//! are *not* errors: a sold-out voucher, a duplicate purchase or a missing
//! entity are returned as typed values ([`Admission`], [`PurchaseOutcome`],
//! `Ok(None)`). What remains here are the failures a caller may want to log,
//! retry or surface as a generic failure.
//!
//! ## Error Cases
//! - `Store`: the shared key-value store failed (network, script, state).
//!   Safe to retry: lock and admission primitives are idempotent or
//!   self-expiring.
//! - `WrongType`: a key holds a value of a different shape than requested.
//! - `Serialization`: a cached payload could not be encoded or decoded.
//! - `MalformedRecord`: a log record does not decode into an order intent.
//! - `PersistenceConflict`: a unique constraint rejected an insert. The order
//!   unit of work treats this as a benign no-op.
//! - `LockUnavailable`: a lock is held by someone else; callers pick the
//!   policy (skip, return stale, defer).
//! - `Loader` / `TaskPanicked`: a rebuild loader or an order unit of work
//!   failed at a task boundary. The work is logged and retried later.
//! - `PoolSaturated` / `ServiceShutdown`: background capacity is exhausted or
//!   being torn down.
//!
//! [`Admission`]: crate::Admission
//! [`PurchaseOutcome`]: crate::PurchaseOutcome

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for the flash-sale building blocks.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The shared store rejected or failed an operation.
    #[error("Store error: {context}")]
    Store { context: String },

    /// The key exists but holds a different kind of value.
    #[error("Wrong value type for key `{key}`")]
    WrongType { key: String },

    /// A cached payload failed to (de)serialize.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The wall clock reads earlier than the configured id epoch.
    #[error("Clock is before the id epoch")]
    ClockBeforeEpoch,

    /// The per-day counter no longer fits into the 32 sequence bits.
    #[error("Sequence exhausted for `{key}`")]
    SequenceExhausted { key: String },

    /// A script returned a code outside its documented range.
    #[error("Unexpected result {code} from script `{script}`")]
    UnexpectedScriptResult { script: &'static str, code: i64 },

    /// A log record could not be decoded.
    #[error("Malformed record {id}: {reason}")]
    MalformedRecord { id: String, reason: String },

    /// The persistence collaborator failed.
    #[error("Persistence error: {context}")]
    Persistence { context: String },

    /// A unique constraint rejected the write.
    #[error("Persistence conflict: {context}")]
    PersistenceConflict { context: String },

    /// The lock is currently owned by another holder.
    #[error("Lock `{key}` is held by another owner")]
    LockUnavailable { key: String },

    /// A loader failed or panicked during a background cache rebuild.
    #[error("Loader error: {context}")]
    Loader { context: String },

    /// A unit of work panicked. Whatever it was holding is left for a retry.
    #[error("Task panicked: {context}")]
    TaskPanicked { context: String },

    /// Every rebuild worker queue is full.
    #[error("Background pool is saturated")]
    PoolSaturated,

    /// The component is shutting down and refuses new work.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Shorthand for [`Error::Store`].
    pub fn store(context: impl Into<String>) -> Self {
        Self::Store {
            context: context.into(),
        }
    }

    /// Shorthand for [`Error::Persistence`].
    pub fn persistence(context: impl Into<String>) -> Self {
        Self::Persistence {
            context: context.into(),
        }
    }

    /// Returns `true` for failures that may succeed when retried unchanged.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::LockUnavailable { .. } | Self::PoolSaturated
        )
    }
}
