//! Self-expiring mutual exclusion over the shared store.
//!
//! A lock is a key holding the owner's token, written with set-if-absent and
//! an expiry. Release goes through [`UNLOCK_SCRIPT`], which deletes the key
//! only if it still holds the caller's token, in one atomic step.
//!
//! ```text
//! (free) ── try_acquire(ttl) ──→ held(token) ── release() ──→ (free)
//!                                    │
//!                               ttl elapses ──→ (free)
//! ```
//!
//! The TTL is never extended. If the protected work outlives it, another
//! holder can acquire the key while the first is still running; the first
//! holder's later `release()` is then a no-op and leaves the new holder's
//! lock in place.

mod distributed;

pub use distributed::*;
