//! Key-value store abstraction shared by every component.
//!
//! [`KvStore`] is the contract the rest of the crate is written against:
//! strings with optional expiry, set-if-absent, atomic increments, atomic
//! [`Script`]s, and an append-only log with consumer groups and pending
//! lists. [`MemoryStore`] implements all of it in-process.

mod interface;
mod memory;
#[cfg(test)]
mod tests;

pub use interface::*;
pub use memory::*;
