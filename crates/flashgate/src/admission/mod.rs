//! Atomic stock and duplicate-purchase gate.
//!
//! One script call decides a purchase: it checks stock, checks whether the
//! user already bought this voucher, and on success decrements stock, records
//! the user and appends an [`OrderIntent`](crate::OrderIntent) to the order
//! log. The store runs the script without interleaving, which is the only
//! thing that protects the stock counter and the buyer set.

mod controller;
mod script;
#[cfg(test)]
mod tests;

pub use controller::*;
pub use script::*;
