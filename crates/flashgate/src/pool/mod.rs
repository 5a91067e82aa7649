//! A small, bounded pool of background workers.
//!
//! The pool exists for fire-and-forget work that must not run on the caller's
//! path, chiefly cache rebuilds. Capacity is fixed up front: `workers` tasks,
//! each draining its own bounded queue. Dispatch never waits; when every
//! queue is full the caller gets [`Error::PoolSaturated`](crate::Error) back
//! and decides what to give up.

mod config;
mod manager;
mod worker;

pub use config::*;
pub use manager::*;
pub(crate) use worker::panic_message;
