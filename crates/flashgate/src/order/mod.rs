//! Asynchronous persistence of admitted purchases.
//!
//! ```text
//! appended ──read──→ pending ──persist + ack──→ done
//!                       │  ▲
//!      crash / deferral │  │ recovery pass
//!                       └──┘
//! ```

mod config;
mod consumer;
mod create;
mod intent;
mod model;
mod repository;
mod stats;
#[cfg(test)]
mod tests;

pub use config::*;
pub use consumer::*;
pub use create::*;
pub use intent::*;
pub use model::*;
pub use repository::*;
pub use stats::*;
