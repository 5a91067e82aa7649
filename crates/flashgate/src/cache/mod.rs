//! Cache facade with penetration and breakdown protection.

mod client;
mod config;
mod loader;
mod value;

pub use client::*;
pub use config::*;
pub use loader::*;
pub use value::*;
