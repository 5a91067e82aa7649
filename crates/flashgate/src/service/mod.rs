//! One flash-sale node: the building blocks wired into a purchase path.

mod config;
mod flash_sale;

pub use config::*;
pub use flash_sale::*;
