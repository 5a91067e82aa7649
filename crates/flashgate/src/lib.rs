#![doc = include_str!("../README.md")]

mod admission;
mod cache;
mod error;
mod id;
mod lock;
mod order;
mod pool;
mod service;
mod store;
mod time;

pub use crate::admission::*;
pub use crate::cache::*;
pub use crate::error::*;
pub use crate::id::*;
pub use crate::lock::*;
pub use crate::order::*;
pub use crate::pool::*;
pub use crate::service::*;
pub use crate::store::*;
pub use crate::time::*;
