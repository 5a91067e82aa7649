mod composite;
mod generator;

pub use composite::*;
pub use generator::*;
