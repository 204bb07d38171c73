#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate async_trait;

pub mod engine;
pub mod series;
pub mod shard;
pub mod store;
