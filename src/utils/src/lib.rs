#[macro_use]
extern crate anyhow;

pub mod hash;
pub mod time;
pub mod tpl;
