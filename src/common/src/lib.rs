#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate anyhow;

pub mod errlist;
pub mod escape;
pub mod iterator;
pub mod key;

/// MIN_NANO_TIME is the minimum time representable as a point timestamp.
pub const MIN_NANO_TIME: i64 = i64::MIN + 2;

/// MAX_NANO_TIME is the maximum time representable as a point timestamp.
pub const MAX_NANO_TIME: i64 = i64::MAX - 1;
