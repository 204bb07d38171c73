#[macro_use]
extern crate anyhow;

mod client;
mod data;

pub use client::{MetaClient, META_FILE};
pub use data::{
    Data, DatabaseInfo, RetentionPolicyInfo, RetentionPolicySpec, ShardGroupInfo, ShardInfo,
    MIN_RETENTION_POLICY_DURATION,
};
