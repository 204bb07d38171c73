#[macro_use]
extern crate anyhow;

pub mod binary;
pub mod exporter;
pub mod importer;
pub mod plan;

/// PIPE_BUFFER_SIZE is the bounded in-memory pipe capacity between one
/// export worker and one import worker.
pub const PIPE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// READER_CHANNEL_CAPACITY is how many pending pipe readers may queue per
/// target node before the exporter blocks.
pub const READER_CHANNEL_CAPACITY: usize = 4;
