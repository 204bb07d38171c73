//! Per-shard series writers.
//!
//! Both variants expose `add_series` / `close` and flush into the shared
//! database series file; the index variant additionally builds the shard's
//! on-disk inverted index. The mode is chosen at shard-open time and never
//! changes mid-shard. Deduplication within the shard is the writer's
//! responsibility.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::series::series_file::SeriesFile;
use crate::series::series_index::SeriesIndexBuilder;

/// SERIES_BATCH_SIZE is how many keys the in-memory writer buffers before
/// appending them to the series file.
pub const SERIES_BATCH_SIZE: usize = 1000;

pub enum SeriesWriter {
    InMem(InMemSeriesWriter),
    Index(IndexSeriesWriter),
}

impl SeriesWriter {
    /// new_in_mem batches series keys straight into the series file.
    pub fn new_in_mem(sfile: Arc<Mutex<SeriesFile>>) -> Self {
        Self::InMem(InMemSeriesWriter {
            sfile,
            seen: HashSet::new(),
            batch: Vec::with_capacity(SERIES_BATCH_SIZE),
        })
    }

    /// new_index additionally drives the shard's inverted-index builder.
    pub fn new_index(sfile: Arc<Mutex<SeriesFile>>, shard_path: impl AsRef<Path>) -> Self {
        Self::Index(IndexSeriesWriter {
            inner: InMemSeriesWriter {
                sfile,
                seen: HashSet::new(),
                batch: Vec::with_capacity(SERIES_BATCH_SIZE),
            },
            builder: SeriesIndexBuilder::new(shard_path),
        })
    }

    pub async fn add_series(&mut self, key: &[u8]) -> anyhow::Result<()> {
        match self {
            Self::InMem(w) => w.add_series(key).await,
            Self::Index(w) => w.add_series(key).await,
        }
    }

    pub async fn close(self) -> anyhow::Result<()> {
        match self {
            Self::InMem(w) => w.close().await,
            Self::Index(w) => w.close().await,
        }
    }
}

pub struct InMemSeriesWriter {
    sfile: Arc<Mutex<SeriesFile>>,
    seen: HashSet<Vec<u8>>,
    batch: Vec<Vec<u8>>,
}

impl InMemSeriesWriter {
    async fn add_series(&mut self, key: &[u8]) -> anyhow::Result<()> {
        if !self.seen.insert(key.to_vec()) {
            return Ok(());
        }

        self.batch.push(key.to_vec());
        if self.batch.len() >= SERIES_BATCH_SIZE {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut sfile = self.sfile.lock().await;
        sfile.add_series_batch(&self.batch).await?;
        self.batch.clear();
        Ok(())
    }

    async fn close(mut self) -> anyhow::Result<()> {
        self.flush().await
    }
}

pub struct IndexSeriesWriter {
    inner: InMemSeriesWriter,
    builder: SeriesIndexBuilder,
}

impl IndexSeriesWriter {
    async fn add_series(&mut self, key: &[u8]) -> anyhow::Result<()> {
        if self.inner.seen.contains(key) {
            return Ok(());
        }
        self.builder.add_series(key)?;
        self.inner.add_series(key).await
    }

    async fn close(self) -> anyhow::Result<()> {
        self.inner.close().await?;
        self.builder.close().await
    }
}
