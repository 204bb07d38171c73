//! On-disk inverted index builder.
//!
//! Builds the per-shard `index/` directory mapping each measurement to the
//! sorted series keys it owns, so a target instance can serve tag queries
//! without a full series-file scan.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use bytes::BufMut;
use tokio::io::AsyncWriteExt;

use common_base::key::parse_key;

use crate::engine::tsm1::varint::encode_uvarint;

/// INDEX_DIRECTORY is the name of the index directory inside a shard.
pub const INDEX_DIRECTORY: &str = "index";

/// INDEX_FILE is the measurement table file inside the index directory.
pub const INDEX_FILE: &str = "series.idx";

/// SeriesIndexBuilder accumulates the measurement -> series mapping of one
/// shard and writes it as a single table file on close.
pub struct SeriesIndexBuilder {
    shard_path: PathBuf,
    measurements: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
}

impl SeriesIndexBuilder {
    pub fn new(shard_path: impl AsRef<Path>) -> Self {
        Self {
            shard_path: shard_path.as_ref().to_path_buf(),
            measurements: BTreeMap::new(),
        }
    }

    /// add_series records a series key under its parsed measurement.
    pub fn add_series(&mut self, series_key: &[u8]) -> anyhow::Result<()> {
        let (name, _) = parse_key(series_key)?;
        self.measurements
            .entry(name)
            .or_default()
            .insert(series_key.to_vec());
        Ok(())
    }

    /// close writes the index file:
    /// per measurement `| name len (u16) | name | series count (u32) |`
    /// followed by each varint-length-prefixed series key.
    pub async fn close(self) -> anyhow::Result<()> {
        let dir = self.shard_path.join(INDEX_DIRECTORY);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| anyhow!("index dir {} mkdir error: {}", dir.display(), e))?;

        let mut buf = Vec::new();
        for (name, series) in &self.measurements {
            buf.put_u16(name.len() as u16);
            buf.extend_from_slice(name);
            buf.put_u32(series.len() as u32);
            for key in series {
                encode_uvarint(&mut buf, key.len() as u64);
                buf.extend_from_slice(key);
            }
        }

        let path = dir.join(INDEX_FILE);
        let mut fd = tokio::fs::File::create(&path)
            .await
            .map_err(|e| anyhow!("index {} create error: {}", path.display(), e))?;
        fd.write_all(&buf).await.map_err(|e| anyhow!(e))?;
        fd.sync_all().await.map_err(|e| anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_index() {
        let dir = tempfile::tempdir().unwrap();

        let mut b = SeriesIndexBuilder::new(dir.path());
        b.add_series(b"cpu,host=b").unwrap();
        b.add_series(b"cpu,host=a").unwrap();
        b.add_series(b"cpu,host=a").unwrap();
        b.add_series(b"mem,host=a").unwrap();
        b.close().await.unwrap();

        let buf = tokio::fs::read(dir.path().join(INDEX_DIRECTORY).join(INDEX_FILE))
            .await
            .unwrap();

        // first table: cpu with two sorted series
        assert_eq!(&buf[..2], &[0, 3]);
        assert_eq!(&buf[2..5], b"cpu");
        assert_eq!(&buf[5..9], &[0, 0, 0, 2]);
        assert_eq!(buf[9] as usize, "cpu,host=a".len());
        assert_eq!(&buf[10..20], b"cpu,host=a");
    }
}
