//! Per-database series file.
//!
//! The series file is a partitioned append-only log of every series key in
//! a database. Keys are varint-length-prefixed; duplicates are ignored via
//! the key set loaded at open.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::engine::tsm1::varint::{decode_uvarint, encode_uvarint};

/// SERIES_FILE_DIRECTORY is the name of the directory holding a database's
/// series file, beside its retention policy directories.
pub const SERIES_FILE_DIRECTORY: &str = "_series";

/// SERIES_FILE_PARTITION_N is the number of partitions a series file is split into.
pub const SERIES_FILE_PARTITION_N: usize = 8;

struct Partition {
    fd: File,
    existing: HashSet<Vec<u8>>,
}

pub struct SeriesFile {
    dir: PathBuf,
    partitions: Vec<Partition>,
}

impl SeriesFile {
    /// open loads (or creates) the series file under `dir`, reading every
    /// partition's existing keys into memory.
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| anyhow!("series dir {} mkdir error: {}", dir.display(), e))?;

        let mut partitions = Vec::with_capacity(SERIES_FILE_PARTITION_N);
        for i in 0..SERIES_FILE_PARTITION_N {
            let path = dir.join(format!("{:02}", i));
            let existing = match tokio::fs::read(&path).await {
                Ok(buf) => parse_keys(&path, &buf)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
                Err(e) => return Err(anyhow!("series {} read error: {}", path.display(), e)),
            };

            let fd = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| anyhow!("series {} open error: {}", path.display(), e))?;
            partitions.push(Partition { fd, existing });
        }

        Ok(Self { dir, partitions })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn series_count(&self) -> usize {
        self.partitions.iter().map(|p| p.existing.len()).sum()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.partitions[partition_idx(key)].existing.contains(key)
    }

    /// add_series_batch appends the keys of `batch` not already present.
    pub async fn add_series_batch(&mut self, batch: &[Vec<u8>]) -> anyhow::Result<()> {
        let mut bufs: Vec<Vec<u8>> = vec![Vec::new(); SERIES_FILE_PARTITION_N];
        for key in batch {
            let i = partition_idx(key);
            let p = &mut self.partitions[i];
            if p.existing.contains(key) {
                continue;
            }
            encode_uvarint(&mut bufs[i], key.len() as u64);
            bufs[i].extend_from_slice(key);
            p.existing.insert(key.clone());
        }

        for (i, buf) in bufs.iter().enumerate() {
            if buf.is_empty() {
                continue;
            }
            self.partitions[i]
                .fd
                .write_all(buf)
                .await
                .map_err(|e| anyhow!("series partition {:02} write error: {}", i, e))?;
        }
        Ok(())
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        for (i, p) in self.partitions.iter_mut().enumerate() {
            p.fd
                .flush()
                .await
                .map_err(|e| anyhow!("series partition {:02} flush error: {}", i, e))?;
            p.fd
                .sync_all()
                .await
                .map_err(|e| anyhow!("series partition {:02} sync error: {}", i, e))?;
        }
        Ok(())
    }
}

fn partition_idx(key: &[u8]) -> usize {
    crc32fast::hash(key) as usize % SERIES_FILE_PARTITION_N
}

fn parse_keys(path: &Path, buf: &[u8]) -> anyhow::Result<HashSet<Vec<u8>>> {
    let mut out = HashSet::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (len, n) = decode_uvarint(&buf[pos..])
            .map_err(|e| anyhow!("series {} parse error: {}", path.display(), e))?;
        pos += n;
        let len = len as usize;
        if pos + len > buf.len() {
            return Err(anyhow!("series {} truncated key", path.display()));
        }
        out.insert(buf[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(out)
}
