//! Full compaction.
//!
//! A full compaction rewrites a shard's segment files into the minimum set
//! of maximally-sized segments: the sorted union of keys is merged across
//! all inputs, re-chunked into full blocks and written to `.tsm.tmp`
//! outputs that the driver renames over the originals.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

use common_base::errlist::ErrorList;

use crate::engine::tsm1::reader::TSMReader;
use crate::engine::tsm1::value::Values;
use crate::engine::tsm1::writer::{DefaultTSMWriter, TSMWriter};
use crate::engine::tsm1::{
    parse_tsm_file_name, tsm_file_name, MAX_POINTS_PER_BLOCK, MAX_SEGMENT_SIZE,
    TMP_TSM_FILE_EXTENSION, TOMBSTONE_FILE_EXTENSION, TSM_FILE_EXTENSION,
};

/// Compactor merges a set of segment readers into new segment files.
pub struct Compactor {
    dir: PathBuf,
    max_segment_size: u64,
}

impl Compactor {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_segment_size: MAX_SEGMENT_SIZE,
        }
    }

    #[cfg(test)]
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// compact_full merges all keys across `readers` into `.tsm.tmp` output
    /// files and returns their paths. Inputs are consumed in path order;
    /// on duplicate timestamps the later reader wins.
    pub async fn compact_full(&self, readers: &mut [TSMReader]) -> anyhow::Result<Vec<PathBuf>> {
        if readers.is_empty() {
            return Err(anyhow!("compact_full: no input files"));
        }

        let mut keys: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut max_generation = 0;
        for r in readers.iter() {
            keys.extend(r.keys().map(|k| k.to_vec()));
            if let Some(name) = r.path().file_name().and_then(|n| n.to_str()) {
                if let Ok((generation, _)) = parse_tsm_file_name(name) {
                    max_generation = max_generation.max(generation);
                }
            }
        }

        let generation = max_generation + 1;
        let mut sequence = 1;
        let mut out_paths = Vec::new();
        let mut writer: Option<DefaultTSMWriter> = None;

        for key in keys {
            let mut merged: Option<Values> = None;
            for r in readers.iter_mut() {
                let values = match r.read_values(&key, i64::MIN, i64::MAX).await? {
                    Some(v) => v,
                    None => continue,
                };
                merged = Some(match merged {
                    Some(acc) => acc.merge(values)?,
                    None => values,
                });
            }
            let merged = match merged {
                Some(v) => v,
                None => continue,
            };

            for chunk in merged.chunk(MAX_POINTS_PER_BLOCK) {
                if writer.is_none() {
                    let path = self.tmp_path(generation, sequence);
                    sequence += 1;
                    out_paths.push(path.clone());
                    writer = Some(DefaultTSMWriter::new(&path).await?);
                }

                let w = writer.as_mut().unwrap();
                w.write(&key, &chunk).await?;

                if w.size() > self.max_segment_size {
                    let mut w = writer.take().unwrap();
                    w.write_index().await?;
                    w.close().await?;
                }
            }
        }

        if let Some(mut w) = writer {
            w.write_index().await?;
            w.close().await?;
        }

        if out_paths.is_empty() {
            return Err(anyhow!("compact_full: no data to compact"));
        }
        Ok(out_paths)
    }

    fn tmp_path(&self, generation: u32, sequence: u32) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            tsm_file_name(generation, sequence),
            TMP_TSM_FILE_EXTENSION
        ))
    }
}

/// ShardCompactor drives a full compaction of one shard directory.
pub struct ShardCompactor {
    path: PathBuf,
    tsm: Vec<PathBuf>,
    tombstone: Vec<PathBuf>,
    readers: Vec<TSMReader>,
    new_tsm: Vec<PathBuf>,
}

impl std::fmt::Debug for ShardCompactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCompactor")
            .field("path", &self.path)
            .field("tsm", &self.tsm)
            .field("tombstone", &self.tombstone)
            .field("new_tsm", &self.new_tsm)
            .finish()
    }
}

impl ShardCompactor {
    /// new globs the shard's segment and tombstone files and opens every
    /// segment under a bounded concurrency limit. Segments that fail to
    /// open are removed from disk and skipped; a shard with no good
    /// segments left is an error.
    pub async fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut tsm = glob_extension(&path, TSM_FILE_EXTENSION).await?;
        if tsm.is_empty() {
            return Err(anyhow!("no tsm files at path {}", path.display()));
        }
        tsm.sort();

        let tombstone = glob_extension(&path, TOMBSTONE_FILE_EXTENSION).await?;

        let mut sc = Self {
            path,
            tsm,
            tombstone,
            readers: Vec::new(),
            new_tsm: Vec::new(),
        };
        sc.open_files().await?;
        Ok(sc)
    }

    async fn open_files(&mut self) -> anyhow::Result<()> {
        // Ensure a limited number of TSM files are loaded at once.
        // Systems which have very large datasets (1TB+) can have thousands
        // of TSM files which can cause extremely long load times.
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(1);
        let limit = Arc::new(Semaphore::new(parallelism));

        let mut handles = Vec::with_capacity(self.tsm.len());
        for file in &self.tsm {
            let file = file.clone();
            let limit = limit.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limit.acquire().await.unwrap();
                let res = TSMReader::open(&file).await;
                (file, res)
            }));
        }

        let mut good = Vec::with_capacity(self.tsm.len());
        for handle in handles {
            let (file, res) = handle.await.map_err(|e| anyhow!(e))?;
            match res {
                Ok(reader) => {
                    good.push(file);
                    self.readers.push(reader);
                }
                Err(e) => {
                    // The file is unreadable: drop it from the shard and
                    // continue without it.
                    warn!("cannot read tsm file: {}, error: {}", file.display(), e);
                    tokio::fs::remove_file(&file).await.map_err(|re| {
                        anyhow!("cannot remove corrupt tsm file {}: {}", file.display(), re)
                    })?;
                }
            }
        }

        if good.is_empty() {
            return Err(anyhow!("no good tsm files at path {}", self.path.display()));
        }

        self.readers.sort_by(|a, b| a.path().cmp(b.path()));
        self.tsm = good;
        Ok(())
    }

    /// compact_shard runs the full compaction and replaces the shard's
    /// files with the outputs.
    pub async fn compact_shard(&mut self) -> anyhow::Result<()> {
        let compactor = Compactor::new(&self.path);
        let tmp_files = compactor.compact_full(&mut self.readers).await?;
        self.replace(tmp_files).await
    }

    /// new_tsm returns the renamed output files of a completed compaction.
    pub fn new_tsm(&self) -> &[PathBuf] {
        &self.new_tsm
    }

    /// replace renames the temporary output files over the shard and
    /// removes the original segments and tombstones. Removal errors are
    /// collected, not fatal to the rename.
    async fn replace(&mut self, tmp_files: Vec<PathBuf>) -> anyhow::Result<()> {
        // rename .tsm.tmp -> .tsm
        let mut new_names = Vec::with_capacity(tmp_files.len());
        for file in tmp_files {
            let new_name = file.with_extension("");
            tokio::fs::rename(&file, &new_name)
                .await
                .map_err(|e| anyhow!("rename {} error: {}", file.display(), e))?;
            new_names.push(new_name);
        }

        let mut errs = ErrorList::new();

        // close all readers
        for r in self.readers.drain(..) {
            errs.add(r.close().await);
        }

        // remove existing .tsm and .tombstone
        for file in self.tsm.drain(..) {
            errs.add(
                tokio::fs::remove_file(&file)
                    .await
                    .map_err(|e| anyhow!("remove {} error: {}", file.display(), e)),
            );
        }
        for file in self.tombstone.drain(..) {
            errs.add(
                tokio::fs::remove_file(&file)
                    .await
                    .map_err(|e| anyhow!("remove {} error: {}", file.display(), e)),
            );
        }

        self.new_tsm = new_names;
        errs.err()
    }
}

async fn glob_extension(dir: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| anyhow!("read dir {} error: {}", dir.display(), e))?;

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| anyhow!(e))? {
        let path = entry.path();
        if path.extension().map(|e| e == extension).unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(out)
}
