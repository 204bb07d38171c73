//! Shard writer.
//!
//! A shard writer owns one shard directory and materializes its segment
//! files. Output is written to auto-numbered `.tsm.tmp` files that are
//! renamed to `.tsm` on a successful close; an aborted writer removes its
//! temporaries and leaves the directory as it found it.

use std::path::{Path, PathBuf};

use common_base::errlist::ErrorList;

use crate::engine::tsm1::writer::{DefaultTSMWriter, TSMWriter};
use crate::engine::tsm1::value::Values;
use crate::engine::tsm1::{
    parse_tsm_file_name, tsm_file_name, MAX_SEGMENT_SIZE, TMP_TSM_FILE_EXTENSION,
    TSM_FILE_EXTENSION,
};

pub struct ShardWriter {
    id: u64,
    path: PathBuf,
    generation: u32,
    sequence: u32,
    tw: Option<DefaultTSMWriter>,
    tmp_files: Vec<PathBuf>,
    max_segment_size: u64,
}

impl ShardWriter {
    /// new creates a writer for shard `id` under `shards_path`. Numbering
    /// continues after any segment files already present in the directory.
    pub async fn new(id: u64, shards_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = shards_path.as_ref().join(id.to_string());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| anyhow!("shard dir {} mkdir error: {}", path.display(), e))?;

        let generation = next_generation(&path).await?;
        Ok(Self {
            id,
            path,
            generation,
            sequence: 1,
            tw: None,
            tmp_files: Vec::new(),
            max_segment_size: MAX_SEGMENT_SIZE,
        })
    }

    pub fn shard_id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// write appends a block of values for the composite key. Keys must
    /// arrive in non-decreasing order within the shard.
    pub async fn write(&mut self, key: &[u8], values: &Values) -> anyhow::Result<()> {
        if self.tw.is_none() {
            let file = self.path.join(format!(
                "{}.{}",
                tsm_file_name(self.generation, self.sequence),
                TMP_TSM_FILE_EXTENSION
            ));
            self.sequence += 1;
            self.tmp_files.push(file.clone());
            self.tw = Some(DefaultTSMWriter::new(&file).await?);
        }

        let tw = self.tw.as_mut().unwrap();
        tw.write(key, values).await?;

        if tw.size() > self.max_segment_size {
            let mut tw = self.tw.take().unwrap();
            tw.write_index().await?;
            tw.close().await?;
        }
        Ok(())
    }

    /// close finalizes the open segment and renames every `.tsm.tmp` to its
    /// final `.tsm` name.
    pub async fn close(mut self) -> anyhow::Result<()> {
        if let Some(mut tw) = self.tw.take() {
            if tw.key_count() == 0 {
                self.tmp_files.pop();
                tw.remove().await?;
            } else {
                tw.write_index().await?;
                tw.close().await?;
            }
        }

        for file in &self.tmp_files {
            let new_name = file.with_extension("");
            tokio::fs::rename(file, &new_name)
                .await
                .map_err(|e| anyhow!("rename {} error: {}", file.display(), e))?;
        }
        Ok(())
    }

    /// abort drops the writer and removes its temporary files, leaving any
    /// previously finalized segments untouched.
    pub async fn abort(mut self) -> anyhow::Result<()> {
        let mut errs = ErrorList::new();
        if let Some(tw) = self.tw.take() {
            errs.add(tw.close().await);
        }
        for file in &self.tmp_files {
            match tokio::fs::remove_file(file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => errs.add_err(anyhow!("remove {} error: {}", file.display(), e)),
            }
        }
        errs.err()
    }
}

/// next_generation scans the shard directory for existing segment files and
/// returns one past the highest generation found.
async fn next_generation(path: &Path) -> anyhow::Result<u32> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| anyhow!("read dir {} error: {}", path.display(), e))?;

    let mut max_generation = 0;
    while let Some(entry) = entries.next_entry().await.map_err(|e| anyhow!(e))? {
        let path = entry.path();
        if path
            .extension()
            .map(|e| e == TSM_FILE_EXTENSION)
            .unwrap_or(false)
        {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Ok((generation, _)) = parse_tsm_file_name(name) {
                    max_generation = max_generation.max(generation);
                }
            }
        }
    }
    Ok(max_generation + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tsm1::reader::TSMReader;
    use crate::engine::tsm1::value::TimeValue;

    #[tokio::test]
    async fn test_write_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ShardWriter::new(7, dir.path()).await.unwrap();
        assert_eq!(w.shard_id(), 7);

        w.write(
            b"cpu#!~#value",
            &Values::Float(vec![TimeValue::new(1, 1.0)]),
        )
        .await
        .unwrap();
        let shard_path = w.path().to_path_buf();
        w.close().await.unwrap();

        let file = shard_path.join("000000001-000000001.tsm");
        assert!(file.exists());
        let r = TSMReader::open(&file).await.unwrap();
        assert_eq!(r.key_count(), 1);
    }

    #[tokio::test]
    async fn test_rolls_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ShardWriter::new(1, dir.path())
            .await
            .unwrap()
            .with_max_segment_size(64);

        for i in 0..3u8 {
            let key = format!("cpu,host={}#!~#value", i);
            w.write(
                key.as_bytes(),
                &Values::Float(vec![TimeValue::new(1, 1.0)]),
            )
            .await
            .unwrap();
        }
        let shard_path = w.path().to_path_buf();
        w.close().await.unwrap();

        assert!(shard_path.join("000000001-000000001.tsm").exists());
        assert!(shard_path.join("000000001-000000002.tsm").exists());
    }

    #[tokio::test]
    async fn test_reopen_continues_generation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut w = ShardWriter::new(1, dir.path()).await.unwrap();
            w.write(
                b"cpu#!~#value",
                &Values::Float(vec![TimeValue::new(1, 1.0)]),
            )
            .await
            .unwrap();
            w.close().await.unwrap();
        }
        {
            let mut w = ShardWriter::new(1, dir.path()).await.unwrap();
            w.write(
                b"mem#!~#value",
                &Values::Float(vec![TimeValue::new(1, 2.0)]),
            )
            .await
            .unwrap();
            w.close().await.unwrap();
        }

        let shard_path = dir.path().join("1");
        assert!(shard_path.join("000000001-000000001.tsm").exists());
        assert!(shard_path.join("000000002-000000001.tsm").exists());
    }

    #[tokio::test]
    async fn test_abort_removes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = ShardWriter::new(1, dir.path()).await.unwrap();
        w.write(
            b"cpu#!~#value",
            &Values::Float(vec![TimeValue::new(1, 1.0)]),
        )
        .await
        .unwrap();
        let shard_path = w.path().to_path_buf();
        w.abort().await.unwrap();

        let mut entries = tokio::fs::read_dir(&shard_path).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
