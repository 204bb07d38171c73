use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use common_base::iterator::AsyncIterator;

use crate::engine::tsm1::block::decode_block;
use crate::engine::tsm1::index::IndexEntry;
use crate::engine::tsm1::value::Values;
use crate::engine::tsm1::{TimeRange, HEADER, INDEX_ENTRY_SIZE, MAGIC_NUMBER, VERSION};

/// KeyEntries is the loaded index section for one key.
#[derive(Debug, Clone)]
struct KeyEntries {
    key: Vec<u8>,
    typ: u8,
    entries: Vec<IndexEntry>,
}

/// TSMReader reads an on-disk TSM file. The index is loaded eagerly into
/// memory; block reads seek into the data section and verify checksums.
pub struct TSMReader {
    path: PathBuf,
    fd: File,
    index: Vec<KeyEntries>,
    time_range: TimeRange,
}

impl TSMReader {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut fd = File::open(&path)
            .await
            .map_err(|e| anyhow!("open {} error: {}", path.display(), e))?;

        let file_size = fd
            .metadata()
            .await
            .map_err(|e| anyhow!(e))?
            .len();
        if file_size < (HEADER.len() + 8) as u64 {
            return Err(anyhow!("{}: file too small to be a tsm file", path.display()));
        }

        // Verify the magic number and version.
        let mut header = [0u8; 5];
        fd.read_exact(&mut header).await.map_err(|e| anyhow!(e))?;
        let magic = u32::from_be_bytes(header[..4].try_into().unwrap());
        if magic != MAGIC_NUMBER {
            return Err(anyhow!("{}: not a tsm file", path.display()));
        }
        if header[4] != VERSION {
            return Err(anyhow!(
                "{}: unsupported tsm version {}",
                path.display(),
                header[4]
            ));
        }

        // The index offset is the trailing u64.
        fd.seek(SeekFrom::End(-8)).await.map_err(|e| anyhow!(e))?;
        let index_pos = fd.read_u64().await.map_err(|e| anyhow!(e))?;
        if index_pos < HEADER.len() as u64 || index_pos > file_size - 8 {
            return Err(anyhow!("{}: corrupt index offset", path.display()));
        }

        fd.seek(SeekFrom::Start(index_pos))
            .await
            .map_err(|e| anyhow!(e))?;
        let mut buf = vec![0u8; (file_size - 8 - index_pos) as usize];
        fd.read_exact(&mut buf).await.map_err(|e| anyhow!(e))?;

        let index = parse_index(&path, &buf)?;

        let mut time_range = TimeRange::unbound();
        for ke in &index {
            for entry in &ke.entries {
                time_range.min = time_range.min.min(entry.min_time);
                time_range.max = time_range.max.max(entry.max_time);
            }
        }

        Ok(Self {
            path,
            fd,
            index,
            time_range,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// keys returns every key in the file in lexicographic order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.index.iter().map(|ke| ke.key.as_slice())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// block_type returns the type of the values stored for key.
    pub fn block_type(&self, key: &[u8]) -> anyhow::Result<u8> {
        self.find(key)
            .map(|ke| ke.typ)
            .ok_or_else(|| anyhow!("key not found: {:?}", key))
    }

    /// entries returns the index entries for all blocks of key.
    pub fn entries(&self, key: &[u8]) -> Option<(u8, &[IndexEntry])> {
        self.find(key).map(|ke| (ke.typ, ke.entries.as_slice()))
    }

    /// time_range returns the min and max time across all keys in the file.
    pub fn time_range(&self) -> TimeRange {
        self.time_range.clone()
    }

    /// read_block_at returns the checksum-verified raw block of an entry.
    pub async fn read_block_at(&mut self, entry: &IndexEntry) -> anyhow::Result<Vec<u8>> {
        if (entry.size as usize) < 4 {
            return Err(anyhow!("{}: corrupt block size", self.path.display()));
        }

        self.fd
            .seek(SeekFrom::Start(entry.offset))
            .await
            .map_err(|e| anyhow!(e))?;
        let mut buf = vec![0u8; entry.size as usize];
        self.fd.read_exact(&mut buf).await.map_err(|e| anyhow!(e))?;

        let checksum = u32::from_be_bytes(buf[..4].try_into().unwrap());
        let block = buf.split_off(4);
        if crc32fast::hash(&block) != checksum {
            return Err(anyhow!(
                "{}: block checksum mismatch at offset {}",
                self.path.display(),
                entry.offset
            ));
        }
        Ok(block)
    }

    /// read_values decodes every block of key overlapping `[min, max]` into
    /// one merged, range-filtered run. Returns None if the key is absent or
    /// nothing falls in range.
    pub async fn read_values(
        &mut self,
        key: &[u8],
        min: i64,
        max: i64,
    ) -> anyhow::Result<Option<Values>> {
        let entries: Vec<IndexEntry> = match self.find(key) {
            Some(ke) => ke
                .entries
                .iter()
                .filter(|e| e.overlaps_time_range(min, max))
                .cloned()
                .collect(),
            None => return Ok(None),
        };
        if entries.is_empty() {
            return Ok(None);
        }

        let mut out: Option<Values> = None;
        for entry in entries {
            let block = self.read_block_at(&entry).await?;
            let values = decode_block(&block)?.include(min, max);
            if values.is_empty() {
                continue;
            }
            out = Some(match out {
                Some(acc) => acc.merge(values)?,
                None => values,
            });
        }

        Ok(out.filter(|v| !v.is_empty()))
    }

    /// block_iterator iterates all blocks in key-then-time order.
    pub fn block_iterator(&mut self) -> BlockIterator<'_> {
        BlockIterator {
            reader: self,
            key_i: 0,
            entry_i: 0,
        }
    }

    pub async fn close(self) -> anyhow::Result<()> {
        Ok(())
    }

    /// remove deletes the file from the filesystem.
    pub async fn remove(self) -> anyhow::Result<()> {
        let Self { path, fd, .. } = self;
        drop(fd);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| anyhow!("remove {} error: {}", path.display(), e))
    }

    fn find(&self, key: &[u8]) -> Option<&KeyEntries> {
        self.index
            .binary_search_by(|ke| ke.key.as_slice().cmp(key))
            .ok()
            .map(|i| &self.index[i])
    }
}

fn parse_index(path: &Path, buf: &[u8]) -> anyhow::Result<Vec<KeyEntries>> {
    let mut index = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        if pos + 2 > buf.len() {
            return Err(anyhow!("{}: corrupt index", path.display()));
        }
        let key_len = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        if pos + key_len + 3 > buf.len() {
            return Err(anyhow!("{}: corrupt index", path.display()));
        }
        let key = buf[pos..pos + key_len].to_vec();
        pos += key_len;
        let typ = buf[pos];
        pos += 1;
        let count = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;

        if count == 0 || pos + count * INDEX_ENTRY_SIZE > buf.len() {
            return Err(anyhow!("{}: corrupt index", path.display()));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(IndexEntry::unmarshal_binary(&buf[pos..pos + INDEX_ENTRY_SIZE])?);
            pos += INDEX_ENTRY_SIZE;
        }

        if let Some(last) = index.last() {
            let last: &KeyEntries = last;
            if last.key.as_slice() >= key.as_slice() {
                return Err(anyhow!("{}: index keys out of order", path.display()));
            }
        }
        index.push(KeyEntries { key, typ, entries });
    }
    Ok(index)
}

/// BlockEntry is one raw block surfaced by a BlockIterator.
pub struct BlockEntry {
    pub key: Vec<u8>,
    pub typ: u8,
    pub min_time: i64,
    pub max_time: i64,
    pub block: Vec<u8>,
}

/// BlockIterator allows iterating over each block in a TSM file in order.
/// It provides raw access to the block bytes without decoding them.
pub struct BlockIterator<'a> {
    reader: &'a mut TSMReader,
    key_i: usize,
    entry_i: usize,
}

#[async_trait]
impl<'a> AsyncIterator for BlockIterator<'a> {
    type Item = BlockEntry;

    async fn try_next(&mut self) -> anyhow::Result<Option<BlockEntry>> {
        loop {
            if self.key_i >= self.reader.index.len() {
                return Ok(None);
            }
            let ke = &self.reader.index[self.key_i];
            if self.entry_i >= ke.entries.len() {
                self.key_i += 1;
                self.entry_i = 0;
                continue;
            }

            let key = ke.key.clone();
            let typ = ke.typ;
            let entry = ke.entries[self.entry_i].clone();
            self.entry_i += 1;

            let block = self.reader.read_block_at(&entry).await?;
            return Ok(Some(BlockEntry {
                key,
                typ,
                min_time: entry.min_time,
                max_time: entry.max_time,
                block,
            }));
        }
    }
}
