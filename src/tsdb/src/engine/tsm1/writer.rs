use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use bytes::BufMut;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::engine::tsm1::block::block_type;
use crate::engine::tsm1::index::{IndexEntries, IndexEntry};
use crate::engine::tsm1::value::Values;
use crate::engine::tsm1::{
    block, FSYNC_EVERY, HEADER, INDEX_ENTRY_SIZE, MAX_INDEX_ENTRIES, MAX_KEY_LENGTH,
};

/// TSMWriter writes TSM formatted key and values.
#[async_trait]
pub trait TSMWriter {
    /// write writes a new block for key containing values. Writes append
    /// blocks in the order that the write function is called. The caller is
    /// responsible for ensuring keys and blocks are sorted appropriately,
    /// and that a bounded number of values are encoded in each block. The
    /// first and last timestamps are used as the index entry's bounds.
    async fn write(&mut self, key: &[u8], values: &Values) -> anyhow::Result<()>;

    /// write_block writes a new already-encoded block for key. The caller is
    /// responsible for ensuring that the block and the min_time/max_time
    /// index information are correct.
    async fn write_block(
        &mut self,
        key: &[u8],
        min_time: i64,
        max_time: i64,
        block: &[u8],
    ) -> anyhow::Result<()>;

    /// write_index finishes the TSM write streams and writes the index.
    async fn write_index(&mut self) -> anyhow::Result<()>;

    /// flush flushes all pending changes to the underlying file resources.
    async fn flush(&mut self) -> anyhow::Result<()>;

    /// close closes any underlying file resources.
    async fn close(self) -> anyhow::Result<()>;

    /// key_count returns the count of unique keys written so far.
    fn key_count(&self) -> usize;

    /// size returns the current size in bytes of the file.
    fn size(&self) -> u64;

    /// remove closes the writer and deletes the partial file from disk.
    async fn remove(self) -> anyhow::Result<()>;
}

/// DirectIndex is a simple in-memory index for a TSM file being written.
/// The full index must fit in memory.
struct DirectIndex {
    key_count: usize,
    size: u32,
    buf: Vec<u8>,

    key: Vec<u8>,
    index_entries: IndexEntries,
}

impl DirectIndex {
    fn new() -> Self {
        Self {
            key_count: 0,
            size: 0,
            buf: Vec::with_capacity(1024 * 1024),
            key: Vec::new(),
            index_entries: IndexEntries::default(),
        }
    }

    fn add(&mut self, key: &[u8], block_type: u8, entry: IndexEntry) -> anyhow::Result<()> {
        if self.key.is_empty() {
            self.size += (2 + key.len()) as u32 + 3;
            self.key.extend_from_slice(key);
            self.index_entries.typ = block_type;
            self.index_entries.push(entry);
            self.size += INDEX_ENTRY_SIZE as u32;
            self.key_count += 1;
            return Ok(());
        }

        match self.key.as_slice().cmp(key) {
            Ordering::Equal => {
                // The last block is still this key
                if self.index_entries.entries.len() >= MAX_INDEX_ENTRIES {
                    return Err(anyhow!(
                        "key '{:?}' exceeds max index entries: {}",
                        key,
                        MAX_INDEX_ENTRIES
                    ));
                }
                self.index_entries.push(entry);
                self.size += INDEX_ENTRY_SIZE as u32;
            }
            Ordering::Less => {
                self.flush_key();
                // A new key greater than the last one starts a new index
                // block section.
                self.size += (2 + key.len()) as u32 + 3;
                self.key.extend_from_slice(key);
                self.index_entries.typ = block_type;
                self.index_entries.push(entry);
                self.size += INDEX_ENTRY_SIZE as u32;
                self.key_count += 1;
            }
            Ordering::Greater => {
                // Keys can't be added out of order.
                panic!(
                    "keys must be added in sorted order: {:?} < {:?}",
                    key,
                    self.key.as_slice()
                );
            }
        }
        Ok(())
    }

    /// flush_key marshals the pending key's index section:
    /// | key len (2B) | key | type (1B) | count (2B) | entries |
    fn flush_key(&mut self) {
        if self.key.is_empty() {
            return;
        }

        self.index_entries.sort();
        self.buf.put_u16(self.key.len() as u16);
        self.buf.extend_from_slice(&self.key);
        self.buf.put_u8(self.index_entries.typ);
        self.buf.put_u16(self.index_entries.entries.len() as u16);
        self.buf.extend_from_slice(&self.index_entries.marshal_binary());

        self.key.clear();
        self.index_entries = IndexEntries::default();
    }

    fn entries_len(&self, key: &[u8]) -> usize {
        if self.key.as_slice() == key {
            self.index_entries.entries.len()
        } else {
            0
        }
    }

    fn marshal(&mut self) -> &[u8] {
        self.flush_key();
        &self.buf
    }
}

pub struct DefaultTSMWriter {
    path: PathBuf,
    fd: File,

    index: DirectIndex,
    n: u64,

    // The bytes written count of when we last fsync'd
    last_sync: u64,
}

impl DefaultTSMWriter {
    pub async fn new(tsm_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = tsm_path.as_ref().to_path_buf();
        let fd = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| anyhow!("create {} error: {}", path.display(), e))?;

        Ok(Self {
            path,
            fd,
            index: DirectIndex::new(),
            n: 0,
            last_sync: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_header(&mut self) -> anyhow::Result<()> {
        self.fd.write_all(&HEADER).await.map_err(|e| anyhow!(e))?;
        self.n = HEADER.len() as u64;
        Ok(())
    }

    async fn sync(&mut self) -> anyhow::Result<()> {
        self.fd.flush().await.map_err(|e| anyhow!(e))?;
        self.fd.sync_all().await.map_err(|e| anyhow!(e))
    }
}

#[async_trait]
impl TSMWriter for DefaultTSMWriter {
    async fn write(&mut self, key: &[u8], values: &Values) -> anyhow::Result<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(anyhow!("max key length exceeded: {}", key.len()));
        }

        // Nothing to write
        if values.is_empty() {
            return Ok(());
        }

        let min_time = values.min_time();
        let max_time = values.max_time();

        let mut block = Vec::new();
        block::encode_block(&mut block, values)?;

        self.write_block(key, min_time, max_time, &block).await
    }

    async fn write_block(
        &mut self,
        key: &[u8],
        min_time: i64,
        max_time: i64,
        block: &[u8],
    ) -> anyhow::Result<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(anyhow!("max key length exceeded: {}", key.len()));
        }

        // Nothing to write
        if block.is_empty() {
            return Ok(());
        }

        let block_type = block_type(block)?;

        // Write header only after we have some data to write.
        if self.n == 0 {
            self.write_header().await?;
        }

        let checksum = crc32fast::hash(block);
        self.fd.write_u32(checksum).await.map_err(|e| anyhow!(e))?;
        self.fd.write_all(block).await.map_err(|e| anyhow!(e))?;
        let n = 4 + block.len() as u64;

        // Record this block in index
        let entry = IndexEntry {
            min_time,
            max_time,
            offset: self.n,
            size: n as u32,
        };
        self.index.add(key, block_type, entry)?;

        // Increment file position pointer
        self.n += n;

        // fsync the file periodically to avoid long pauses with very big files.
        if self.n - self.last_sync > FSYNC_EVERY {
            self.sync().await?;
            self.last_sync = self.n;
        }

        if self.index.entries_len(key) >= MAX_INDEX_ENTRIES {
            return Err(anyhow!(
                "key '{:?}' exceeds max index entries: {}",
                key,
                MAX_INDEX_ENTRIES
            ));
        }

        Ok(())
    }

    /// write_index writes the index section of the file. If no values were
    /// written, this returns an error and the file is left without an index.
    async fn write_index(&mut self) -> anyhow::Result<()> {
        let index_pos = self.n;

        if self.index.key_count == 0 {
            return Err(anyhow!("no values written"));
        }

        let buf = self.index.marshal();
        self.fd.write_all(buf).await.map_err(|e| anyhow!(e))?;

        // Write the index position
        self.fd.write_u64(index_pos).await.map_err(|e| anyhow!(e))
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.sync().await
    }

    async fn close(mut self) -> anyhow::Result<()> {
        self.flush().await
    }

    fn key_count(&self) -> usize {
        self.index.key_count
    }

    fn size(&self) -> u64 {
        self.n + self.index.size as u64
    }

    async fn remove(self) -> anyhow::Result<()> {
        let Self { path, fd, .. } = self;
        drop(fd);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| anyhow!("remove {} error: {}", path.display(), e))
    }
}
