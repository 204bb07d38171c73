//! Framed wire format between exporter and importer.
//!
//! A stream is one file header followed by a sequence of buckets; each
//! bucket holds a sequence of series records; each series record holds a
//! sequence of value batches. Every record starts with a tag byte, so a
//! reader of a well-formed prefix can always stop cleanly at a bucket
//! boundary.
//!
//! ```text
//! header:  | magic "ITXF" | version u8 | db len u16 + bytes | rp len u16 + bytes | sgd i64 |
//! bucket:  | BUCKET | start i64 | end i64 | series* | BUCKET_END |
//! series:  | SERIES | key len u32 + bytes | field len u32 + bytes | type u8 | batch* | SERIES_END |
//! batch:   | BATCH | block len u32 + bytes |
//! ```
//!
//! A batch payload is an encoded block: type byte, point count, timestamps,
//! then the typed values.

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use influxdb_tsdb::engine::tsm1::block::{decode_block, encode_block};
use influxdb_tsdb::engine::tsm1::value::Values;

const MAGIC: [u8; 4] = *b"ITXF";
const VERSION: u8 = 1;

const TAG_BUCKET: u8 = 1;
const TAG_BUCKET_END: u8 = 2;
const TAG_SERIES: u8 = 3;
const TAG_SERIES_END: u8 = 4;
const TAG_BATCH: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub database: String,
    pub retention_policy: String,
    pub shard_group_duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHeader {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesHeader {
    pub series_key: Vec<u8>,
    pub field: Vec<u8>,
    pub field_type: u8,
}

/// Writer emits a framed stream. The file header is written lazily before
/// the first bucket.
pub struct Writer<W> {
    w: W,
    header: Header,
    header_written: bool,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(w: W, database: &str, retention_policy: &str, shard_group_duration: i64) -> Self {
        Self {
            w,
            header: Header {
                database: database.to_string(),
                retention_policy: retention_policy.to_string(),
                shard_group_duration,
            },
            header_written: false,
        }
    }

    async fn write_header(&mut self) -> anyhow::Result<()> {
        let mut buf = Vec::with_capacity(
            MAGIC.len() + 1 + 4 + self.header.database.len() + self.header.retention_policy.len() + 8,
        );
        buf.extend_from_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u16(self.header.database.len() as u16);
        buf.extend_from_slice(self.header.database.as_bytes());
        buf.put_u16(self.header.retention_policy.len() as u16);
        buf.extend_from_slice(self.header.retention_policy.as_bytes());
        buf.put_i64(self.header.shard_group_duration);
        self.w.write_all(&buf).await.map_err(|e| anyhow!(e))
    }

    /// begin_bucket opens a bucket covering `[start, end)` nanoseconds.
    pub async fn begin_bucket(&mut self, start: i64, end: i64) -> anyhow::Result<()> {
        if !self.header_written {
            self.write_header().await?;
            self.header_written = true;
        }
        let mut buf = Vec::with_capacity(17);
        buf.put_u8(TAG_BUCKET);
        buf.put_i64(start);
        buf.put_i64(end);
        self.w.write_all(&buf).await.map_err(|e| anyhow!(e))
    }

    /// write_series opens a series record inside the current bucket.
    pub async fn write_series(
        &mut self,
        series_key: &[u8],
        field: &[u8],
        field_type: u8,
    ) -> anyhow::Result<()> {
        let mut buf = Vec::with_capacity(10 + series_key.len() + field.len());
        buf.put_u8(TAG_SERIES);
        buf.put_u32(series_key.len() as u32);
        buf.extend_from_slice(series_key);
        buf.put_u32(field.len() as u32);
        buf.extend_from_slice(field);
        buf.put_u8(field_type);
        self.w.write_all(&buf).await.map_err(|e| anyhow!(e))
    }

    /// write_batch appends one value batch to the open series record.
    pub async fn write_batch(&mut self, values: &Values) -> anyhow::Result<()> {
        let mut block = Vec::new();
        encode_block(&mut block, values)?;

        let mut buf = Vec::with_capacity(5 + block.len());
        buf.put_u8(TAG_BATCH);
        buf.put_u32(block.len() as u32);
        buf.extend_from_slice(&block);
        self.w.write_all(&buf).await.map_err(|e| anyhow!(e))
    }

    /// end_series terminates the open series record. Writers always emit
    /// the terminator, even for a series with zero batches.
    pub async fn end_series(&mut self) -> anyhow::Result<()> {
        self.w
            .write_u8(TAG_SERIES_END)
            .await
            .map_err(|e| anyhow!(e))
    }

    /// end_bucket terminates the open bucket.
    pub async fn end_bucket(&mut self) -> anyhow::Result<()> {
        self.w
            .write_u8(TAG_BUCKET_END)
            .await
            .map_err(|e| anyhow!(e))
    }

    /// close flushes and shuts down the underlying stream, returning it.
    pub async fn close(mut self) -> anyhow::Result<W> {
        self.w.flush().await.map_err(|e| anyhow!(e))?;
        self.w.shutdown().await.map_err(|e| anyhow!(e))?;
        Ok(self.w)
    }
}

/// Reader consumes a framed stream.
pub struct Reader<R> {
    r: R,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(r: R) -> Self {
        Self { r }
    }

    pub async fn read_header(&mut self) -> anyhow::Result<Header> {
        let mut magic = [0u8; 4];
        self.r.read_exact(&mut magic).await.map_err(|e| anyhow!(e))?;
        if magic != MAGIC {
            return Err(anyhow!("stream is not a transfer stream"));
        }
        let version = self.r.read_u8().await.map_err(|e| anyhow!(e))?;
        if version != VERSION {
            return Err(anyhow!("unsupported stream version {}", version));
        }

        let database = self.read_string16().await?;
        let retention_policy = self.read_string16().await?;
        let shard_group_duration = self.r.read_i64().await.map_err(|e| anyhow!(e))?;
        Ok(Header {
            database,
            retention_policy,
            shard_group_duration,
        })
    }

    /// next_bucket returns the next bucket header, or None at a clean end
    /// of stream.
    pub async fn next_bucket(&mut self) -> anyhow::Result<Option<BucketHeader>> {
        let tag = match self.r.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(anyhow!(e)),
        };
        if tag != TAG_BUCKET {
            return Err(anyhow!("expected bucket record, got tag {}", tag));
        }

        let start = self.r.read_i64().await.map_err(|e| anyhow!(e))?;
        let end = self.r.read_i64().await.map_err(|e| anyhow!(e))?;
        Ok(Some(BucketHeader { start, end }))
    }

    /// next_series returns the next series record of the current bucket, or
    /// None at the bucket terminator.
    pub async fn next_series(&mut self) -> anyhow::Result<Option<SeriesHeader>> {
        let tag = self.r.read_u8().await.map_err(|e| anyhow!(e))?;
        match tag {
            TAG_BUCKET_END => Ok(None),
            TAG_SERIES => {
                let series_key = self.read_bytes32().await?;
                let field = self.read_bytes32().await?;
                let field_type = self.r.read_u8().await.map_err(|e| anyhow!(e))?;
                Ok(Some(SeriesHeader {
                    series_key,
                    field,
                    field_type,
                }))
            }
            _ => Err(anyhow!("expected series record, got tag {}", tag)),
        }
    }

    /// next_batch returns the next value batch of the current series, or
    /// None at the series terminator.
    pub async fn next_batch(&mut self) -> anyhow::Result<Option<Values>> {
        let tag = self.r.read_u8().await.map_err(|e| anyhow!(e))?;
        match tag {
            TAG_SERIES_END => Ok(None),
            TAG_BATCH => {
                let block = self.read_bytes32().await?;
                Ok(Some(decode_block(&block)?))
            }
            _ => Err(anyhow!("expected value batch, got tag {}", tag)),
        }
    }

    async fn read_string16(&mut self) -> anyhow::Result<String> {
        let len = self.r.read_u16().await.map_err(|e| anyhow!(e))? as usize;
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf).await.map_err(|e| anyhow!(e))?;
        String::from_utf8(buf).map_err(|e| anyhow!("invalid utf-8 in stream header: {}", e))
    }

    async fn read_bytes32(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.r.read_u32().await.map_err(|e| anyhow!(e))? as usize;
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf).await.map_err(|e| anyhow!(e))?;
        Ok(buf)
    }
}
