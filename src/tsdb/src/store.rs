//! Read-only store over one database/retention-policy's shard directories.
//!
//! The store is opened already filtered to a whitelist of shard ids; a
//! read produces a streaming result set over every series field across the
//! selected shards, in lexicographic composite-key order.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use common_base::iterator::AsyncIterator;
use common_base::key::{parse_key, Tags};

use crate::engine::tsm1::reader::TSMReader;
use crate::engine::tsm1::value::Values;
use crate::engine::tsm1::{
    series_and_field_from_composite_key, MAX_POINTS_PER_BLOCK, TSM_FILE_EXTENSION,
};

pub struct Shard {
    id: u64,
    readers: Vec<TSMReader>,
}

impl Shard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct Store {
    db: String,
    rp: String,
    shards: Vec<Shard>,
}

impl Store {
    /// open scans `<data_dir>/<db>/<rp>` and opens every shard directory
    /// whose numeric id is in `shard_ids`, with all its segment readers.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        db: &str,
        rp: &str,
        shard_ids: &[u64],
    ) -> anyhow::Result<Self> {
        let rp_dir = data_dir.as_ref().join(db).join(rp);
        let mut shards = Vec::with_capacity(shard_ids.len());

        let mut entries = tokio::fs::read_dir(&rp_dir)
            .await
            .map_err(|e| anyhow!("read dir {} error: {}", rp_dir.display(), e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| anyhow!(e))? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let id: u64 = match path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse().ok())
            {
                Some(id) => id,
                None => continue,
            };
            if !shard_ids.contains(&id) {
                continue;
            }

            let readers = open_shard_readers(&path).await?;
            shards.push(Shard { id, readers });
        }

        shards.sort_by_key(|s| s.id);
        Ok(Self {
            db: db.to_string(),
            rp: rp.to_string(),
            shards,
        })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn rp(&self) -> &str {
        &self.rp
    }

    pub fn shard_ids(&self) -> Vec<u64> {
        self.shards.iter().map(|s| s.id).collect()
    }

    /// read consumes the store, returning a result set over all points with
    /// `start <= timestamp <= end`.
    pub fn read(self, start: i64, end: i64) -> ResultSet {
        let mut keys: BTreeSet<Vec<u8>> = BTreeSet::new();
        for shard in &self.shards {
            for reader in &shard.readers {
                keys.extend(reader.keys().map(|k| k.to_vec()));
            }
        }

        ResultSet {
            shards: self.shards,
            keys: keys.into_iter().collect(),
            pos: 0,
            start,
            end,
        }
    }
}

async fn open_shard_readers(path: &Path) -> anyhow::Result<Vec<TSMReader>> {
    let mut files: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| anyhow!("read dir {} error: {}", path.display(), e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| anyhow!(e))? {
        let p = entry.path();
        if p.extension().map(|e| e == TSM_FILE_EXTENSION).unwrap_or(false) {
            files.push(p);
        }
    }
    files.sort();

    let mut readers = Vec::with_capacity(files.len());
    for file in files {
        readers.push(TSMReader::open(&file).await?);
    }
    Ok(readers)
}

/// SeriesEntry is one (series, field) of a result set together with its
/// range-filtered values, already merged across shards and chunked into
/// bounded batches.
pub struct SeriesEntry {
    pub series_key: Vec<u8>,
    pub name: Vec<u8>,
    pub tags: Tags,
    pub field: Vec<u8>,
    pub field_type: u8,
    batches: VecDeque<Values>,
}

impl SeriesEntry {
    /// next_batch pops the next batch of at most 1000 points.
    pub fn next_batch(&mut self) -> Option<Values> {
        self.batches.pop_front()
    }
}

/// ResultSet streams the selected shards' series in lexicographic
/// composite-key order.
pub struct ResultSet {
    shards: Vec<Shard>,
    keys: Vec<Vec<u8>>,
    pos: usize,
    start: i64,
    end: i64,
}

#[async_trait]
impl AsyncIterator for ResultSet {
    type Item = SeriesEntry;

    async fn try_next(&mut self) -> anyhow::Result<Option<SeriesEntry>> {
        while self.pos < self.keys.len() {
            let key = self.keys[self.pos].clone();
            self.pos += 1;

            let mut merged: Option<Values> = None;
            for shard in self.shards.iter_mut() {
                for reader in shard.readers.iter_mut() {
                    let values = match reader.read_values(&key, self.start, self.end).await? {
                        Some(v) => v,
                        None => continue,
                    };
                    merged = Some(match merged {
                        Some(acc) => acc.merge(values)?,
                        None => values,
                    });
                }
            }
            let merged = match merged {
                Some(v) => v,
                None => continue,
            };

            let field_type = merged.block_type();
            let (series_key, field) = series_and_field_from_composite_key(&key);
            let (name, tags) = parse_key(series_key)?;

            return Ok(Some(SeriesEntry {
                series_key: series_key.to_vec(),
                name,
                tags,
                field: field.to_vec(),
                field_type,
                batches: merged.chunk(MAX_POINTS_PER_BLOCK).into(),
            }));
        }
        Ok(None)
    }
}

impl ResultSet {
    pub async fn close(self) -> anyhow::Result<()> {
        for shard in self.shards {
            for reader in shard.readers {
                reader.close().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tsm1::series_field_key;
    use crate::engine::tsm1::value::TimeValue;
    use crate::engine::tsm1::writer::{DefaultTSMWriter, TSMWriter};

    async fn write_shard(rp_dir: &Path, shard_id: u64, keys: &[(&[u8], Values)]) {
        let shard_dir = rp_dir.join(shard_id.to_string());
        tokio::fs::create_dir_all(&shard_dir).await.unwrap();
        let mut w = DefaultTSMWriter::new(shard_dir.join("000000001-000000001.tsm"))
            .await
            .unwrap();
        for (key, values) in keys {
            w.write(key, values).await.unwrap();
        }
        w.write_index().await.unwrap();
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_merges_shards_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let rp_dir = dir.path().join("db").join("autogen");

        let cpu = series_field_key(b"cpu,host=a", b"value");
        let mem = series_field_key(b"mem,host=a", b"value");
        write_shard(
            &rp_dir,
            1,
            &[
                (&cpu, Values::Float(vec![TimeValue::new(1, 1.0)])),
                (&mem, Values::Integer(vec![TimeValue::new(1, 10)])),
            ],
        )
        .await;
        write_shard(
            &rp_dir,
            2,
            &[(&cpu, Values::Float(vec![TimeValue::new(2, 2.0)]))],
        )
        .await;
        // shard 3 exists but is not selected
        write_shard(
            &rp_dir,
            3,
            &[(&cpu, Values::Float(vec![TimeValue::new(3, 3.0)]))],
        )
        .await;

        let store = Store::open(dir.path(), "db", "autogen", &[1, 2])
            .await
            .unwrap();
        assert_eq!(store.shard_ids(), vec![1, 2]);

        let mut rs = store.read(i64::MIN, i64::MAX);

        let mut entry = rs.try_next().await.unwrap().unwrap();
        assert_eq!(entry.series_key, b"cpu,host=a");
        assert_eq!(entry.name, b"cpu");
        assert_eq!(entry.field, b"value");
        let batch = entry.next_batch().unwrap();
        assert_eq!(
            batch,
            Values::Float(vec![TimeValue::new(1, 1.0), TimeValue::new(2, 2.0)])
        );
        assert!(entry.next_batch().is_none());

        let entry = rs.try_next().await.unwrap().unwrap();
        assert_eq!(entry.series_key, b"mem,host=a");
        assert_eq!(entry.field_type, Values::Integer(vec![]).block_type());

        assert!(rs.try_next().await.unwrap().is_none());
        rs.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_filters_range() {
        let dir = tempfile::tempdir().unwrap();
        let rp_dir = dir.path().join("db").join("autogen");

        let cpu = series_field_key(b"cpu,host=a", b"value");
        write_shard(
            &rp_dir,
            1,
            &[(
                &cpu,
                Values::Float(vec![
                    TimeValue::new(1, 1.0),
                    TimeValue::new(5, 5.0),
                    TimeValue::new(9, 9.0),
                ]),
            )],
        )
        .await;

        let store = Store::open(dir.path(), "db", "autogen", &[1]).await.unwrap();
        let mut rs = store.read(2, 8);
        let mut entry = rs.try_next().await.unwrap().unwrap();
        assert_eq!(
            entry.next_batch().unwrap(),
            Values::Float(vec![TimeValue::new(5, 5.0)])
        );
        assert!(rs.try_next().await.unwrap().is_none());
    }
}
