//! Import side of the redistribution pipeline.
//!
//! One importer per target node. Each received pipe stream carries one
//! source shard-group window; every bucket inside it materializes one
//! target shard (segment files, series-file additions and, unless
//! disabled, the on-disk inverted index). A failed shard is rolled back
//! (directory and shard-group record removed) without stopping the node's
//! other streams.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use common_base::errlist::ErrorList;
use influxdb_meta::{MetaClient, RetentionPolicySpec, MIN_RETENTION_POLICY_DURATION};
use influxdb_tsdb::engine::tsm1::series_field_key;
use influxdb_tsdb::series::series_file::{SeriesFile, SERIES_FILE_DIRECTORY};
use influxdb_tsdb::series::series_writer::SeriesWriter;
use influxdb_tsdb::shard::ShardWriter;

use crate::binary;

pub struct Importer {
    meta: Arc<Mutex<MetaClient>>,
    sfile: Arc<Mutex<SeriesFile>>,
    data_dir: PathBuf,
    db: String,
    rp: String,
    sd: i64,
    build_tsi: bool,
}

impl std::fmt::Debug for Importer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Importer")
            .field("data_dir", &self.data_dir)
            .field("db", &self.db)
            .field("rp", &self.rp)
            .field("sd", &self.sd)
            .field("build_tsi", &self.build_tsi)
            .finish()
    }
}

impl Importer {
    /// new opens the target catalog, ensures the database and retention
    /// policy exist with matching parameters and opens the series file.
    /// The duration is stored only when it is at least one hour.
    pub async fn new(
        target_dir: impl AsRef<Path>,
        db: &str,
        rp: &str,
        sd: i64,
        duration: i64,
        build_tsi: bool,
    ) -> anyhow::Result<Self> {
        let target_dir = target_dir.as_ref();
        let mut client = MetaClient::open(target_dir.join("meta")).await?;

        let spec = RetentionPolicySpec {
            name: rp.to_string(),
            replica_n: None,
            duration: (duration >= MIN_RETENTION_POLICY_DURATION).then_some(duration),
            shard_group_duration: sd,
        };
        if client.database(db).is_none() {
            client
                .create_database_with_retention_policy(db, &spec)
                .await?;
        } else {
            client.create_retention_policy(db, &spec).await?;
        }

        let data_dir = target_dir.join("data");
        let sfile = SeriesFile::open(data_dir.join(db).join(SERIES_FILE_DIRECTORY)).await?;

        Ok(Self {
            meta: Arc::new(Mutex::new(client)),
            sfile: Arc::new(Mutex::new(sfile)),
            data_dir,
            db: db.to_string(),
            rp: rp.to_string(),
            sd,
            build_tsi,
        })
    }

    /// run drains the node's reader channel, importing each received
    /// stream in its own task. A failed stream is logged and the node
    /// keeps going.
    pub async fn run(&self, mut pr_chan: mpsc::Receiver<DuplexStream>, idx: usize) {
        info!("node index {} transfer start", idx);

        let mut handles = Vec::new();
        while let Some(pr) = pr_chan.recv().await {
            let worker = ImportWorker {
                meta: self.meta.clone(),
                sfile: self.sfile.clone(),
                data_dir: self.data_dir.clone(),
                db: self.db.clone(),
                rp: self.rp.clone(),
                sd: self.sd,
                build_tsi: self.build_tsi,
            };
            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.import_stream(pr).await {
                    warn!("import stream error: {}, idx: {}", e, idx);
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("node index {} transfer done", idx);
    }

    /// close flushes and closes the series file.
    pub async fn close(self) -> anyhow::Result<()> {
        let Self { sfile, .. } = self;
        let sfile = Arc::try_unwrap(sfile)
            .map_err(|_| anyhow!("series file still in use"))?
            .into_inner();
        sfile.close().await
    }
}

struct ImportWorker {
    meta: Arc<Mutex<MetaClient>>,
    sfile: Arc<Mutex<SeriesFile>>,
    data_dir: PathBuf,
    db: String,
    rp: String,
    sd: i64,
    build_tsi: bool,
}

impl ImportWorker {
    async fn import_stream(&self, pr: DuplexStream) -> anyhow::Result<()> {
        let mut reader = binary::Reader::new(pr);

        let header = reader.read_header().await?;
        if header.database != self.db
            || header.retention_policy != self.rp
            || header.shard_group_duration != self.sd
        {
            return Err(anyhow!(
                "stream header ({}, {}, {}) does not match target ({}, {}, {})",
                header.database,
                header.retention_policy,
                header.shard_group_duration,
                self.db,
                self.rp,
                self.sd
            ));
        }

        while let Some(bucket) = reader.next_bucket().await? {
            self.import_shard(&mut reader, bucket.start, bucket.end)
                .await?;
        }
        Ok(())
    }

    /// import_shard materializes one bucket as one target shard.
    async fn import_shard(
        &self,
        reader: &mut binary::Reader<DuplexStream>,
        start: i64,
        end: i64,
    ) -> anyhow::Result<()> {
        let (shard_id, group_id) = self.start_shard_group(start, end).await?;

        let shards_path = self.data_dir.join(&self.db).join(&self.rp);
        let mut sh = ShardWriter::new(shard_id, &shards_path).await?;
        let shard_path = sh.path().to_path_buf();
        let mut sw = if self.build_tsi {
            SeriesWriter::new_index(self.sfile.clone(), &shard_path)
        } else {
            SeriesWriter::new_in_mem(self.sfile.clone())
        };

        match self.copy_series(reader, &mut sh, &mut sw).await {
            Ok(()) => {
                let mut errs = ErrorList::new();
                errs.add(sw.close().await);
                errs.add(sh.close().await);
                errs.err()
            }
            Err(e) => {
                // Roll the partial shard back: directory and group record.
                let mut errs = ErrorList::new();
                errs.add_err(e);
                errs.add(sh.abort().await);
                drop(sw);
                errs.add(
                    tokio::fs::remove_dir_all(&shard_path)
                        .await
                        .map_err(|re| anyhow!("remove {} error: {}", shard_path.display(), re)),
                );
                let mut meta = self.meta.lock().await;
                errs.add(meta.delete_shard_group(&self.db, &self.rp, group_id).await);
                errs.err()
            }
        }
    }

    async fn copy_series(
        &self,
        reader: &mut binary::Reader<DuplexStream>,
        sh: &mut ShardWriter,
        sw: &mut SeriesWriter,
    ) -> anyhow::Result<()> {
        while let Some(series) = reader.next_series().await? {
            sw.add_series(&series.series_key).await?;
            let key = series_field_key(&series.series_key, &series.field);
            while let Some(values) = reader.next_batch().await? {
                sh.write(&key, &values).await?;
            }
        }
        Ok(())
    }

    /// start_shard_group locates or creates the shard group covering
    /// `[start, end)` and returns its single shard id. A group owning more
    /// than one shard cannot be imported into.
    async fn start_shard_group(&self, start: i64, end: i64) -> anyhow::Result<(u64, u64)> {
        let mut meta = self.meta.lock().await;

        let existing = meta.shard_groups_by_time_range(&self.db, &self.rp, start, end - 1)?;
        if let Some(sgi) = existing.first() {
            if sgi.shards.len() != 1 {
                return Err(anyhow!(
                    "expected one shard for the time range {} to {}, found {}",
                    start,
                    end,
                    sgi.shards.len()
                ));
            }
            return Ok((sgi.shards[0].id, sgi.id));
        }

        let sgi = meta.create_shard_group(&self.db, &self.rp, start).await?;
        Ok((sgi.shards[0].id, sgi.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PIPE_BUFFER_SIZE;
    use influxdb_tsdb::engine::tsm1::block::BLOCK_FLOAT64;
    use influxdb_tsdb::engine::tsm1::reader::TSMReader;
    use influxdb_tsdb::engine::tsm1::value::{TimeValue, Values};
    use influxdb_tsdb::series::series_index::{INDEX_DIRECTORY, INDEX_FILE};
    use tokio::io::duplex;

    const HOUR: i64 = 3600 * 1_000_000_000;
    const DAY: i64 = 24 * HOUR;

    async fn send_stream(
        pw: DuplexStream,
        series: &[(&[u8], &[u8], Values)],
        bucket: (i64, i64),
    ) {
        let mut w = binary::Writer::new(pw, "db", "autogen", DAY);
        w.begin_bucket(bucket.0, bucket.1).await.unwrap();
        for (key, field, values) in series {
            w.write_series(key, field, values.block_type()).await.unwrap();
            w.write_batch(values).await.unwrap();
            w.end_series().await.unwrap();
        }
        w.end_bucket().await.unwrap();
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_import_creates_shard() {
        let dir = tempfile::tempdir().unwrap();
        let imp = Importer::new(dir.path(), "db", "autogen", DAY, 0, true)
            .await
            .unwrap();

        let (pw, pr) = duplex(PIPE_BUFFER_SIZE);
        let (tx, rx) = mpsc::channel(4);
        tx.send(pr).await.unwrap();
        drop(tx);

        send_stream(
            pw,
            &[(
                b"cpu,host=a",
                b"value",
                Values::Float(vec![TimeValue::new(1, 1.0), TimeValue::new(2, 2.0)]),
            )],
            (0, DAY),
        )
        .await;

        imp.run(rx, 0).await;

        // the catalog gained one shard group with one shard
        let meta = MetaClient::open(dir.path().join("meta")).await.unwrap();
        let groups = meta
            .shard_groups_by_time_range("db", "autogen", 0, DAY - 1)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].shards.len(), 1);
        let shard_id = groups[0].shards[0].id;

        // the shard directory holds a finalized segment and the index dir
        let shard_dir = dir
            .path()
            .join("data")
            .join("db")
            .join("autogen")
            .join(shard_id.to_string());
        let mut r = TSMReader::open(shard_dir.join("000000001-000000001.tsm"))
            .await
            .unwrap();
        assert_eq!(r.block_type(b"cpu,host=a#!~#value").unwrap(), BLOCK_FLOAT64);
        let values = r
            .read_values(b"cpu,host=a#!~#value", i64::MIN, i64::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(values.len(), 2);
        assert!(shard_dir.join(INDEX_DIRECTORY).join(INDEX_FILE).exists());

        imp.close().await.unwrap();

        // the series file saw the key
        let sfile = SeriesFile::open(
            dir.path()
                .join("data")
                .join("db")
                .join(SERIES_FILE_DIRECTORY),
        )
        .await
        .unwrap();
        assert!(sfile.contains(b"cpu,host=a"));
    }

    #[tokio::test]
    async fn test_import_header_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let imp = Importer::new(dir.path(), "db", "autogen", DAY, 0, false)
            .await
            .unwrap();

        let (pw, pr) = duplex(PIPE_BUFFER_SIZE);
        let mut w = binary::Writer::new(pw, "otherdb", "autogen", DAY);
        w.begin_bucket(0, DAY).await.unwrap();
        w.end_bucket().await.unwrap();
        w.close().await.unwrap();

        let worker = ImportWorker {
            meta: imp.meta.clone(),
            sfile: imp.sfile.clone(),
            data_dir: imp.data_dir.clone(),
            db: imp.db.clone(),
            rp: imp.rp.clone(),
            sd: imp.sd,
            build_tsi: imp.build_tsi,
        };
        let err = worker.import_stream(pr).await.unwrap_err();
        assert!(err.to_string().contains("does not match target"));
    }

    #[tokio::test]
    async fn test_import_rp_mismatch_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _ = Importer::new(dir.path(), "db", "autogen", DAY, 0, false)
                .await
                .unwrap();
        }
        // same rp requested with a different shard-group duration
        let err = Importer::new(dir.path(), "db", "autogen", 2 * DAY, 0, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("different parameters"));
    }

    #[tokio::test]
    async fn test_transfer_end_to_end() {
        use crate::exporter::Exporter;
        use common_base::iterator::AsyncIterator;
        use common_base::{MAX_NANO_TIME, MIN_NANO_TIME};
        use influxdb_meta::RetentionPolicySpec;
        use influxdb_tsdb::engine::tsm1::writer::{DefaultTSMWriter, TSMWriter};
        use influxdb_tsdb::store::Store;
        use influxdb_utils::hash::ConsistentHash;
        use influxdb_utils::tpl::ShardTpl;
        use std::collections::{BTreeMap, HashMap};

        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        // source: one db, two day-long shard groups, three measurements
        // plus one that needs escaping
        let mut client = MetaClient::open(source.path().join("meta")).await.unwrap();
        client
            .create_database_with_retention_policy(
                "db",
                &RetentionPolicySpec {
                    name: "autogen".to_string(),
                    replica_n: None,
                    duration: None,
                    shard_group_duration: DAY,
                },
            )
            .await
            .unwrap();

        let mut source_points: BTreeMap<Vec<u8>, Values> = BTreeMap::new();
        for (day, names) in [(0i64, vec!["cpu", "mem"]), (1, vec!["cpu", "disk"])] {
            let g = client
                .create_shard_group("db", "autogen", day * DAY)
                .await
                .unwrap();
            let shard_dir = source
                .path()
                .join("data")
                .join("db")
                .join("autogen")
                .join(g.shards[0].id.to_string());
            tokio::fs::create_dir_all(&shard_dir).await.unwrap();
            let mut w = DefaultTSMWriter::new(shard_dir.join("000000001-000000001.tsm"))
                .await
                .unwrap();
            let mut keys: Vec<Vec<u8>> = names
                .iter()
                .map(|n| series_field_key(format!("{},host=a", n).as_bytes(), b"value"))
                .collect();
            keys.push(series_field_key(b"bad name,host=a", b"value"));
            keys.sort();
            for key in keys {
                let values = Values::Float(vec![
                    TimeValue::new(day * DAY + 1, day as f64),
                    TimeValue::new(day * DAY + 2, day as f64 + 0.5),
                ]);
                w.write(&key, &values).await.unwrap();
                if !key.starts_with(b"bad name") {
                    source_points
                        .entry(key)
                        .and_modify(|v| {
                            *v = v.clone().merge(values.clone()).unwrap();
                        })
                        .or_insert(values);
                }
            }
            w.write_index().await.unwrap();
            w.close().await.unwrap();
        }

        // transfer to two nodes
        let node_total = 2;
        let exporter = Exporter::new(
            source.path(),
            "db",
            "autogen",
            DAY,
            MIN_NANO_TIME,
            MAX_NANO_TIME,
        )
        .await
        .unwrap();

        let mut pr_chans = HashMap::new();
        let mut imports = Vec::new();
        for idx in 0..node_total {
            let (tx, rx) = mpsc::channel(4);
            pr_chans.insert(idx, tx);
            let dir = target.path().join(format!("target-{}", idx));
            let imp = Importer::new(&dir, "db", "autogen", DAY, 0, false)
                .await
                .unwrap();
            imports.push(tokio::spawn(async move {
                imp.run(rx, idx).await;
                imp.close().await.unwrap();
            }));
        }

        exporter
            .write_to(pr_chans, node_total, "idx", "%db,%mm", 0)
            .await;
        for handle in imports {
            handle.await.unwrap();
        }

        // the union of points across targets equals the source, with each
        // measurement on the node the router chose
        let ring = ConsistentHash::new(node_total, "idx");
        let tpl = ShardTpl::new("%db,%mm");
        let mut union: BTreeMap<Vec<u8>, Values> = BTreeMap::new();
        for idx in 0..node_total {
            let meta_dir = target.path().join(format!("target-{}", idx)).join("meta");
            let client = MetaClient::open(meta_dir).await.unwrap();
            let groups = client
                .shard_groups_by_time_range("db", "autogen", MIN_NANO_TIME, MAX_NANO_TIME)
                .unwrap();
            let ids: Vec<u64> = groups.iter().map(|g| g.shards[0].id).collect();

            let data_dir = target.path().join(format!("target-{}", idx)).join("data");
            let store = Store::open(&data_dir, "db", "autogen", &ids).await.unwrap();
            let mut rs = store.read(MIN_NANO_TIME, MAX_NANO_TIME);
            while let Some(mut entry) = rs.try_next().await.unwrap() {
                assert_eq!(ring.get(&tpl.get_key("db", &entry.name)), idx);
                let key = series_field_key(&entry.series_key, &entry.field);
                let mut all: Option<Values> = None;
                while let Some(batch) = entry.next_batch() {
                    all = Some(match all {
                        Some(acc) => acc.merge(batch).unwrap(),
                        None => batch,
                    });
                }
                let all = all.unwrap();
                union
                    .entry(key)
                    .and_modify(|v| {
                        *v = v.clone().merge(all.clone()).unwrap();
                    })
                    .or_insert(all);
            }
            rs.close().await.unwrap();
        }

        assert_eq!(union, source_points);
    }

    #[tokio::test]
    async fn test_import_stream_error_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let imp = Importer::new(dir.path(), "db", "autogen", DAY, 0, false)
            .await
            .unwrap();

        // truncate the stream mid-series: header, bucket and series record
        // but no terminator before the pipe closes
        let (pw, pr) = duplex(PIPE_BUFFER_SIZE);
        let mut w = binary::Writer::new(pw, "db", "autogen", DAY);
        w.begin_bucket(0, DAY).await.unwrap();
        w.write_series(b"cpu,host=a", b"value", BLOCK_FLOAT64)
            .await
            .unwrap();
        drop(w.close().await.unwrap());

        let worker = ImportWorker {
            meta: imp.meta.clone(),
            sfile: imp.sfile.clone(),
            data_dir: imp.data_dir.clone(),
            db: imp.db.clone(),
            rp: imp.rp.clone(),
            sd: imp.sd,
            build_tsi: imp.build_tsi,
        };
        assert!(worker.import_stream(pr).await.is_err());

        // the shard group record and directory are gone
        let meta = MetaClient::open(dir.path().join("meta")).await.unwrap();
        assert!(meta
            .shard_groups_by_time_range("db", "autogen", 0, DAY - 1)
            .unwrap()
            .is_empty());
        let rp_dir = dir.path().join("data").join("db").join("autogen");
        if rp_dir.exists() {
            let mut entries = tokio::fs::read_dir(&rp_dir).await.unwrap();
            assert!(entries.next_entry().await.unwrap().is_none());
        }
    }
}
