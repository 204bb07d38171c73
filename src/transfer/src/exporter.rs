//! Export side of the redistribution pipeline.
//!
//! One worker per target shard-group window opens a store filtered to the
//! overlapping source shards, streams its result set, routes each series to
//! a target node and demultiplexes the accepted series into per-node framed
//! pipe streams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use common_base::escape::need_escape;
use common_base::iterator::AsyncIterator;
use common_base::{MAX_NANO_TIME, MIN_NANO_TIME};
use influxdb_meta::{MetaClient, ShardGroupInfo};
use influxdb_tsdb::store::Store;
use influxdb_utils::hash::ConsistentHash;
use influxdb_utils::tpl::ShardTpl;

use crate::binary;
use crate::plan::plan_shard_groups;
use crate::PIPE_BUFFER_SIZE;

pub struct Exporter {
    data_dir: PathBuf,
    db: String,
    rp: String,
    sd: i64,
    source_groups: Vec<ShardGroupInfo>,
    target_groups: Vec<ShardGroupInfo>,
}

impl Exporter {
    /// new resolves the database and retention policy against the source
    /// catalog, loads its shard groups and plans the target windows.
    pub async fn new(
        source_dir: impl AsRef<Path>,
        db: &str,
        rp: &str,
        sd: i64,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Self> {
        let source_dir = source_dir.as_ref();
        let client = MetaClient::open(source_dir.join("meta")).await?;

        let dbi = client
            .database(db)
            .ok_or_else(|| anyhow!("database '{}' does not exist", db))?;

        let rp = if rp.is_empty() {
            dbi.default_retention_policy.clone()
        } else {
            rp.to_string()
        };
        if client.retention_policy(db, &rp)?.is_none() {
            return Err(anyhow!("retention policy '{}' does not exist", rp));
        }

        let source_groups =
            client.shard_groups_by_time_range(db, &rp, MIN_NANO_TIME, MAX_NANO_TIME)?;
        let target_groups = plan_shard_groups(&source_groups, sd, start, end);

        Ok(Self {
            data_dir: source_dir.join("data"),
            db: db.to_string(),
            rp,
            sd,
            source_groups,
            target_groups,
        })
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn rp(&self) -> &str {
        &self.rp
    }

    pub fn source_shard_groups(&self) -> &[ShardGroupInfo] {
        &self.source_groups
    }

    pub fn target_shard_groups(&self) -> &[ShardGroupInfo] {
        &self.target_groups
    }

    /// write_to runs one worker per target group under an optional
    /// concurrency cap and streams every accepted series into the per-node
    /// channels of `pr_chans`. Failures abandon their group; the remaining
    /// groups continue.
    pub async fn write_to(
        &self,
        pr_chans: HashMap<usize, mpsc::Sender<DuplexStream>>,
        node_total: usize,
        hash_key: &str,
        shard_key: &str,
        worker: usize,
    ) {
        info!("total shard groups: {}", self.target_groups.len());
        let ring = Arc::new(ConsistentHash::new(node_total, hash_key));
        let tpl = Arc::new(ShardTpl::new(shard_key));
        let limit = (worker > 0).then(|| Arc::new(Semaphore::new(worker)));

        let mut handles = Vec::with_capacity(self.target_groups.len());
        for g in &self.target_groups {
            let g = g.clone();
            let ring = ring.clone();
            let tpl = tpl.clone();
            let limit = limit.clone();
            let pr_chans = pr_chans.clone();
            let ctx = WorkerContext {
                data_dir: self.data_dir.clone(),
                db: self.db.clone(),
                rp: self.rp.clone(),
                sd: self.sd,
                source_groups: self.source_groups.clone(),
            };

            handles.push(tokio::spawn(async move {
                let _permit = match &limit {
                    Some(limit) => Some(limit.clone().acquire_owned().await.unwrap()),
                    None => None,
                };

                let (min, max) = (g.start_time, g.end_time);
                match ctx.export_group(&g, &ring, &tpl, &pr_chans).await {
                    Ok(()) => info!("shard group done: {}", g.id),
                    Err(e) => warn!(
                        "export worker error: {}, shard group: {}, min: {}, max: {}",
                        e,
                        g.id,
                        min / 1_000_000_000,
                        max / 1_000_000_000
                    ),
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("all shard groups done");
    }
}

struct WorkerContext {
    data_dir: PathBuf,
    db: String,
    rp: String,
    sd: i64,
    source_groups: Vec<ShardGroupInfo>,
}

impl WorkerContext {
    /// export_group reads one target window from the source shards that
    /// overlap it and writes one bucket per participating node.
    async fn export_group(
        &self,
        g: &ShardGroupInfo,
        ring: &ConsistentHash,
        tpl: &ShardTpl,
        pr_chans: &HashMap<usize, mpsc::Sender<DuplexStream>>,
    ) -> anyhow::Result<()> {
        let (min, max) = (g.start_time, g.end_time);

        let shard_ids: Vec<u64> = self
            .source_groups
            .iter()
            .filter(|sg| sg.overlaps(min, max - 1))
            .flat_map(|sg| sg.shards.iter().map(|s| s.id))
            .collect();

        let store = Store::open(&self.data_dir, &self.db, &self.rp, &shard_ids).await?;
        let mut rs = store.read(min, max - 1);

        let mut writers: HashMap<usize, binary::Writer<DuplexStream>> = HashMap::new();
        let res = async {
            while let Some(mut entry) = rs.try_next().await? {
                if need_escape(&entry.name, &entry.tags) {
                    warn!(
                        "discard escaped measurement: {}, series key: {}",
                        String::from_utf8_lossy(&entry.name),
                        String::from_utf8_lossy(&entry.series_key)
                    );
                    continue;
                }

                let node_index = ring.get(&tpl.get_key(&self.db, &entry.name));
                let pr_chan = match pr_chans.get(&node_index) {
                    Some(pr_chan) => pr_chan,
                    None => continue,
                };

                if !writers.contains_key(&node_index) {
                    let (pw, pr) = duplex(PIPE_BUFFER_SIZE);
                    let mut w = binary::Writer::new(pw, &self.db, &self.rp, self.sd);
                    w.begin_bucket(min, max).await?;
                    pr_chan
                        .send(pr)
                        .await
                        .map_err(|_| anyhow!("node {} reader channel closed", node_index))?;
                    writers.insert(node_index, w);
                }

                let w = writers.get_mut(&node_index).unwrap();
                w.write_series(&entry.series_key, &entry.field, entry.field_type)
                    .await?;
                while let Some(batch) = entry.next_batch() {
                    w.write_batch(&batch).await?;
                }
                w.end_series().await?;
            }

            for (_, mut w) in writers.drain() {
                w.end_bucket().await?;
                w.close().await?;
            }
            Ok(())
        }
        .await;

        rs.close().await?;
        res
    }
}
