use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use common_base::{MAX_NANO_TIME, MIN_NANO_TIME};
use influxdb_meta::META_FILE;
use influxdb_transfer::exporter::Exporter;
use influxdb_transfer::importer::Importer;
use influxdb_transfer::READER_CHANNEL_CAPACITY;
use influxdb_utils::hash::{HASH_KEY_EXI, HASH_KEY_IDX, HASH_KEY_VAR_IDX};
use influxdb_utils::time::{parse_duration, parse_rfc3339_nanos};
use influxdb_utils::tpl::{SHARD_KEY_VAR_DB, SHARD_KEY_VAR_MM};

#[derive(Debug, Parser)]
pub struct Config {
    /// source influxdb directory containing meta, data and wal (required)
    #[clap(short, long)]
    source_dir: String,
    /// target influxdb directory containing meta, data and wal (required)
    #[clap(short, long)]
    target_dir: String,
    /// database name (required)
    #[clap(short, long)]
    database: String,
    /// retention policy
    #[clap(short, long, default_value = "autogen")]
    retention_policy: String,
    /// retention policy duration
    #[clap(long, default_value = "0")]
    duration: String,
    /// retention policy shard duration
    #[clap(long, default_value = "168h")]
    shard_duration: String,
    /// start time to transfer (RFC3339 format, optional)
    #[clap(short = 'S', long)]
    start: Option<String>,
    /// end time to transfer (RFC3339 format, optional)
    #[clap(short = 'E', long)]
    end: Option<String>,
    /// number of concurrent workers to transfer (0 for unlimited)
    #[clap(short, long, default_value_t = 0)]
    worker: usize,
    /// skip building TSI index on disk
    #[clap(long)]
    skip_tsi: bool,
    /// total number of node in target circle
    #[clap(short, long, default_value_t = 1)]
    node_total: usize,
    /// index of node in target circle delimited by comma, [0, node-total) (default: all)
    #[clap(short = 'i', long)]
    node_index: Option<String>,
    /// hash key for influx proxy: idx, exi or template containing %idx
    #[clap(short = 'k', long, default_value = "idx")]
    hash_key: String,
    /// shard key for influx proxy, which containing %db or %mm
    #[clap(short = 'K', long, default_value = "%db,%mm")]
    shard_key: String,
}

struct Validated {
    duration: i64,
    shard_duration: i64,
    start_time: i64,
    end_time: i64,
    node_index: Vec<usize>,
}

fn validate(config: &Config) -> anyhow::Result<Validated> {
    let start_time = match &config.start {
        Some(s) => parse_rfc3339_nanos(s).map_err(|_| anyhow!("start time is invalid"))?,
        None => MIN_NANO_TIME,
    };
    let end_time = match &config.end {
        Some(s) => parse_rfc3339_nanos(s).map_err(|_| anyhow!("end time is invalid"))?,
        None => MAX_NANO_TIME,
    };
    if end_time < start_time {
        return Err(anyhow!("end time before start time"));
    }

    if config.node_total == 0 {
        return Err(anyhow!("node-total is invalid"));
    }

    let mut node_index: Vec<usize> = match &config.node_index {
        Some(s) => {
            let mut out = Vec::new();
            for part in s.trim_matches(|c| c == ',' || c == ' ').split(',') {
                let idx: usize = part
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("node-index is invalid"))?;
                if idx >= config.node_total {
                    return Err(anyhow!("node-index is invalid"));
                }
                if !out.contains(&idx) {
                    out.push(idx);
                }
            }
            out
        }
        None => (0..config.node_total).collect(),
    };
    node_index.sort_unstable();

    if config.hash_key != HASH_KEY_IDX
        && config.hash_key != HASH_KEY_EXI
        && !config.hash_key.contains(HASH_KEY_VAR_IDX)
    {
        return Err(anyhow!(
            "hash-key is invalid, require idx, exi or template containing %idx"
        ));
    }
    if !config.shard_key.contains(SHARD_KEY_VAR_DB) && !config.shard_key.contains(SHARD_KEY_VAR_MM)
    {
        return Err(anyhow!(
            "shard-key is invalid, require template containing %db or %mm"
        ));
    }

    let duration = parse_duration(&config.duration)?;
    let shard_duration = parse_duration(&config.shard_duration)?;
    if shard_duration <= 0 {
        return Err(anyhow!("shard-duration is invalid"));
    }

    if !Path::new(&config.source_dir).join("data").exists() {
        return Err(anyhow!("source-dir not exist: {}", config.source_dir));
    }

    Ok(Validated {
        duration,
        shard_duration,
        start_time,
        end_time,
        node_index,
    })
}

fn target_dir(base: &str, idx: usize) -> String {
    format!("{}-{}", base.trim_end_matches('/'), idx)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let v = validate(&config)?;

    // Refuse a target that already is a storage root itself; the per-node
    // `-<i>` directories may exist from a previous source's run.
    if Path::new(&config.target_dir)
        .join("meta")
        .join(META_FILE)
        .exists()
    {
        return Err(anyhow!("target-dir already exist: {}", config.target_dir));
    }

    let exporter = Exporter::new(
        &config.source_dir,
        &config.database,
        &config.retention_policy,
        v.shard_duration,
        v.start_time,
        v.end_time,
    )
    .await?;
    let rp = exporter.rp().to_string();

    let mut importers = HashMap::new();
    for idx in &v.node_index {
        let importer = Importer::new(
            target_dir(&config.target_dir, *idx),
            &config.database,
            &rp,
            v.shard_duration,
            v.duration,
            !config.skip_tsi,
        )
        .await?;
        importers.insert(*idx, importer);
    }

    info!(
        "transfer node total: {}, node index: {:?}, hash key: {}, shard key: {}",
        config.node_total, v.node_index, config.hash_key, config.shard_key
    );
    let started = Instant::now();

    let mut pr_chans = HashMap::new();
    let mut receivers = HashMap::new();
    for idx in &v.node_index {
        let (tx, rx) = mpsc::channel(READER_CHANNEL_CAPACITY);
        pr_chans.insert(*idx, tx);
        receivers.insert(*idx, rx);
    }

    let export = tokio::spawn({
        let node_total = config.node_total;
        let hash_key = config.hash_key.clone();
        let shard_key = config.shard_key.clone();
        async move {
            exporter
                .write_to(pr_chans, node_total, &hash_key, &shard_key, config.worker)
                .await;
        }
    });

    let mut imports = Vec::new();
    for (idx, importer) in importers {
        let rx = receivers.remove(&idx).unwrap();
        imports.push(tokio::spawn(async move {
            importer.run(rx, idx).await;
            importer.close().await
        }));
    }

    export.await.map_err(|e| anyhow!(e))?;
    for handle in imports {
        handle.await.map_err(|e| anyhow!(e))??;
    }

    let elapsed = started.elapsed();
    if elapsed.as_secs_f64() > 600.0 {
        info!("total time: {:.1} minutes", elapsed.as_secs_f64() / 60.0);
    } else {
        info!("total time: {:.1} seconds", elapsed.as_secs_f64());
    }
    info!("transfer done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        dir
    }

    fn base_config(source: &Path) -> Config {
        Config {
            source_dir: source.to_string_lossy().into_owned(),
            target_dir: "/tmp/target".to_string(),
            database: "db".to_string(),
            retention_policy: "autogen".to_string(),
            duration: "0".to_string(),
            shard_duration: "168h".to_string(),
            start: None,
            end: None,
            worker: 0,
            skip_tsi: false,
            node_total: 4,
            node_index: None,
            hash_key: "idx".to_string(),
            shard_key: "%db,%mm".to_string(),
        }
    }

    #[test]
    fn test_validate_defaults() {
        let source = source_fixture();
        let v = validate(&base_config(source.path())).unwrap();
        assert_eq!(v.node_index, vec![0, 1, 2, 3]);
        assert_eq!(v.start_time, MIN_NANO_TIME);
        assert_eq!(v.end_time, MAX_NANO_TIME);
        assert_eq!(v.shard_duration, 168 * 3600 * 1_000_000_000);
    }

    #[test]
    fn test_validate_source_dir() {
        let source = source_fixture();
        let mut config = base_config(source.path());
        config.source_dir = "/does/not/exist".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_node_index() {
        let source = source_fixture();
        let mut config = base_config(source.path());
        config.node_index = Some("2,0".to_string());
        assert_eq!(validate(&config).unwrap().node_index, vec![0, 2]);

        config.node_index = Some("4".to_string());
        assert!(validate(&config).is_err());

        config.node_index = None;
        config.node_total = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_keys() {
        let source = source_fixture();
        let mut config = base_config(source.path());
        config.hash_key = "bogus".to_string();
        assert!(validate(&config).is_err());
        config.hash_key = "node-%idx".to_string();
        assert!(validate(&config).is_ok());

        config.shard_key = "nothing".to_string();
        assert!(validate(&config).is_err());
        config.shard_key = "key-%mm".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_times() {
        let source = source_fixture();
        let mut config = base_config(source.path());
        config.start = Some("2024-01-02T00:00:00Z".to_string());
        config.end = Some("2024-01-01T00:00:00Z".to_string());
        assert!(validate(&config).is_err());

        config.end = Some("2024-01-03T00:00:00Z".to_string());
        assert!(validate(&config).is_ok());

        config.start = Some("not-a-time".to_string());
        assert!(validate(&config).is_err());
    }
}
