use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use influxdb_tsdb::engine::tsm1::compact::ShardCompactor;

#[derive(Debug, Parser)]
pub struct Config {
    /// path of shard to be compacted like /path/to/influxdb/data/db/rp (required)
    #[clap(short, long)]
    path: String,
    /// force compaction without prompting
    #[clap(short, long)]
    force: bool,
    /// number of concurrent workers to compact (0 for unlimited)
    #[clap(short, long, default_value_t = 0)]
    worker: usize,
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut entries = std::fs::read_dir(&config.path)
        .map_err(|e| anyhow!("read dir {} error: {}", config.path, e))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries.by_ref() {
        let entry = entry.map_err(|e| anyhow!(e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !entry.path().is_dir() || !name.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!(
                "shard-path is invalid, it should be like /path/to/influxdb/data/db/rp"
            ));
        }
        paths.push(entry.path());
    }
    paths.sort();

    info!("opening shard at path {:?}", config.path);

    if !config.force {
        print!("proceed? [N] ");
        std::io::stdout().flush().map_err(|e| anyhow!(e))?;
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map_err(|e| anyhow!("error reading stdin: {}", e))?;
        if line.trim().to_lowercase() != "y" {
            return Ok(());
        }
    }

    info!("compacting shard");

    let limit = (config.worker > 0).then(|| Arc::new(Semaphore::new(config.worker)));
    let mut handles = Vec::with_capacity(paths.len());
    for path in paths {
        let limit = limit.clone();
        handles.push(tokio::spawn(async move {
            let _permit = match &limit {
                Some(limit) => Some(limit.clone().acquire_owned().await.unwrap()),
                None => None,
            };

            let mut sc = match ShardCompactor::new(&path).await {
                Ok(sc) => sc,
                Err(e) => {
                    warn!("open shard {} error: {}", path.display(), e);
                    return;
                }
            };
            if let Err(e) = sc.compact_shard().await {
                warn!("compaction {} failed: {}", path.display(), e);
                return;
            }
            let new_tsm: Vec<String> = sc
                .new_tsm()
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            info!(
                "compaction {} succeeded with new tsm files: {}",
                path.display(),
                new_tsm.join(" ")
            );
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    info!("compaction shard done");
    Ok(())
}
