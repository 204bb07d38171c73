use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::Path;

use clap::Parser;
use tracing::info;

use influxdb_utils::hash::{ConsistentHash, HASH_KEY_EXI, HASH_KEY_IDX, HASH_KEY_VAR_IDX};
use influxdb_utils::tpl::{
    ShardTpl, SHARD_KEY_VAR_BK, SHARD_KEY_VAR_DB, SHARD_KEY_VAR_MM, SHARD_KEY_VAR_ORG,
};

const STDOUT_MARK: &str = "-";

#[derive(Debug, Parser)]
pub struct Config {
    /// shard key version: v1 hashes (db, mm), v2 hashes (org, bk, mm)
    #[clap(long, default_value = "v1")]
    version: String,
    /// total number of node in a circle
    #[clap(short, long, default_value_t = 1)]
    node_total: usize,
    /// hash key for influx proxy: idx, exi or template containing %idx
    #[clap(short = 'k', long, default_value = "idx")]
    hash_key: String,
    /// shard key for influx proxy, v1 containing %db or %mm, v2 containing %org, %bk or %mm
    #[clap(short = 'K', long)]
    shard_key: Option<String>,
    /// database name, note that --file cannot be specified when --database specified
    #[clap(short, long, default_value = "")]
    database: String,
    /// organization name (v2), note that --file cannot be specified when --org specified
    #[clap(long, default_value = "")]
    org: String,
    /// bucket name (v2), note that --file cannot be specified when --bucket specified
    #[clap(long, default_value = "")]
    bucket: String,
    /// measurement name, note that --file cannot be specified when --measurement specified
    #[clap(short, long, default_value = "")]
    measurement: String,
    /// separator string to separate the fields of each line in the file
    #[clap(short, long, default_value = ",")]
    separator: String,
    /// path to the file to read, format of each line is like 'db,mm' (v1) or 'org,bk,mm' (v2)
    #[clap(short, long, default_value = "")]
    file: String,
    /// '-' for standard out or the distribution file to write to when --file specified
    #[clap(short = 'D', long, default_value = "./dist")]
    dist: String,
}

fn validate(config: &Config) -> anyhow::Result<()> {
    if config.version != "v1" && config.version != "v2" {
        return Err(anyhow!("version is invalid, require v1 or v2"));
    }
    if config.node_total == 0 {
        return Err(anyhow!("node-total is invalid"));
    }
    if config.hash_key != HASH_KEY_IDX
        && config.hash_key != HASH_KEY_EXI
        && !config.hash_key.contains(HASH_KEY_VAR_IDX)
    {
        return Err(anyhow!(
            "hash-key is invalid, require idx, exi or template containing %idx"
        ));
    }

    let shard_key = shard_key(config);
    if config.version == "v1" {
        if !shard_key.contains(SHARD_KEY_VAR_DB) && !shard_key.contains(SHARD_KEY_VAR_MM) {
            return Err(anyhow!(
                "shard-key is invalid, require template containing %db or %mm"
            ));
        }
    } else if !shard_key.contains(SHARD_KEY_VAR_ORG)
        && !shard_key.contains(SHARD_KEY_VAR_BK)
        && !shard_key.contains(SHARD_KEY_VAR_MM)
    {
        return Err(anyhow!(
            "shard-key is invalid, require template containing %org, %bk or %mm"
        ));
    }

    let direct = !config.database.is_empty()
        || !config.org.is_empty()
        || !config.bucket.is_empty()
        || !config.measurement.is_empty();
    if direct && !config.file.is_empty() {
        return Err(anyhow!(
            "--file cannot be specified when --database, --org, --bucket or --measurement specified"
        ));
    }
    if !direct && config.file.is_empty() {
        return Err(anyhow!(
            "--database, --org, --bucket, --measurement or --file flag required"
        ));
    }

    if !config.file.is_empty() {
        let info = std::fs::metadata(&config.file)
            .map_err(|_| anyhow!("file '{}' does not exist", config.file))?;
        if info.is_dir() {
            return Err(anyhow!("file '{}' is a directory", config.file));
        }
        if config.separator.is_empty() {
            return Err(anyhow!("--separator flag required"));
        }
        if config.dist.is_empty() {
            return Err(anyhow!("--dist flag required"));
        }
    }
    Ok(())
}

fn shard_key(config: &Config) -> String {
    match &config.shard_key {
        Some(key) => key.clone(),
        None if config.version == "v2" => format!(
            "{},{},{}",
            SHARD_KEY_VAR_ORG, SHARD_KEY_VAR_BK, SHARD_KEY_VAR_MM
        ),
        None => format!("{},{}", SHARD_KEY_VAR_DB, SHARD_KEY_VAR_MM),
    }
}

/// split_line splits one input line into the template context. v1 cuts at
/// the first separator; v2 splits at every separator and requires exactly
/// three fields.
fn split_line<'a>(line: &'a str, separator: &str, version: &str) -> Option<Vec<&'a str>> {
    if version == "v1" {
        let (db, mm) = line.split_once(separator)?;
        Some(vec![db, mm])
    } else {
        let parts: Vec<&str> = line.split(separator).collect();
        (parts.len() == 3).then_some(parts)
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    validate(&config)?;

    let shard_key = shard_key(&config);
    let ch = ConsistentHash::new(config.node_total, &config.hash_key);
    let st = ShardTpl::new(&shard_key);

    if config.file.is_empty() {
        let key = if config.version == "v1" {
            info!(
                "node total: {}, hash key: {}, shard key: {}, database: {}, measurement: {}",
                config.node_total, config.hash_key, shard_key, config.database, config.measurement
            );
            st.get_key(&config.database, config.measurement.as_bytes())
        } else {
            info!(
                "node total: {}, hash key: {}, shard key: {}, org: {}, bucket: {}, measurement: {}",
                config.node_total,
                config.hash_key,
                shard_key,
                config.org,
                config.bucket,
                config.measurement
            );
            st.get_key_v2(&config.org, &config.bucket, &config.measurement)
        };
        info!("node index: {}", ch.get(&key));
        return Ok(());
    }

    let out: Box<dyn Write> = if config.dist == STDOUT_MARK {
        Box::new(std::io::stdout())
    } else {
        Box::new(
            std::fs::File::create(&config.dist)
                .map_err(|e| anyhow!("create {} error: {}", config.dist, e))?,
        )
    };
    let mut w = BufWriter::with_capacity(1024 * 1024, out);

    let content = tokio::fs::read_to_string(Path::new(&config.file))
        .await
        .map_err(|e| anyhow!("read {} error: {}", config.file, e))?;

    let mut dist: HashMap<usize, usize> = HashMap::new();
    let mut warnings = 0usize;
    let mut total_hits = 0usize;
    for line in content.lines() {
        let key = match split_line(line, &config.separator, &config.version) {
            Some(parts) if config.version == "v1" => st.get_key(parts[0], parts[1].as_bytes()),
            Some(parts) => st.get_key_v2(parts[0], parts[1], parts[2]),
            None => {
                warnings += 1;
                writeln!(
                    w,
                    "warning: '{}' ignored since separator '{}' not found",
                    line, config.separator
                )
                .map_err(|e| anyhow!(e))?;
                continue;
            }
        };
        *dist.entry(ch.get(&key)).or_insert(0) += 1;
        total_hits += 1;
    }

    if warnings > 0 {
        writeln!(w).map_err(|e| anyhow!(e))?;
    }
    writeln!(
        w,
        "node total: {}, hash key: {}, shard key: {}, total hits: {}",
        config.node_total, config.hash_key, shard_key, total_hits
    )
    .map_err(|e| anyhow!(e))?;
    for i in 0..config.node_total {
        let hits = dist.get(&i).copied().unwrap_or_default();
        writeln!(
            w,
            "node index: {}, hits: {}, percent: {:4.1}%, expect: {:4.1}%",
            i,
            hits,
            hits as f64 * 100.0 / total_hits.max(1) as f64,
            100.0 / config.node_total as f64
        )
        .map_err(|e| anyhow!(e))?;
    }
    w.flush().map_err(|e| anyhow!(e))
}
