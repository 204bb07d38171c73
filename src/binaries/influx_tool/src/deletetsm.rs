use std::path::Path;

use clap::Parser;
use tracing::info;

use common_base::escape::valid_key_tokens;
use common_base::iterator::AsyncIterator;
use common_base::key::parse_key;
use influxdb_tsdb::engine::tsm1::reader::TSMReader;
use influxdb_tsdb::engine::tsm1::series_and_field_from_composite_key;
use influxdb_tsdb::engine::tsm1::writer::{DefaultTSMWriter, TSMWriter};
use influxdb_utils::time::{time_format, unix_nano_to_time};

#[derive(Debug, Parser)]
pub struct Config {
    /// the name of the measurement to remove
    #[clap(short, long, default_value = "")]
    measurement: String,
    /// remove all keys with non-printable unicode characters
    #[clap(short, long)]
    sanitize: bool,
    /// enable verbose logging
    #[clap(short, long)]
    verbose: bool,
    /// tsm file paths to rewrite
    #[clap(required = true)]
    path: Vec<String>,
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    if config.measurement.is_empty() && !config.sanitize {
        return Err(anyhow!("--measurement or --sanitize flag required"));
    }

    for path in &config.path {
        if config.verbose {
            info!("processing: {}", path);
        }
        process(&config, Path::new(path)).await?;
    }
    Ok(())
}

/// process rewrites one segment file in place, dropping the blocks whose
/// measurement matches or, under sanitize, whose key is not printable.
/// Failure at any step leaves the original file intact.
async fn process(config: &Config, path: &Path) -> anyhow::Result<()> {
    let mut reader = TSMReader::open(path)
        .await
        .map_err(|e| anyhow!("unable to read {}: {}", path.display(), e))?;

    // Remove previous temporary files.
    let output_path = path.with_file_name(format!(
        "{}.rewriting.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid path: {}", path.display()))?
    ));
    remove_if_exists(&output_path).await?;
    remove_if_exists(&output_path.with_extension("tmp.idx.tmp")).await?;

    let mut writer = DefaultTSMWriter::new(&output_path).await?;

    let mut itr = reader.block_iterator();
    while let Some(entry) = itr.try_next().await? {
        let (series_key, _) = series_and_field_from_composite_key(&entry.key);
        let (measurement, tags) = parse_key(series_key)?;

        // Skip the block if this is the measurement and time range we are deleting.
        let drop_block = (!config.measurement.is_empty()
            && measurement == config.measurement.as_bytes())
            || (config.sanitize && !valid_key_tokens(&measurement, &tags));
        if drop_block {
            if config.verbose {
                info!(
                    "deleting block: {} ({}-{}) sz={}",
                    String::from_utf8_lossy(&entry.key),
                    time_format(unix_nano_to_time(entry.min_time)),
                    time_format(unix_nano_to_time(entry.max_time)),
                    entry.block.len()
                );
            }
            continue;
        }

        writer
            .write_block(&entry.key, entry.min_time, entry.max_time, &entry.block)
            .await?;
    }

    writer.write_index().await?;
    writer.close().await?;
    reader.close().await?;

    // Replace the original file with the rewritten one.
    tokio::fs::rename(&output_path, path)
        .await
        .map_err(|e| anyhow!("rename {} error: {}", output_path.display(), e))
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!("remove {} error: {}", path.display(), e)),
    }
}
