pub mod block;
pub mod compact;
pub mod index;
pub mod reader;
pub mod value;
pub mod varint;
pub mod writer;

/// MAGIC_NUMBER is written as the first 4 bytes of a data file to
/// identify the file as a tsm1 formatted file
pub const MAGIC_NUMBER: u32 = 0x16D116D1;

/// VERSION indicates the version of the TSM file format.
pub const VERSION: u8 = 1;

/// File header: | magic number(4B) | VERSION(1B) |
pub const HEADER: [u8; 5] = [22, 209, 22, 209, 1];

pub const TSM_FILE_EXTENSION: &str = "tsm";

pub const TOMBSTONE_FILE_EXTENSION: &str = "tombstone";

pub const TMP_TSM_FILE_EXTENSION: &str = "tmp";

/// size in bytes of an index entry
pub(crate) const INDEX_ENTRY_SIZE: usize = 28;

/// Max number of blocks for a given key that can exist in a single file
pub(crate) const MAX_INDEX_ENTRIES: usize = (1 << 16) - 1;

/// max length of a key in an index entry (measurement + tags)
pub(crate) const MAX_KEY_LENGTH: usize = (1 << 16) - 1;

/// The threshold amount data written before we periodically fsync a TSM file.  This helps avoid
/// long pauses due to very large fsyncs at the end of writing a TSM file.
pub(crate) const FSYNC_EVERY: u64 = 25 * 1024 * 1024;

/// MAX_POINTS_PER_BLOCK is the maximum number of points in an encoded block.
pub const MAX_POINTS_PER_BLOCK: usize = 1000;

/// MAX_SEGMENT_SIZE is the ceiling a segment file may grow to before the
/// writer rolls to the next one.
pub const MAX_SEGMENT_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// SERIES_FIELD_SEPARATOR joins a series key and a field name into the
/// composite key addressing one field of one series inside a segment.
pub const SERIES_FIELD_SEPARATOR: &str = "#!~#";

/// series_field_key composes the segment key for one field of one series.
pub fn series_field_key(series_key: &[u8], field: &[u8]) -> Vec<u8> {
    let sep = SERIES_FIELD_SEPARATOR.as_bytes();
    let mut key = Vec::with_capacity(series_key.len() + sep.len() + field.len());
    key.extend_from_slice(series_key);
    key.extend_from_slice(sep);
    key.extend_from_slice(field);
    key
}

/// series_and_field_from_composite_key splits a composite key back into its
/// series key and field name. A key without a separator is all series key.
pub fn series_and_field_from_composite_key(key: &[u8]) -> (&[u8], &[u8]) {
    let sep = SERIES_FIELD_SEPARATOR.as_bytes();
    if let Some(pos) = key
        .windows(sep.len())
        .position(|window| window == sep)
    {
        (&key[..pos], &key[pos + sep.len()..])
    } else {
        (key, &[])
    }
}

/// parse_tsm_file_name extracts the `(generation, sequence)` pair from a
/// `%09d-%09d.tsm` segment file name.
pub fn parse_tsm_file_name(name: &str) -> anyhow::Result<(u32, u32)> {
    let base = name
        .split('.')
        .next()
        .ok_or_else(|| anyhow!("invalid tsm file name: {}", name))?;
    let (gen, seq) = base
        .split_once('-')
        .ok_or_else(|| anyhow!("invalid tsm file name: {}", name))?;
    Ok((gen.parse()?, seq.parse()?))
}

/// tsm_file_name renders the `%09d-%09d.tsm` name of a segment file.
pub fn tsm_file_name(generation: u32, sequence: u32) -> String {
    format!(
        "{:09}-{:09}.{}",
        generation, sequence, TSM_FILE_EXTENSION
    )
}

/// TimeRange holds a min and max timestamp.
#[derive(Debug, Clone)]
pub struct TimeRange {
    pub min: i64,
    pub max: i64,
}

impl TimeRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn unbound() -> Self {
        Self::new(i64::MAX, i64::MIN)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.min <= other.max && self.max >= other.min
    }
}
