//! Target shard-group planning.

use influxdb_meta::ShardGroupInfo;
use influxdb_utils::time::truncate_nanos;

/// make_shard_groups_for_duration tiles `[min, max]` with consecutive
/// windows of length `sd`, aligned to multiples of `sd` in UTC.
fn make_shard_groups_for_duration(min: i64, max: i64, sd: i64) -> Vec<ShardGroupInfo> {
    let mut start = truncate_nanos(min, sd);
    let end = truncate_nanos(max, sd) + sd;

    let mut groups = Vec::with_capacity(((end - start) / sd) as usize);
    let mut id = 0;
    while start < end {
        groups.push(ShardGroupInfo {
            id,
            start_time: start,
            end_time: start + sd,
            shards: Vec::new(),
        });
        id += 1;
        start += sd;
    }
    groups
}

/// plan_shard_groups emits the canonical target windows of length `sd` that
/// intersect the requested `[start, end]` range and overlap at least one
/// source shard group. `source_groups` must be sorted by start time.
pub fn plan_shard_groups(
    source_groups: &[ShardGroupInfo],
    sd: i64,
    start: i64,
    end: i64,
) -> Vec<ShardGroupInfo> {
    let mut target = Vec::new();
    if source_groups.is_empty() {
        return target;
    }

    let min = source_groups[0].start_time;
    let max = source_groups[source_groups.len() - 1].end_time;
    for g in make_shard_groups_for_duration(min, max, sd) {
        if g.start_time > end || g.end_time <= start {
            continue;
        }
        // end_time - 1 matches the half-open group interval
        if has_shard_group_for_time_range(source_groups, g.start_time, g.end_time - 1) {
            target.push(g);
        }
    }
    target
}

fn has_shard_group_for_time_range(groups: &[ShardGroupInfo], min: i64, max: i64) -> bool {
    groups.iter().any(|g| g.overlaps(min, max))
}
