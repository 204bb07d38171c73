use serde::{Deserialize, Serialize};

/// MIN_RETENTION_POLICY_DURATION is the shortest non-infinite duration a
/// retention policy may carry; shorter requests are rejected, zero means
/// keep forever.
pub const MIN_RETENTION_POLICY_DURATION: i64 = 3600 * 1_000_000_000;

/// Data is the top-level catalog snapshot for one storage root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Data {
    pub max_shard_group_id: u64,
    pub max_shard_id: u64,
    pub databases: Vec<DatabaseInfo>,
}

impl Data {
    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|db| db.name == name)
    }

    pub fn database_mut(&mut self, name: &str) -> Option<&mut DatabaseInfo> {
        self.databases.iter_mut().find(|db| db.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub default_retention_policy: String,
    pub retention_policies: Vec<RetentionPolicyInfo>,
}

impl DatabaseInfo {
    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    pub fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        self.retention_policies.iter_mut().find(|rp| rp.name == name)
    }
}

/// RetentionPolicyInfo is a stored retention policy. Durations are in
/// nanoseconds; a `duration` of zero keeps data forever.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    pub replica_n: usize,
    pub duration: i64,
    pub shard_group_duration: i64,
    pub shard_groups: Vec<ShardGroupInfo>,
}

impl RetentionPolicyInfo {
    pub fn new(spec: &RetentionPolicySpec) -> Self {
        Self {
            name: spec.name.clone(),
            replica_n: spec.replica_n.unwrap_or(1),
            duration: spec.duration.unwrap_or(0),
            shard_group_duration: spec.shard_group_duration,
            shard_groups: Vec::new(),
        }
    }

    /// matches reports whether this policy is compatible with `spec`:
    /// `duration` and `replica_n` are compared only when the spec carries
    /// them, `shard_group_duration` always.
    pub fn matches(&self, spec: &RetentionPolicySpec) -> bool {
        if let Some(d) = spec.duration {
            if self.duration != d {
                return false;
            }
        }
        if let Some(n) = spec.replica_n {
            if self.replica_n != n {
                return false;
            }
        }
        self.shard_group_duration == spec.shard_group_duration
    }

    /// shard_group_by_timestamp returns the group whose window contains `t`.
    pub fn shard_group_by_timestamp(&self, t: i64) -> Option<&ShardGroupInfo> {
        self.shard_groups.iter().find(|g| g.contains(t))
    }
}

/// RetentionPolicySpec is the requested shape of a retention policy;
/// optional fields default when the policy is created and are ignored when
/// matching an existing one.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicySpec {
    pub name: String,
    pub replica_n: Option<usize>,
    pub duration: Option<i64>,
    pub shard_group_duration: i64,
}

/// ShardGroupInfo is a time-window container of shards. The window is
/// half-open: `[start_time, end_time)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardGroupInfo {
    pub id: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    /// overlaps reports whether the group window intersects the inclusive
    /// range `[min, max]`.
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        self.start_time <= max && self.end_time > min
    }

    /// contains reports whether `t` falls inside the group window.
    pub fn contains(&self, t: i64) -> bool {
        self.start_time <= t && t < self.end_time
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: u64,
}
