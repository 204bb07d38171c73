use std::path::{Path, PathBuf};

use influxdb_utils::time::truncate_nanos;

use crate::data::{
    Data, DatabaseInfo, RetentionPolicyInfo, RetentionPolicySpec, ShardGroupInfo, ShardInfo,
    MIN_RETENTION_POLICY_DURATION,
};

/// META_FILE is the catalog snapshot file name inside the meta directory.
pub const META_FILE: &str = "meta.db";

/// MetaClient owns the catalog of one storage root. Every mutation persists
/// the snapshot before returning.
pub struct MetaClient {
    path: PathBuf,
    data: Data,
}

impl MetaClient {
    /// open loads the snapshot under `meta_dir`, creating the directory and
    /// an empty catalog when none exists yet.
    pub async fn open(meta_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let meta_dir = meta_dir.as_ref();
        tokio::fs::create_dir_all(meta_dir)
            .await
            .map_err(|e| anyhow!("meta dir {} mkdir error: {}", meta_dir.display(), e))?;

        let path = meta_dir.join(META_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(buf) => serde_json::from_slice(&buf)
                .map_err(|e| anyhow!("meta {} parse error: {}", path.display(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Data::default(),
            Err(e) => return Err(anyhow!("meta {} read error: {}", path.display(), e)),
        };

        Ok(Self { path, data })
    }

    async fn save(&self) -> anyhow::Result<()> {
        let buf = serde_json::to_vec_pretty(&self.data)?;
        let tmp = self.path.with_extension("db.tmp");
        tokio::fs::write(&tmp, &buf)
            .await
            .map_err(|e| anyhow!("meta {} write error: {}", tmp.display(), e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| anyhow!("meta {} rename error: {}", self.path.display(), e))
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.data.database(name)
    }

    /// retention_policy looks up `rp` in `db`; the database must exist.
    pub fn retention_policy(
        &self,
        db: &str,
        rp: &str,
    ) -> anyhow::Result<Option<&RetentionPolicyInfo>> {
        let dbi = self
            .data
            .database(db)
            .ok_or_else(|| anyhow!("database '{}' does not exist", db))?;
        Ok(dbi.retention_policy(rp))
    }

    pub async fn create_database(&mut self, name: &str) -> anyhow::Result<()> {
        if self.data.database(name).is_some() {
            return Ok(());
        }
        self.data.databases.push(DatabaseInfo {
            name: name.to_string(),
            ..Default::default()
        });
        self.save().await
    }

    /// create_database_with_retention_policy creates the database and its
    /// default retention policy in one step.
    pub async fn create_database_with_retention_policy(
        &mut self,
        name: &str,
        spec: &RetentionPolicySpec,
    ) -> anyhow::Result<()> {
        validate_spec(spec)?;
        if self.data.database(name).is_none() {
            self.data.databases.push(DatabaseInfo {
                name: name.to_string(),
                ..Default::default()
            });
        }

        let dbi = self.data.database_mut(name).unwrap();
        if let Some(rpi) = dbi.retention_policy(&spec.name) {
            if !rpi.matches(spec) {
                return Err(anyhow!(
                    "retention policy {} already exists with different parameters",
                    spec.name
                ));
            }
        } else {
            dbi.retention_policies.push(RetentionPolicyInfo::new(spec));
        }
        dbi.default_retention_policy = spec.name.clone();
        self.save().await
    }

    /// create_retention_policy adds `spec` to `db`. Creating a policy that
    /// already exists is a no-op when the parameters match and an error
    /// otherwise; an existing policy is never reconfigured.
    pub async fn create_retention_policy(
        &mut self,
        db: &str,
        spec: &RetentionPolicySpec,
    ) -> anyhow::Result<()> {
        validate_spec(spec)?;
        let dbi = self
            .data
            .database_mut(db)
            .ok_or_else(|| anyhow!("database '{}' does not exist", db))?;

        if let Some(rpi) = dbi.retention_policy(&spec.name) {
            if !rpi.matches(spec) {
                return Err(anyhow!(
                    "retention policy {} already exists with different parameters",
                    spec.name
                ));
            }
            return Ok(());
        }

        dbi.retention_policies.push(RetentionPolicyInfo::new(spec));
        if dbi.default_retention_policy.is_empty() {
            dbi.default_retention_policy = spec.name.clone();
        }
        self.save().await
    }

    /// shard_groups_by_time_range returns the groups of `db`.`rp` whose
    /// windows overlap the inclusive range `[min, max]`, sorted by start.
    pub fn shard_groups_by_time_range(
        &self,
        db: &str,
        rp: &str,
        min: i64,
        max: i64,
    ) -> anyhow::Result<Vec<ShardGroupInfo>> {
        let rpi = self
            .retention_policy(db, rp)?
            .ok_or_else(|| anyhow!("retention policy '{}' does not exist", rp))?;

        let mut groups: Vec<ShardGroupInfo> = rpi
            .shard_groups
            .iter()
            .filter(|g| g.overlaps(min, max))
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.start_time);
        Ok(groups)
    }

    /// create_shard_group creates (or returns) the group of `db`.`rp` whose
    /// window contains `timestamp`. New windows are aligned to the policy's
    /// shard-group duration and own exactly one shard.
    pub async fn create_shard_group(
        &mut self,
        db: &str,
        rp: &str,
        timestamp: i64,
    ) -> anyhow::Result<ShardGroupInfo> {
        let next_group_id = self.data.max_shard_group_id + 1;
        let next_shard_id = self.data.max_shard_id + 1;

        let dbi = self
            .data
            .database_mut(db)
            .ok_or_else(|| anyhow!("database '{}' does not exist", db))?;
        let rpi = dbi
            .retention_policy_mut(rp)
            .ok_or_else(|| anyhow!("retention policy '{}' does not exist", rp))?;

        if let Some(g) = rpi.shard_group_by_timestamp(timestamp) {
            return Ok(g.clone());
        }

        let start = truncate_nanos(timestamp, rpi.shard_group_duration);
        let group = ShardGroupInfo {
            id: next_group_id,
            start_time: start,
            end_time: start + rpi.shard_group_duration,
            shards: vec![ShardInfo { id: next_shard_id }],
        };
        rpi.shard_groups.push(group.clone());
        rpi.shard_groups.sort_by_key(|g| g.start_time);

        self.data.max_shard_group_id = next_group_id;
        self.data.max_shard_id = next_shard_id;
        self.save().await?;
        Ok(group)
    }

    /// delete_shard_group removes the group record `id` from `db`.`rp`.
    pub async fn delete_shard_group(&mut self, db: &str, rp: &str, id: u64) -> anyhow::Result<()> {
        let dbi = self
            .data
            .database_mut(db)
            .ok_or_else(|| anyhow!("database '{}' does not exist", db))?;
        let rpi = dbi
            .retention_policy_mut(rp)
            .ok_or_else(|| anyhow!("retention policy '{}' does not exist", rp))?;
        rpi.shard_groups.retain(|g| g.id != id);
        self.save().await
    }
}

fn validate_spec(spec: &RetentionPolicySpec) -> anyhow::Result<()> {
    if spec.name.is_empty() {
        return Err(anyhow!("retention policy name required"));
    }
    if spec.shard_group_duration <= 0 {
        return Err(anyhow!("shard group duration must be positive"));
    }
    if let Some(d) = spec.duration {
        if d != 0 && d < MIN_RETENTION_POLICY_DURATION {
            return Err(anyhow!("retention policy duration must be at least 1h0m0s"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3600 * 1_000_000_000;

    fn spec(sd: i64) -> RetentionPolicySpec {
        RetentionPolicySpec {
            name: "autogen".to_string(),
            replica_n: None,
            duration: None,
            shard_group_duration: sd,
        }
    }

    #[tokio::test]
    async fn test_create_database_and_rp() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MetaClient::open(dir.path()).await.unwrap();

        client
            .create_database_with_retention_policy("db", &spec(24 * HOUR))
            .await
            .unwrap();
        let dbi = client.database("db").unwrap();
        assert_eq!(dbi.default_retention_policy, "autogen");

        // matching spec is a no-op
        client
            .create_retention_policy("db", &spec(24 * HOUR))
            .await
            .unwrap();

        // mismatched shard-group duration fails
        let err = client
            .create_retention_policy("db", &spec(48 * HOUR))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("different parameters"));
    }

    #[tokio::test]
    async fn test_create_rp_validates_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MetaClient::open(dir.path()).await.unwrap();
        client.create_database("db").await.unwrap();

        let mut s = spec(24 * HOUR);
        s.duration = Some(30 * 60 * 1_000_000_000);
        assert!(client.create_retention_policy("db", &s).await.is_err());

        s.duration = Some(0);
        client.create_retention_policy("db", &s).await.unwrap();
    }

    #[tokio::test]
    async fn test_shard_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = MetaClient::open(dir.path()).await.unwrap();
        client
            .create_database_with_retention_policy("db", &spec(24 * HOUR))
            .await
            .unwrap();

        let g = client
            .create_shard_group("db", "autogen", 25 * HOUR)
            .await
            .unwrap();
        assert_eq!(g.start_time, 24 * HOUR);
        assert_eq!(g.end_time, 48 * HOUR);
        assert_eq!(g.shards.len(), 1);

        // a second create inside the same window reuses the group
        let g2 = client
            .create_shard_group("db", "autogen", 47 * HOUR)
            .await
            .unwrap();
        assert_eq!(g2.id, g.id);
        assert_eq!(g2.shards[0].id, g.shards[0].id);

        let groups = client
            .shard_groups_by_time_range("db", "autogen", 0, 100 * HOUR)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert!(client
            .shard_groups_by_time_range("db", "autogen", 0, 23 * HOUR)
            .unwrap()
            .is_empty());

        client
            .delete_shard_group("db", "autogen", g.id)
            .await
            .unwrap();
        assert!(client
            .shard_groups_by_time_range("db", "autogen", 0, 100 * HOUR)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut client = MetaClient::open(dir.path()).await.unwrap();
            client
                .create_database_with_retention_policy("db", &spec(24 * HOUR))
                .await
                .unwrap();
            client
                .create_shard_group("db", "autogen", 0)
                .await
                .unwrap();
        }

        let client = MetaClient::open(dir.path()).await.unwrap();
        let groups = client
            .shard_groups_by_time_range("db", "autogen", 0, i64::MAX - 1)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].shards.len(), 1);
    }
}
