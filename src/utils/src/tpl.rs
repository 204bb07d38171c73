//! Shard-key templates.
//!
//! A template such as `"shard-%db-%mm-key"` decomposes into an ordered list
//! of literal and variable parts plus a frequency map of each variable.
//! Rendering substitutes the per-point context into the variable parts.

use std::collections::HashMap;

pub const SHARD_KEY_VAR_ORG: &str = "%org";
pub const SHARD_KEY_VAR_BK: &str = "%bk";
pub const SHARD_KEY_VAR_DB: &str = "%db";
pub const SHARD_KEY_VAR_MM: &str = "%mm";

const SHARD_KEY_VARS: [&str; 4] = [
    SHARD_KEY_VAR_ORG,
    SHARD_KEY_VAR_BK,
    SHARD_KEY_VAR_DB,
    SHARD_KEY_VAR_MM,
];

/// ShardTpl is a parsed shard-key template.
pub struct ShardTpl {
    parts: Vec<String>,
    freq: HashMap<&'static str, usize>,
}

impl ShardTpl {
    /// new parses `tpl` greedily: at each position any matching variable
    /// token is consumed as a part, otherwise one literal character is
    /// appended to the current literal part.
    pub fn new(tpl: &str) -> Self {
        let mut parts = Vec::new();
        let mut freq: HashMap<&'static str, usize> = HashMap::new();
        let mut literal = String::new();

        let mut rest = tpl;
        'outer: while !rest.is_empty() {
            for var in SHARD_KEY_VARS {
                if rest.starts_with(var) {
                    if !literal.is_empty() {
                        parts.push(std::mem::take(&mut literal));
                    }
                    parts.push(var.to_string());
                    *freq.entry(var).or_insert(0) += 1;
                    rest = &rest[var.len()..];
                    continue 'outer;
                }
            }
            let c = rest.chars().next().unwrap();
            literal.push(c);
            rest = &rest[c.len_utf8()..];
        }
        if !literal.is_empty() {
            parts.push(literal);
        }

        Self { parts, freq }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn freq(&self, var: &str) -> usize {
        self.freq.get(var).copied().unwrap_or_default()
    }

    /// get_key renders the template with the v1 context `(db, measurement)`.
    /// The measurement is raw bytes and is substituted verbatim.
    pub fn get_key(&self, db: &str, mm: &[u8]) -> Vec<u8> {
        let mut sizes = HashMap::new();
        sizes.insert(SHARD_KEY_VAR_DB, db.len());
        sizes.insert(SHARD_KEY_VAR_MM, mm.len());

        let mut out = Vec::with_capacity(self.render_size(&sizes));
        for part in &self.parts {
            match part.as_str() {
                SHARD_KEY_VAR_DB => out.extend_from_slice(db.as_bytes()),
                SHARD_KEY_VAR_MM => out.extend_from_slice(mm),
                _ => out.extend_from_slice(part.as_bytes()),
            }
        }
        out
    }

    /// get_key_v2 renders the template with the v2 context
    /// `(org, bucket, measurement)`.
    pub fn get_key_v2(&self, org: &str, bk: &str, mm: &str) -> Vec<u8> {
        let mut sizes = HashMap::new();
        sizes.insert(SHARD_KEY_VAR_ORG, org.len());
        sizes.insert(SHARD_KEY_VAR_BK, bk.len());
        sizes.insert(SHARD_KEY_VAR_MM, mm.len());

        let mut out = Vec::with_capacity(self.render_size(&sizes));
        for part in &self.parts {
            match part.as_str() {
                SHARD_KEY_VAR_ORG => out.extend_from_slice(org.as_bytes()),
                SHARD_KEY_VAR_BK => out.extend_from_slice(bk.as_bytes()),
                SHARD_KEY_VAR_MM => out.extend_from_slice(mm.as_bytes()),
                _ => out.extend_from_slice(part.as_bytes()),
            }
        }
        out
    }

    /// render_size pre-sizes the output buffer: the template length plus,
    /// for each variable, the length delta of its substitution times its
    /// frequency.
    fn render_size(&self, value_sizes: &HashMap<&'static str, usize>) -> usize {
        let tpl_len: usize = self.parts.iter().map(|p| p.len()).sum();
        let mut size = tpl_len as isize;
        for (var, value_len) in value_sizes {
            let freq = self.freq(var) as isize;
            size += (*value_len as isize - var.len() as isize) * freq;
        }
        size.max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Case {
        tpl: &'static str,
        parts: &'static [&'static str],
        db_cnt: usize,
        mm_cnt: usize,
        render: &'static str,
    }

    #[test]
    fn test_shard_tpl() {
        let db = "database";
        let mm = "measurement";
        let cases = [
            Case {
                tpl: "%db,%mm",
                parts: &["%db", ",", "%mm"],
                db_cnt: 1,
                mm_cnt: 1,
                render: "database,measurement",
            },
            Case {
                tpl: "shard-%db-%mm",
                parts: &["shard-", "%db", "-", "%mm"],
                db_cnt: 1,
                mm_cnt: 1,
                render: "shard-database-measurement",
            },
            Case {
                tpl: "%db-%mm-key",
                parts: &["%db", "-", "%mm", "-key"],
                db_cnt: 1,
                mm_cnt: 1,
                render: "database-measurement-key",
            },
            Case {
                tpl: "shard-%db-%mm-key",
                parts: &["shard-", "%db", "-", "%mm", "-key"],
                db_cnt: 1,
                mm_cnt: 1,
                render: "shard-database-measurement-key",
            },
            Case {
                tpl: "shard-%mm-%db-%mm-%db-key",
                parts: &["shard-", "%mm", "-", "%db", "-", "%mm", "-", "%db", "-key"],
                db_cnt: 2,
                mm_cnt: 2,
                render: "shard-measurement-database-measurement-database-key",
            },
            Case {
                tpl: "%db%mm",
                parts: &["%db", "%mm"],
                db_cnt: 1,
                mm_cnt: 1,
                render: "databasemeasurement",
            },
            Case {
                tpl: "shard%db%mm",
                parts: &["shard", "%db", "%mm"],
                db_cnt: 1,
                mm_cnt: 1,
                render: "sharddatabasemeasurement",
            },
            Case {
                tpl: "%db%mmkey",
                parts: &["%db", "%mm", "key"],
                db_cnt: 1,
                mm_cnt: 1,
                render: "databasemeasurementkey",
            },
            Case {
                tpl: "shard%db%mmkey",
                parts: &["shard", "%db", "%mm", "key"],
                db_cnt: 1,
                mm_cnt: 1,
                render: "sharddatabasemeasurementkey",
            },
            Case {
                tpl: "shard%mm%db%mm%dbkey",
                parts: &["shard", "%mm", "%db", "%mm", "%db", "key"],
                db_cnt: 2,
                mm_cnt: 2,
                render: "shardmeasurementdatabasemeasurementdatabasekey",
            },
        ];

        for c in cases {
            let st = ShardTpl::new(c.tpl);
            assert_eq!(st.parts(), c.parts, "tpl: {}", c.tpl);
            assert_eq!(st.freq(SHARD_KEY_VAR_DB), c.db_cnt, "tpl: {}", c.tpl);
            assert_eq!(st.freq(SHARD_KEY_VAR_MM), c.mm_cnt, "tpl: {}", c.tpl);
            let render = st.get_key(db, mm.as_bytes());
            assert_eq!(render, c.render.as_bytes(), "tpl: {}", c.tpl);
        }
    }

    struct CaseV2 {
        tpl: &'static str,
        parts: &'static [&'static str],
        org_cnt: usize,
        bk_cnt: usize,
        mm_cnt: usize,
        render: &'static str,
    }

    #[test]
    fn test_shard_tpl_v2() {
        let org = "org";
        let bk = "bucket";
        let mm = "measurement";
        let cases = [
            CaseV2 {
                tpl: "%org,%bk,%mm",
                parts: &["%org", ",", "%bk", ",", "%mm"],
                org_cnt: 1,
                bk_cnt: 1,
                mm_cnt: 1,
                render: "org,bucket,measurement",
            },
            CaseV2 {
                tpl: "shard-%org-%bk-%mm",
                parts: &["shard-", "%org", "-", "%bk", "-", "%mm"],
                org_cnt: 1,
                bk_cnt: 1,
                mm_cnt: 1,
                render: "shard-org-bucket-measurement",
            },
            CaseV2 {
                tpl: "%org-%bk-%mm-key",
                parts: &["%org", "-", "%bk", "-", "%mm", "-key"],
                org_cnt: 1,
                bk_cnt: 1,
                mm_cnt: 1,
                render: "org-bucket-measurement-key",
            },
            CaseV2 {
                tpl: "shard-%org-%bk-%mm-key",
                parts: &["shard-", "%org", "-", "%bk", "-", "%mm", "-key"],
                org_cnt: 1,
                bk_cnt: 1,
                mm_cnt: 1,
                render: "shard-org-bucket-measurement-key",
            },
            CaseV2 {
                tpl: "shard-%mm-%bk-%org-%mm-%bk-%org-key",
                parts: &[
                    "shard-", "%mm", "-", "%bk", "-", "%org", "-", "%mm", "-", "%bk", "-", "%org",
                    "-key",
                ],
                org_cnt: 2,
                bk_cnt: 2,
                mm_cnt: 2,
                render: "shard-measurement-bucket-org-measurement-bucket-org-key",
            },
            CaseV2 {
                tpl: "%org%bk%mm",
                parts: &["%org", "%bk", "%mm"],
                org_cnt: 1,
                bk_cnt: 1,
                mm_cnt: 1,
                render: "orgbucketmeasurement",
            },
            CaseV2 {
                tpl: "shard%org%bk%mm",
                parts: &["shard", "%org", "%bk", "%mm"],
                org_cnt: 1,
                bk_cnt: 1,
                mm_cnt: 1,
                render: "shardorgbucketmeasurement",
            },
            CaseV2 {
                tpl: "%org%bk%mmkey",
                parts: &["%org", "%bk", "%mm", "key"],
                org_cnt: 1,
                bk_cnt: 1,
                mm_cnt: 1,
                render: "orgbucketmeasurementkey",
            },
            CaseV2 {
                tpl: "shard%org%bk%mmkey",
                parts: &["shard", "%org", "%bk", "%mm", "key"],
                org_cnt: 1,
                bk_cnt: 1,
                mm_cnt: 1,
                render: "shardorgbucketmeasurementkey",
            },
            CaseV2 {
                tpl: "shard%mm%bk%org%mm%bk%orgkey",
                parts: &["shard", "%mm", "%bk", "%org", "%mm", "%bk", "%org", "key"],
                org_cnt: 2,
                bk_cnt: 2,
                mm_cnt: 2,
                render: "shardmeasurementbucketorgmeasurementbucketorgkey",
            },
        ];

        for c in cases {
            let st = ShardTpl::new(c.tpl);
            assert_eq!(st.parts(), c.parts, "tpl: {}", c.tpl);
            assert_eq!(st.freq(SHARD_KEY_VAR_ORG), c.org_cnt, "tpl: {}", c.tpl);
            assert_eq!(st.freq(SHARD_KEY_VAR_BK), c.bk_cnt, "tpl: {}", c.tpl);
            assert_eq!(st.freq(SHARD_KEY_VAR_MM), c.mm_cnt, "tpl: {}", c.tpl);
            let render = st.get_key_v2(org, bk, mm);
            assert_eq!(render, c.render.as_bytes(), "tpl: {}", c.tpl);
        }
    }
}
