//! Consistent-hash router.
//!
//! Nodes are inserted into the ring under a string derived from their index
//! and a hash-key scheme; lookups walk the ring clockwise from the hash of
//! the routing key and translate the owning node string back to its index.

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;

/// Hash-key scheme inserting each node under `itoa(idx)`.
pub const HASH_KEY_IDX: &str = "idx";

/// Hash-key scheme inserting each node under `"|" + itoa(idx)`, which
/// lowers ring collisions between neighbouring indexes.
pub const HASH_KEY_EXI: &str = "exi";

/// Variable token replaced by `itoa(idx)` in template hash-key schemes.
pub const HASH_KEY_VAR_IDX: &str = "%idx";

/// Number of virtual replicas each node contributes to the ring. Sized so
/// each node's share of the circle stays within 12% of 1/N.
const NUMBER_OF_REPLICAS: usize = 1024;

/// ring_point hashes bytes onto the ring circle. The crc of short, similar
/// strings is strongly correlated, so the value is passed through an
/// avalanche mix before use as a ring position.
fn ring_point(buf: &[u8]) -> u32 {
    let mut h = crc32fast::hash(buf);
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// node_str renders the ring-entry string for node `idx` under `hash_key`.
pub fn node_str(idx: usize, hash_key: &str) -> String {
    match hash_key {
        HASH_KEY_IDX => idx.to_string(),
        HASH_KEY_EXI => format!("|{}", idx),
        _ => hash_key.replace(HASH_KEY_VAR_IDX, &idx.to_string()),
    }
}

/// ConsistentHash maps routing keys to node indexes. Construction happens
/// once; lookups are cached and safe for concurrent callers.
pub struct ConsistentHash {
    ring: BTreeMap<u32, String>,
    index: HashMap<String, usize>,
    cache: DashMap<Vec<u8>, usize>,
}

impl ConsistentHash {
    pub fn new(node_total: usize, hash_key: &str) -> Self {
        let mut ring = BTreeMap::new();
        let mut index = HashMap::with_capacity(node_total);
        for idx in 0..node_total {
            let s = node_str(idx, hash_key);
            for replica in 0..NUMBER_OF_REPLICAS {
                let point = ring_point(format!("{}{}", replica, s).as_bytes());
                ring.insert(point, s.clone());
            }
            index.insert(s, idx);
        }

        Self {
            ring,
            index,
            cache: DashMap::new(),
        }
    }

    pub fn node_total(&self) -> usize {
        self.index.len()
    }

    /// get returns the index of the node owning the hash band of `key`.
    pub fn get(&self, key: &[u8]) -> usize {
        if let Some(idx) = self.cache.get(key) {
            return *idx;
        }

        let point = ring_point(key);
        let node = self
            .ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, s)| s.as_str())
            .unwrap_or_default();
        let idx = self.index.get(node).copied().unwrap_or_default();

        self.cache.insert(key.to_vec(), idx);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_str() {
        assert_eq!(node_str(3, HASH_KEY_IDX), "3");
        assert_eq!(node_str(3, HASH_KEY_EXI), "|3");
        assert_eq!(node_str(3, "node-%idx-ring"), "node-3-ring");
        assert_eq!(node_str(7, "%idx/%idx"), "7/7");
    }

    #[test]
    fn test_get_deterministic() {
        let a = ConsistentHash::new(8, HASH_KEY_IDX);
        let b = ConsistentHash::new(8, HASH_KEY_IDX);
        for i in 0..1000 {
            let key = format!("db,measurement-{}", i);
            let idx = a.get(key.as_bytes());
            assert_eq!(idx, b.get(key.as_bytes()));
            // cached lookup returns the same index
            assert_eq!(idx, a.get(key.as_bytes()));
            assert!(idx < 8);
        }
    }

    #[test]
    fn test_get_distribution() {
        let node_total = 10;
        let keys_per_node = 1000;
        let ch = ConsistentHash::new(node_total, HASH_KEY_IDX);

        let mut dist = vec![0usize; node_total];
        for i in 0..node_total * keys_per_node {
            let key = format!("db,measurement-{}", i);
            dist[ch.get(key.as_bytes())] += 1;
        }

        // each node should receive 1/N of the keys within a 12% tolerance
        let expect = keys_per_node as f64;
        for (idx, hits) in dist.iter().enumerate() {
            let deviation = (*hits as f64 - expect).abs() / expect;
            assert!(
                deviation <= 0.12,
                "node {} received {} of {} keys",
                idx,
                hits,
                node_total * keys_per_node
            );
        }
    }

    #[test]
    fn test_exi_reverse_map_bijective() {
        let node_total = 1000;
        let ch = ConsistentHash::new(node_total, HASH_KEY_EXI);
        for i in 0..node_total {
            let s = node_str(i, HASH_KEY_EXI);
            assert_eq!(ch.index[&s], i);
        }
        assert_eq!(ch.index.len(), node_total);
        for i in 0..node_total {
            let key = format!("|{}", i);
            assert!(ch.get(key.as_bytes()) < node_total);
        }
    }

    #[test]
    fn test_template_scheme() {
        let ch = ConsistentHash::new(4, "node-%idx");
        for i in 0..100 {
            let key = format!("db,mm-{}", i);
            assert!(ch.get(key.as_bytes()) < 4);
        }
    }
}
