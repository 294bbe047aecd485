use crate::upstream::UpstreamClient;

use fnv::FnvHasher;
use std::hash::Hasher;

/// Maps keys onto a fixed set of upstream clients. Routing is a pure
/// function of the key bytes and the upstream count, so identical keys
/// always land on the same upstream for the lifetime of the process.
pub struct ShardMap {
    upstreams: Vec<UpstreamClient>,
}

impl ShardMap {
    pub fn new(upstreams: Vec<UpstreamClient>) -> Self {
        assert!(!upstreams.is_empty(), "shard map requires at least one upstream");

        Self { upstreams }
    }

    pub fn route(&self, key: &[u8]) -> &UpstreamClient {
        &self.upstreams[shard_index(key, self.upstreams.len())]
    }
}

/// FNV-1a over the key bytes, reduced onto the shard count.
pub(crate) fn shard_index(key: &[u8], shards: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    (hasher.finish() % shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        for shards in [1, 2, 3, 16] {
            for key in [&b"a"[..], b"foo", b"some/longer:key"] {
                assert_eq!(shard_index(key, shards), shard_index(key, shards));
            }
        }
    }

    #[test]
    fn in_range() {
        for shards in [1, 2, 3, 16] {
            for i in 0..64u32 {
                let key = format!("key_{i}");
                assert!(shard_index(key.as_bytes(), shards) < shards);
            }
        }
    }

    // fixed values: a change here means every deployed shard mapping moves
    #[test]
    fn stable_placement() {
        assert_eq!(shard_index(b"a", 2), 0);
        assert_eq!(shard_index(b"b", 2), 1);
        assert_eq!(shard_index(b"slow", 2), 0);
        assert_eq!(shard_index(b"fast", 2), 1);
        assert_eq!(shard_index(b"foo", 4), 3);
        assert_eq!(shard_index(b"bar", 4), 2);
    }

    #[test]
    fn spreads_keys() {
        let mut seen = [false; 4];
        for i in 0..64u32 {
            let key = format!("key_{i}");
            seen[shard_index(key.as_bytes(), 4)] = true;
        }
        assert!(seen.iter().filter(|&&s| s).count() > 1);
    }
}
