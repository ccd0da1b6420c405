use std::hash::{Hash, Hasher};

use crate::CallKey;

/// Simple, stable hash for stickiness keys using SipHash.
fn siphash_str(s: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Shard index responsible for a Call-ID.
///
/// Stable for the lifetime of the process: the same Call-ID always lands on
/// the same shard for a fixed pool size.
pub fn shard_for_call_id(call_id: &str, shards: usize) -> usize {
    debug_assert!(shards > 0);
    (siphash_str(call_id) % shards.max(1) as u64) as usize
}

/// Shard index responsible for a call key; only the Call-ID participates.
pub fn shard_for_key(key: &CallKey, shards: usize) -> usize {
    shard_for_call_id(key.call_id.as_str(), shards)
}
