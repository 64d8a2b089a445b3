/// Partition of the outbox owned by one dispatcher replica.
///
/// A record belongs to shard `fnv1a(id) % count`. The hash is stored with the
/// row (`shard_key`) so the store can filter without recomputing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardIndex {
    pub index: u32,
    pub count: u32,
}

impl ShardIndex {
    /// `None` when `index` is out of range or `count` is zero
    pub fn new(index: u32, count: u32) -> Option<Self> {
        (count > 0 && index < count).then_some(Self { index, count })
    }

    pub fn owns(&self, record_id: &str) -> bool {
        shard_key(record_id) % self.count == self.index
    }
}

/// 32-bit FNV-1a of the record id
pub fn shard_key(record_id: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    record_id
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ byte as u32).wrapping_mul(PRIME))
}
