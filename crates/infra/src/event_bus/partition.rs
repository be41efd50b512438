//! Partition assignment for a logical topic.
//!
//! One topic is split into `partitions` stream keys. Every event of an
//! aggregate hashes to the same partition, and a partition is consumed in
//! order, which is what gives per-aggregate ordering end to end.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Stable across processes and releases, unlike `DefaultHasher`.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Partition for `key`. `partitions == 0` is treated as 1.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let partitions = u64::from(partitions.max(1));
    (fnv1a(key.as_bytes()) % partitions) as u32
}

pub fn stream_key(topic: &str, partition: u32) -> String {
    format!("{topic}:{partition}")
}

/// All stream keys of a topic, in partition order.
pub fn stream_keys(topic: &str, partitions: u32) -> Vec<String> {
    (0..partitions.max(1)).map(|p| stream_key(topic, p)).collect()
}
