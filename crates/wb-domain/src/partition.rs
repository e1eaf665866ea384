//! Stream-to-partition hashing and partition assignment
//!
//! Streams are sharded into partitions by a stable hash so that every
//! instance, on any architecture, places a given stream in the same
//! partition. Partitions are then dealt out across the live instance set
//! by index: instance `k` of `n` owns exactly the partitions where
//! `p mod n == k`.

use sha2::{Digest, Sha256};

/// Stable partition for a stream key.
pub fn partition_for_stream(stream_id: &str, partition_count: u32) -> u32 {
    assert!(partition_count > 0, "partition_count must be positive");
    (stream_hash(stream_id) % partition_count as u64) as u32
}

/// Stable 64-bit hash of a stream key (first 8 bytes of its SHA-256).
pub fn stream_hash(stream_id: &str) -> u64 {
    let digest = Sha256::digest(stream_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Whether `partition` belongs to the instance at `instance_index` out of
/// `instance_count` live instances (sorted by instance id).
pub fn is_assigned(partition: u32, instance_index: usize, instance_count: usize) -> bool {
    instance_count > 0 && partition as usize % instance_count == instance_index
}

/// Number of partitions owned by the instance at `instance_index`.
pub fn assignment_size(partition_count: u32, instance_index: usize, instance_count: usize) -> u32 {
    (0..partition_count)
        .filter(|p| is_assigned(*p, instance_index, instance_count))
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable() {
        let a = partition_for_stream("order-1", 10_000);
        let b = partition_for_stream("order-1", 10_000);
        assert_eq!(a, b);
        assert!(a < 10_000);
    }

    #[test]
    fn test_different_streams_usually_differ() {
        let a = partition_for_stream("order-1", 10_000);
        let b = partition_for_stream("order-2", 10_000);
        assert_ne!(a, b);
    }

    #[test]
    fn test_assignment_partitions_are_disjoint_and_complete() {
        let partition_count = 101;
        let instances = 3;
        let mut owned = vec![0u32; instances];
        for p in 0..partition_count {
            let owners: Vec<usize> = (0..instances)
                .filter(|k| is_assigned(p, *k, instances))
                .collect();
            assert_eq!(owners.len(), 1, "partition {} has {} owners", p, owners.len());
            owned[owners[0]] += 1;
        }
        // Fairness: each instance owns floor(P/n) or ceil(P/n) partitions.
        let floor = partition_count / instances as u32;
        let ceil = floor + 1;
        for count in owned {
            assert!(count == floor || count == ceil);
        }
    }

    #[test]
    fn test_single_instance_owns_everything() {
        for p in 0..100 {
            assert!(is_assigned(p, 0, 1));
        }
        assert_eq!(assignment_size(100, 0, 1), 100);
    }
}
