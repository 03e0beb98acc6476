use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Default number of shards a store map is split into.
pub const DEFAULT_PARTITIONS: u32 = 64;

/// Maps string keys onto a fixed number of partitions.
#[derive(Debug, Clone)]
pub struct Partitioner {
    pub num_partitions: u32,
}

impl Partitioner {
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
        }
    }

    pub fn get_partition(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as u32;
        hash % self.num_partitions
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}
