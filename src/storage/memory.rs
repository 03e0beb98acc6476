use super::partitioner::Partitioner;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    expires_at: u64,
}

impl<V> Slot<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now_ms().saturating_add(ttl_ms(ttl)),
        }
    }

    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }

    fn remaining(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }
}

/// A partitioned key-value map where every entry carries an expiry.
///
/// Expired entries are invisible to every read and update; they are physically
/// dropped by `purge_expired` or overwritten by the next insert. All mutation of a
/// single key happens under that key's shard lock, which makes `update` and
/// `compute` the atomic read-modify-write primitives the job store is built on.
pub struct TtlMap<K, V> {
    partitions: Vec<DashMap<K, Slot<V>>>,
    partitioner: Partitioner,
}

impl<K, V> TtlMap<K, V>
where
    K: ToString + Clone + Hash + Eq,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_partitioner(Partitioner::default())
    }

    pub fn with_partitioner(partitioner: Partitioner) -> Self {
        let partitions = (0..partitioner.num_partitions)
            .map(|_| DashMap::new())
            .collect();

        Self {
            partitions,
            partitioner,
        }
    }

    fn shard(&self, key: &K) -> &DashMap<K, Slot<V>> {
        let partition = self.partitioner.get_partition(&key.to_string());
        &self.partitions[partition as usize]
    }

    /// Inserts or overwrites a value, resetting its TTL.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        self.shard(&key).insert(key, Slot::new(value, ttl));
    }

    /// Inserts only when no live entry exists for the key.
    ///
    /// Returns `true` if this call wrote the value.
    pub fn insert_if_absent(&self, key: K, value: V, ttl: Duration) -> bool {
        let now = now_ms();
        match self.shard(&key).entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(Slot::new(value, ttl));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl));
                true
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = now_ms();
        self.shard(key)
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    /// Remaining lifetime of a live entry.
    pub fn ttl_remaining(&self, key: &K) -> Option<Duration> {
        let now = now_ms();
        self.shard(key)
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.remaining(now))
    }

    /// Atomically mutates a live entry in place. `None` if the key is absent or expired.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.update_with_ttl(key, |value, _| f(value))
    }

    /// Like `update`, but also hands the closure the entry's remaining TTL.
    pub fn update_with_ttl<R>(&self, key: &K, f: impl FnOnce(&mut V, Duration) -> R) -> Option<R> {
        let now = now_ms();
        let mut slot = self.shard(key).get_mut(key)?;
        if !slot.is_live(now) {
            return None;
        }
        let remaining = slot.remaining(now);
        Some(f(&mut slot.value, remaining))
    }

    /// Read-decide-write under the key lock.
    ///
    /// `f` sees the current live value (if any) and returns the value to store next to
    /// its own result. `Some(v)` stores `v` with a fresh TTL; `None` leaves the entry
    /// untouched. The closure's result is handed back to the caller.
    pub fn compute<R>(
        &self,
        key: K,
        ttl: Duration,
        f: impl FnOnce(Option<&V>) -> (Option<V>, R),
    ) -> R {
        let now = now_ms();
        match self.shard(&key).entry(key) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let (next, result) = f(current.is_live(now).then_some(&current.value));
                if let Some(value) = next {
                    occupied.insert(Slot::new(value, ttl));
                }
                result
            }
            Entry::Vacant(vacant) => {
                let (next, result) = f(None);
                if let Some(value) = next {
                    vacant.insert(Slot::new(value, ttl));
                }
                result
            }
        }
    }

    /// Removes the entry only if `predicate` holds for its live value.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> bool {
        let now = now_ms();
        self.shard(key)
            .remove_if(key, |_, slot| slot.is_live(now) && predicate(&slot.value))
            .is_some()
    }

    pub fn live_keys(&self) -> Vec<K> {
        let now = now_ms();
        self.partitions
            .iter()
            .flat_map(|partition| {
                partition
                    .iter()
                    .filter(|entry| entry.value().is_live(now))
                    .map(|entry| entry.key().clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_ms();
        let mut purged = 0;
        for partition in &self.partitions {
            let before = partition.len();
            partition.retain(|_, slot| slot.is_live(now));
            purged += before - partition.len();
        }
        purged
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        let now = now_ms();
        self.partitions
            .iter()
            .map(|partition| {
                partition
                    .iter()
                    .filter(|entry| entry.value().is_live(now))
                    .count()
            })
            .sum()
    }
}

impl<K, V> Default for TtlMap<K, V>
where
    K: ToString + Clone + Hash + Eq,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
