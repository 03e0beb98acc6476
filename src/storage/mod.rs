//! Key-Value Storage Module
//!
//! Implements the partitioned, TTL-bound in-memory key-value store that holds all
//! shared aggregation state.
//!
//! ## Core Concepts
//! - **Partitioning**: Keys are hashed onto a fixed set of shards (`Partitioner`).
//! - **Expiry**: Every entry carries a deadline; expired entries are invisible and get
//!   purged lazily, so nothing needs to be deleted explicitly.
//! - **Atomic updates**: `TtlMap::update` and `TtlMap::compute` run a closure under the
//!   key's shard lock. Multi-field job mutations are built on these.

pub mod memory;
pub mod partitioner;

pub use memory::{TtlMap, now_ms};
