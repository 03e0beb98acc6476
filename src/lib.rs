//! Wallet Holdings Aggregator Library
//!
//! This library crate defines the modules that make up the aggregation node.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`aggregation`**: The job orchestrator. Fans a wallet request out into
//!   `(provider, chain)` work items, folds their results back, and finalizes each job
//!   exactly once (drained, or timed out by the sweeper).
//! - **`providers`**: The adapter boundary to external data providers, their error
//!   taxonomy and the mapping of provider payloads into wallet items.
//! - **`queue`**: An in-process, lease-based message queue with topic wildcards, delayed
//!   delivery, redelivery and dead-lettering, plus competing-consumer worker pools.
//! - **`storage`**: A sharded in-memory key-value store with per-key TTLs and atomic
//!   per-key updates.
//! - **`config`**: Command line / environment configuration.

pub mod aggregation;
pub mod config;
pub mod providers;
pub mod queue;
pub mod storage;
