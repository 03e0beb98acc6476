//! Message Queue Module
//!
//! The transport between the aggregation stages. Producers publish JSON messages on
//! string topics; pools of competing consumers claim them.
//!
//! ## Delivery Model
//! The queue follows a **Pull-based** model with **Lease** management:
//! 1. **Publish**: A message is stored as `Pending`, optionally with a visibility delay.
//! 2. **Claim**: A worker takes a lease on one available message (`InFlight`).
//! 3. **Settle**: On success the message is acked; on error it is released and will be
//!    redelivered. If the worker dies, the lease expires and another worker picks the
//!    message up (at-least-once semantics).
//!
//! ## Submodules
//! - **`queue`**: Message storage, claiming, leases, redelivery and dead-lettering.
//! - **`consumer`**: Worker pools that poll the queue and run a handler per message.
//! - **`types`**: Envelopes, delivery states and topic patterns.

pub mod consumer;
pub mod queue;
pub mod types;

pub use consumer::QueueConsumer;
pub use queue::MessageQueue;
pub use types::{DeliveryStatus, Envelope, MessageId, QueueStats, TopicPattern};

#[cfg(test)]
mod tests;
