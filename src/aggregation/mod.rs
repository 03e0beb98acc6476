//! Aggregation Module
//!
//! Turns "aggregate this wallet on these chains" into a job of `(provider, chain)` work
//! items, fans them out over the queue, folds the results back into one consolidated
//! output and announces the job's terminal status exactly once.
//!
//! ## Job Lifecycle
//! 1. **Start**: `AggregationService` coalesces duplicate starts onto the in-flight job
//!    or creates a new one and dispatches its work items.
//! 2. **Execute**: `RequestWorker` calls the provider, retrying transient failures and
//!    expanding the job with follow-up work items.
//! 3. **Aggregate**: `ResultAggregator` records each result once, updates the counters
//!    and finalizes the job when its pending set drains.
//! 4. **Timeout**: `TimeoutSweeper` finalizes jobs that outlive the job timeout. A late
//!    result may still upgrade such a job to `Completed`.
//!
//! ## Submodules
//! - **`types`**: Job ids, work keys, counters, lifecycle state, wallet items.
//! - **`protocol`**: Topics, queue messages and HTTP DTOs.
//! - **`store`**: The job store and its atomic operations.
//! - **`service`** / **`handlers`**: Client entry point and its HTTP surface.
//! - **`dispatcher`**, **`worker`**, **`expansion`**, **`aggregator`**, **`sweeper`**,
//!   **`completion`**: The pipeline stages.
//! - **`orchestrator`**: Wires the stages to the queue.

pub mod aggregator;
pub mod completion;
pub mod dispatcher;
pub mod expansion;
pub mod handlers;
pub mod orchestrator;
pub mod protocol;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod worker;

pub use orchestrator::Orchestrator;
pub use service::AggregationService;
pub use store::JobStore;

#[cfg(test)]
mod tests;
